//! Attention modules consumed by the decoder.
//!
//! Every module maps a decoder query and the encoder output to an alignment over
//! encoder frames plus the matching context vector:
//!
//! - query: [batch, steps, hidden]
//! - keys (encoder output): [batch, time, hidden]
//! - prev_alpha: [batch, time], absent on the first step
//! - window: additive log-weights [batch, steps, time]
//!
//! returning `(alpha [batch, steps, time], summary [batch, steps, hidden])`.

use std::sync::Arc;

use candle::{Module, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};
use serde::Deserialize;

pub trait Attention: std::fmt::Debug + Send + Sync {
    fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        prev_alpha: Option<&Tensor>,
        window: Option<&Tensor>,
        encoder_lengths: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)>;

    /// Whether the module reads the previous step's alignment. Such modules can only
    /// be run one step at a time.
    fn requires_previous_alpha(&self) -> bool {
        false
    }
}

/// Attention variant selection, deserialized from the model config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionConfig {
    #[default]
    Content,
    NeuralContent {
        dim: usize,
    },
    SimpleLocation {
        kernel: usize,
    },
}

pub fn build(cfg: &AttentionConfig, hidden_size: usize, vb: VarBuilder) -> Result<Arc<dyn Attention>> {
    let attention: Arc<dyn Attention> = match cfg {
        AttentionConfig::Content => Arc::new(ContentAttention::new()),
        AttentionConfig::NeuralContent { dim } => {
            Arc::new(NeuralContentAttention::new(hidden_size, *dim, vb)?)
        }
        AttentionConfig::SimpleLocation { kernel } => {
            Arc::new(SimpleLocationAttention::new(*kernel, vb)?)
        }
    };
    Ok(attention)
}

/// Additive mask hiding frames at or beyond each sequence's length: [batch, 1, time].
fn length_mask(lengths: &[usize], batch_size: usize, time: usize, like: &Tensor) -> Result<Tensor> {
    if lengths.len() != batch_size {
        candle::bail!(
            "got {} encoder lengths for a batch of {batch_size}",
            lengths.len()
        )
    }
    let mut mask = vec![0f32; batch_size * time];
    for (b, &len) in lengths.iter().enumerate() {
        let len = len.clamp(1, time);
        mask[b * time + len..(b + 1) * time].fill(f32::NEG_INFINITY);
    }
    Tensor::from_vec(mask, (batch_size, 1, time), like.device())?.to_dtype(like.dtype())
}

/// Masks the raw scores, normalizes over time and pools the encoder output.
fn attend(
    scores: Tensor,
    keys: &Tensor,
    window: Option<&Tensor>,
    encoder_lengths: Option<&[usize]>,
) -> Result<(Tensor, Tensor)> {
    let (batch_size, _, time) = scores.dims3()?;
    let mut scores = scores;
    if let Some(window) = window {
        scores = scores.broadcast_add(&window.to_dtype(scores.dtype())?)?;
    }
    if let Some(lengths) = encoder_lengths {
        scores = scores.broadcast_add(&length_mask(lengths, batch_size, time, &scores)?)?;
    }
    let alpha = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let summary = alpha.matmul(&keys.contiguous()?)?;
    Ok((alpha, summary))
}

fn ensure_frames(keys: &Tensor) -> Result<()> {
    if keys.dim(1)? == 0 {
        candle::bail!("cannot attend over an encoder output without frames")
    }
    Ok(())
}

fn dot_scores(query: &Tensor, keys: &Tensor) -> Result<Tensor> {
    query.contiguous()?.matmul(&keys.t()?)
}

/// Dot-product attention: `score(q, k) = q · k`.
#[derive(Debug, Clone)]
pub struct ContentAttention {
    span: tracing::Span,
}

impl ContentAttention {
    pub fn new() -> Self {
        Self {
            span: tracing::span!(tracing::Level::TRACE, "content-attn"),
        }
    }
}

impl Default for ContentAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl Attention for ContentAttention {
    fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        _prev_alpha: Option<&Tensor>,
        window: Option<&Tensor>,
        encoder_lengths: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        ensure_frames(keys)?;
        attend(dot_scores(query, keys)?, keys, window, encoder_lengths)
    }
}

/// Additive (Bahdanau) attention: `score(q, k) = vᵀ tanh(W_q q + W_k k)`.
#[derive(Debug, Clone)]
pub struct NeuralContentAttention {
    query_proj: Linear,
    key_proj: Linear,
    score_proj: Linear,
    span: tracing::Span,
}

impl NeuralContentAttention {
    pub fn new(hidden_size: usize, attn_dim: usize, vb: VarBuilder) -> Result<Self> {
        let query_proj = candle_nn::linear_no_bias(hidden_size, attn_dim, vb.pp("query"))?;
        let key_proj = candle_nn::linear(hidden_size, attn_dim, vb.pp("key"))?;
        let score_proj = candle_nn::linear_no_bias(attn_dim, 1, vb.pp("score"))?;
        Ok(Self {
            query_proj,
            key_proj,
            score_proj,
            span: tracing::span!(tracing::Level::TRACE, "neural-content-attn"),
        })
    }
}

impl Attention for NeuralContentAttention {
    fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        _prev_alpha: Option<&Tensor>,
        window: Option<&Tensor>,
        encoder_lengths: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        ensure_frames(keys)?;
        // [batch, steps, 1, dim] + [batch, 1, time, dim]
        let q = self.query_proj.forward(query)?.unsqueeze(2)?;
        let k = self.key_proj.forward(keys)?.unsqueeze(1)?;
        let hidden = q.broadcast_add(&k)?.tanh()?;
        let scores = self.score_proj.forward(&hidden)?.squeeze(D::Minus1)?;
        attend(scores, keys, window, encoder_lengths)
    }
}

/// Content attention biased by a 1-D convolution over the previous alignment.
///
/// The convolution keeps the time length, so the kernel size must be odd.
#[derive(Debug, Clone)]
pub struct SimpleLocationAttention {
    conv: Conv1d,
    span: tracing::Span,
}

impl SimpleLocationAttention {
    pub fn new(kernel: usize, vb: VarBuilder) -> Result<Self> {
        if kernel % 2 == 0 {
            candle::bail!("location attention kernel must be odd, got {kernel}")
        }
        let cfg = Conv1dConfig {
            padding: kernel / 2,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(1, 1, kernel, cfg, vb.pp("conv"))?;
        Ok(Self {
            conv,
            span: tracing::span!(tracing::Level::TRACE, "location-attn"),
        })
    }
}

impl Attention for SimpleLocationAttention {
    fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        prev_alpha: Option<&Tensor>,
        window: Option<&Tensor>,
        encoder_lengths: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        ensure_frames(keys)?;
        if query.dim(1)? != 1 {
            candle::bail!("location attention only supports one decoder step at a time")
        }
        let mut scores = dot_scores(query, keys)?;
        if let Some(prev) = prev_alpha {
            // [batch, time] -> [batch, 1, time]
            let location = self.conv.forward(&prev.unsqueeze(1)?.contiguous()?)?;
            scores = scores.add(&location)?;
        }
        attend(scores, keys, window, encoder_lengths)
    }

    fn requires_previous_alpha(&self) -> bool {
        true
    }
}
