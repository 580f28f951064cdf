//! Attention-based sequence-to-sequence decoder for speech recognition.
//!
//! The decoder consumes encoder output `[batch, time, hidden]` and emits tokens
//! autoregressively. Each decode step embeds the previous token (or a learned
//! start embedding), then runs `n_attn_round` rounds of GRU cell followed by
//! attention over the encoder output, and finally projects to the vocabulary.
//!
//! Training supports teacher forcing, scheduled sampling (random mixing, model
//! argmax or Gumbel soft inputs) and label smoothing. Inference supports greedy
//! (Viterbi) decoding, beam search, and a batched single-step interface for
//! external drivers such as lexicon or language model fused beam search.
//!
//! - [Listen, Attend and Spell](https://arxiv.org/abs/1508.01211)
//! - [Scheduled Sampling](https://arxiv.org/abs/1506.03099)

pub mod attention;
pub mod batch;
pub mod beam;
pub mod criterion;
pub mod rnn;
pub mod state;
pub mod window;

use std::str::FromStr;

use serde::Deserialize;

pub use attention::{Attention, AttentionConfig};
pub use batch::BatchDecodeAdapter;
pub use beam::{beam_search, BeamStep, CandidateHypo};
pub use criterion::{Seq2SeqCriterion, StepInput};
pub use state::{concat_states, select_state, DecoderState};
pub use window::{AttentionWindow, WindowConfig};

/// How the next decoder input is picked when the gold token is not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// A uniformly random token, excluding the last vocabulary entry.
    #[default]
    Rand,
    /// The model's own best prediction. Requires sequential decoding.
    Model,
    /// A soft input drawn with the Gumbel-softmax relaxation.
    Gumbel,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rand => "rand",
            Self::Model => "model",
            Self::Gumbel => "gumbel",
        }
    }
}

impl FromStr for SamplingStrategy {
    type Err = candle::Error;

    fn from_str(s: &str) -> candle::Result<Self> {
        match s {
            "rand" => Ok(Self::Rand),
            "model" => Ok(Self::Model),
            "gumbel" => Ok(Self::Gumbel),
            _ => candle::bail!("unknown sampling strategy {s:?}, expected rand, model or gumbel"),
        }
    }
}

impl std::fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_eos_id")]
    pub eos_id: u32,
    #[serde(default = "default_pad_id")]
    pub pad_id: u32,
    #[serde(default = "default_max_decoder_output_len")]
    pub max_decoder_output_len: usize,
    #[serde(default = "default_one")]
    pub n_attn_round: usize,
    #[serde(default = "default_one")]
    pub n_rnn_layers: usize,
    #[serde(default)]
    pub dropout: f32,
    /// Percentage of steps fed with the gold token while training.
    #[serde(default = "default_pct_teacher_forcing")]
    pub pct_teacher_forcing: u32,
    #[serde(default)]
    pub label_smoothing: f64,
    #[serde(default)]
    pub input_feeding: bool,
    #[serde(default)]
    pub sampling_strategy: SamplingStrategy,
    #[serde(default = "default_gumbel_temperature")]
    pub gumbel_temperature: f64,
    /// Apply the attention window while training too, not only at inference.
    #[serde(default)]
    pub train_with_window: bool,
    #[serde(default)]
    pub attention: AttentionConfig,
    #[serde(default)]
    pub window: Option<WindowConfig>,
    /// Seed for sampling randomness, drawn from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_vocab_size() -> usize {
    31
}
fn default_hidden_size() -> usize {
    256
}
// Letter dictionaries place eos and pad after the 29 base tokens.
fn default_eos_id() -> u32 {
    29
}
fn default_pad_id() -> u32 {
    30
}
fn default_max_decoder_output_len() -> usize {
    200
}
fn default_one() -> usize {
    1
}
fn default_pct_teacher_forcing() -> u32 {
    100
}
fn default_gumbel_temperature() -> f64 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            eos_id: default_eos_id(),
            pad_id: default_pad_id(),
            max_decoder_output_len: default_max_decoder_output_len(),
            n_attn_round: 1,
            n_rnn_layers: 1,
            dropout: 0.0,
            pct_teacher_forcing: default_pct_teacher_forcing(),
            label_smoothing: 0.0,
            input_feeding: false,
            sampling_strategy: SamplingStrategy::Rand,
            gumbel_temperature: default_gumbel_temperature(),
            train_with_window: false,
            attention: AttentionConfig::Content,
            window: None,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> candle::Result<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> candle::Result<()> {
        if self.vocab_size < 2 {
            candle::bail!("vocab_size must be at least 2, got {}", self.vocab_size)
        }
        if self.hidden_size == 0 {
            candle::bail!("hidden_size must be positive")
        }
        if self.eos_id as usize >= self.vocab_size {
            candle::bail!("eos_id {} outside vocabulary of {}", self.eos_id, self.vocab_size)
        }
        if self.pad_id as usize >= self.vocab_size {
            candle::bail!("pad_id {} outside vocabulary of {}", self.pad_id, self.vocab_size)
        }
        if self.n_attn_round == 0 {
            candle::bail!("n_attn_round must be positive")
        }
        if self.n_rnn_layers == 0 {
            candle::bail!("n_rnn_layers must be positive")
        }
        if self.pct_teacher_forcing > 100 {
            candle::bail!(
                "pct_teacher_forcing must be within 0..=100, got {}",
                self.pct_teacher_forcing
            )
        }
        if !(0.0..1.0).contains(&self.dropout) {
            candle::bail!("dropout must be within [0, 1), got {}", self.dropout)
        }
        if !(0.0..=1.0).contains(&self.label_smoothing) {
            candle::bail!("label_smoothing must be within [0, 1], got {}", self.label_smoothing)
        }
        if self.gumbel_temperature <= 0.0 {
            candle::bail!("gumbel_temperature must be positive")
        }
        Ok(())
    }
}
