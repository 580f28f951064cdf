//! Seq2seq criterion: loss computation, greedy and beam decoding.
use std::sync::Arc;

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::attention::{self, Attention};
use super::beam::{self, BeamStep, CandidateHypo};
use super::rnn::DecoderRnn;
use super::state::{concat_states, select_state, DecoderState};
use super::window::{self, AttentionWindow};
use super::{Config, SamplingStrategy};

const GUMBEL_EPS: f64 = 1e-7;

/// The previous token fed to a decode step.
#[derive(Debug, Clone)]
pub enum StepInput {
    /// Token ids: [batch] u32.
    Tokens(Tensor),
    /// A distribution over the vocabulary used as a soft token: [batch, vocab].
    Soft(Tensor),
}

impl StepInput {
    fn batch_size(&self) -> Result<usize> {
        match self {
            Self::Tokens(ids) => Ok(ids.elem_count()),
            Self::Soft(probs) => probs.dim(0),
        }
    }
}

/// Broadcasts a single utterance to `batch` hypotheses.
fn expand_batch(input: &Tensor, batch: usize) -> Result<Tensor> {
    let (b, t, h) = input.dims3()?;
    if b == batch {
        Ok(input.clone())
    } else if b == 1 {
        input.broadcast_as((batch, t, h))?.contiguous()
    } else {
        candle::bail!("cannot expand encoder output of batch {b} to {batch} hypotheses")
    }
}

/// Attention-based decoder with its training loss.
///
/// Parameters are loaded from:
/// - `embedding.weight`: [vocab, hidden]
/// - `rnn.{i}.{k}.*`: GRU layer k of attention round i
/// - `linear_out.{weight,bias}`: output projection
/// - `attention.{i}.*`: parameters of the attention module of round i, if any
/// - `start_embedding`: [hidden], input of the first decode step
#[derive(Debug, Clone)]
pub struct Seq2SeqCriterion {
    embedding: Embedding,
    rnns: Vec<DecoderRnn>,
    linear_out: Linear,
    attentions: Vec<Arc<dyn Attention>>,
    window: Option<Arc<dyn AttentionWindow>>,
    start_embedding: Tensor,
    cfg: Config,
    use_sequential_decoder: bool,
    train: bool,
    rng: StdRng,
    span: tracing::Span,
    batch_span: tracing::Span,
}

impl Seq2SeqCriterion {
    pub fn new(
        cfg: Config,
        attentions: Vec<Arc<dyn Attention>>,
        window: Option<Arc<dyn AttentionWindow>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        cfg.validate()?;
        if attentions.len() != cfg.n_attn_round {
            candle::bail!(
                "got {} attention modules for {} attention rounds",
                attentions.len(),
                cfg.n_attn_round
            )
        }
        let hidden = cfg.hidden_size;
        let embedding = candle_nn::embedding(cfg.vocab_size, hidden, vb.pp("embedding"))?;
        let rnns = (0..cfg.n_attn_round)
            .map(|i| {
                DecoderRnn::new(
                    hidden,
                    hidden,
                    cfg.n_rnn_layers,
                    cfg.dropout,
                    vb.pp(format!("rnn.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let linear_out = candle_nn::linear(hidden, cfg.vocab_size, vb.pp("linear_out"))?;
        let start_embedding = vb.get_with_hints(
            hidden,
            "start_embedding",
            Init::Uniform { lo: -0.1, up: 0.1 },
        )?;

        let use_sequential_decoder = (cfg.pct_teacher_forcing < 100
            && cfg.sampling_strategy == SamplingStrategy::Model)
            || cfg.sampling_strategy == SamplingStrategy::Gumbel
            || cfg.input_feeding
            || attentions.iter().any(|a| a.requires_previous_alpha())
            || window.as_ref().is_some_and(|w| w.requires_previous_alpha());
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        tracing::debug!(
            sequential = use_sequential_decoder,
            sampling = %cfg.sampling_strategy,
            "built seq2seq criterion"
        );

        Ok(Self {
            embedding,
            rnns,
            linear_out,
            attentions,
            window,
            start_embedding,
            cfg,
            use_sequential_decoder,
            train: true,
            rng,
            span: tracing::span!(tracing::Level::TRACE, "s2s-decode-step"),
            batch_span: tracing::span!(tracing::Level::TRACE, "s2s-decode-batch-step"),
        })
    }

    /// Builds attention modules and the window from `cfg` as well.
    pub fn from_config(cfg: Config, vb: VarBuilder) -> Result<Self> {
        let attentions = (0..cfg.n_attn_round)
            .map(|i| attention::build(&cfg.attention, cfg.hidden_size, vb.pp(format!("attention.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let window = cfg.window.as_ref().map(window::build);
        Self::new(cfg, attentions, window, vb)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Whether `forward` decodes step by step rather than over the whole target at once.
    pub fn use_sequential_decoder(&self) -> bool {
        self.use_sequential_decoder
    }

    pub fn train(&mut self) {
        self.train = true
    }

    pub fn eval(&mut self) {
        self.train = false
    }

    pub fn is_training(&self) -> bool {
        self.train
    }

    /// Runs `f` in evaluation mode, restoring the previous mode afterwards.
    fn with_eval<T>(&mut self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let was_training = self.train;
        self.train = false;
        let res = f(self);
        self.train = was_training;
        res
    }

    fn window_active(&self) -> bool {
        self.window.is_some() && (!self.train || self.cfg.train_with_window)
    }

    /// Computes the per-sequence loss.
    ///
    /// input: encoder output [batch, time, hidden], target: [batch, target_len].
    /// Returns `(losses [batch], log_probs [batch, target_len, vocab])`. The loss sums
    /// the cross entropy over non-pad positions; with label smoothing while training
    /// it becomes `(1 - eps) * ce - eps / vocab * sum(log_probs)` and the returned
    /// log-probs are zeroed at pad positions.
    pub fn forward(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let target = target.to_dtype(DType::U32)?;
        let (batch_size, target_len) = target.dims2()?;
        if target_len == 0 {
            candle::bail!("empty target sequence")
        }
        if input.dim(0)? != batch_size {
            candle::bail!(
                "encoder batch {} does not match target batch {batch_size}",
                input.dim(0)?
            )
        }
        let (logits, _alpha) = if self.use_sequential_decoder {
            self.sequential_decoder(input, &target, input_sizes, target_sizes)?
        } else {
            self.vectorized_decoder(input, &target, input_sizes, target_sizes)?
        };

        let logp = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let mask = target
            .ne(self.cfg.pad_id)?
            .to_dtype(logp.dtype())?;
        let ce = logp
            .gather(&target.unsqueeze(2)?.contiguous()?, 2)?
            .squeeze(2)?
            .neg()?;
        let losses = (ce * &mask)?.sum(1)?;

        let eps = self.cfg.label_smoothing;
        if self.train && eps > 0.0 {
            let n_class = self.cfg.vocab_size as f64;
            let masked = logp.broadcast_mul(&mask.unsqueeze(2)?)?;
            let smooth = masked.sum((1, 2))?;
            let losses = (losses.affine(1.0 - eps, 0.0)? - smooth.affine(eps / n_class, 0.0)?)?;
            Ok((losses, masked))
        } else {
            Ok((losses, logp))
        }
    }

    /// Uniform draw over the vocabulary without the end token.
    fn random_token(&mut self) -> u32 {
        let token = self.rng.random_range(0..self.cfg.vocab_size as u32 - 1);
        if token >= self.cfg.eos_id {
            token + 1
        } else {
            token
        }
    }

    /// Replaces each gold token by a random one with probability `1 - pct / 100`.
    fn mix_random_tokens(&mut self, gold: &Tensor) -> Result<Tensor> {
        let shape = gold.shape().clone();
        let pct = self.cfg.pct_teacher_forcing as f64;
        let mut tokens = gold.flatten_all()?.to_vec1::<u32>()?;
        for token in tokens.iter_mut() {
            if self.rng.random::<f64>() * 100.0 > pct {
                *token = self.random_token();
            }
        }
        Tensor::from_vec(tokens, shape, gold.device())
    }

    fn gumbel_noise(&mut self, shape: &[usize], device: &Device) -> Result<Tensor> {
        let n: usize = shape.iter().product();
        let noise: Vec<f32> = (0..n)
            .map(|_| {
                let u = (1.0 - 2.0 * GUMBEL_EPS) * self.rng.random::<f64>() + GUMBEL_EPS;
                -(-u.ln()).ln() as f32
            })
            .collect();
        Tensor::from_vec(noise, shape, device)
    }

    /// Teacher-forced decoding over the whole target in one pass per round.
    fn vectorized_decoder(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_size, target_len) = target.dims2()?;
        let time = input.dim(1)?;
        let hidden = self.cfg.hidden_size;

        let mut hy = self
            .start_embedding
            .reshape((1, 1, hidden))?
            .broadcast_as((batch_size, 1, hidden))?
            .contiguous()?;
        if target_len > 1 {
            // The last gold token is never fed back.
            let mut ys = target.narrow(1, 0, target_len - 1)?;
            if self.train && self.cfg.pct_teacher_forcing < 100 {
                match self.cfg.sampling_strategy {
                    SamplingStrategy::Model => {
                        candle::bail!("vectorized decoding does not support model sampling")
                    }
                    SamplingStrategy::Rand => ys = self.mix_random_tokens(&ys)?,
                    SamplingStrategy::Gumbel => {}
                }
            }
            let embedded = self.embedding.forward(&ys)?;
            hy = Tensor::cat(&[&hy, &embedded], 1)?;
        }

        let window = match &self.window {
            Some(window) if self.window_active() => Some(window.compute_vectorized_window(
                target_len,
                time,
                batch_size,
                input_sizes,
                target_sizes,
                input.device(),
            )?),
            _ => None,
        };

        let mut alpha = None;
        for (rnn, attention) in self.rnns.iter().zip(self.attentions.iter()) {
            hy = rnn.forward_seq(&hy, self.train)?;
            let (a, summaries) = attention.forward(&hy, input, None, window.as_ref(), input_sizes)?;
            hy = (hy + summaries)?;
            alpha = Some(a);
        }
        let alpha = match alpha {
            Some(alpha) => alpha,
            None => candle::bail!("decoder has no attention rounds"),
        };
        Ok((self.linear_out.forward(&hy)?, alpha))
    }

    /// Picks the input of the next decode step from this step's logits [batch, vocab].
    ///
    /// Returns the input and the logits to score. Gumbel sampling replaces the
    /// logits by the log-probabilities of the perturbed distribution.
    fn next_input(&mut self, logits: Tensor, gold: &Tensor) -> Result<(StepInput, Tensor)> {
        if !self.train {
            return Ok((StepInput::Tokens(gold.clone()), logits));
        }
        if self.cfg.sampling_strategy == SamplingStrategy::Gumbel {
            let noise = self
                .gumbel_noise(logits.dims(), logits.device())?
                .to_dtype(logits.dtype())?;
            let temperature = self.cfg.gumbel_temperature;
            let logp = candle_nn::ops::log_softmax(&((logits + noise)? / temperature)?, D::Minus1)?;
            let probs = logp.exp()?.detach();
            return Ok((StepInput::Soft(probs), logp));
        }
        let pct = self.cfg.pct_teacher_forcing as f64;
        let next = if self.rng.random::<f64>() * 100.0 <= pct {
            StepInput::Tokens(gold.clone())
        } else if self.cfg.sampling_strategy == SamplingStrategy::Model {
            StepInput::Tokens(logits.argmax(D::Minus1)?.detach())
        } else {
            let batch_size = logits.dim(0)?;
            let tokens: Vec<u32> = (0..batch_size).map(|_| self.random_token()).collect();
            StepInput::Tokens(Tensor::from_vec(tokens, batch_size, logits.device())?)
        };
        Ok((next, logits))
    }

    /// Step-by-step decoding, picking each next input with the sampling policy.
    fn sequential_decoder(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
    ) -> Result<(Tensor, Tensor)> {
        let target_len = target.dim(1)?;
        let mut state = DecoderState::new(self.cfg.n_attn_round);
        let mut y: Option<StepInput> = None;
        let mut outputs = Vec::with_capacity(target_len);
        let mut alphas = Vec::with_capacity(target_len);
        for u in 0..target_len {
            let (out, next) = self.decode_step(
                input,
                y.as_ref(),
                &state,
                input_sizes,
                target_sizes,
                target_len,
            )?;
            state = next;
            let gold = target.narrow(1, u, 1)?.squeeze(1)?;
            let (next_y, out) = self.next_input(out, &gold)?;
            y = Some(next_y);

            outputs.push(out);
            match &state.alpha {
                Some(alpha) => alphas.push(alpha.clone()),
                None => candle::bail!("decode step produced no attention"),
            }
        }
        Ok((Tensor::stack(&outputs, 1)?, Tensor::stack(&alphas, 1)?))
    }

    /// Advances the decoder by one token.
    ///
    /// input: encoder output [batch, time, hidden]; a single utterance is broadcast
    /// to the batch of `y`. `y` of `None` starts decoding from the learned start
    /// embedding. Returns logits [batch, vocab] and the next state.
    pub fn decode_step(
        &self,
        input: &Tensor,
        y: Option<&StepInput>,
        state: &DecoderState,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
        max_steps: usize,
    ) -> Result<(Tensor, DecoderState)> {
        let _enter = self.span.enter();
        let n_round = self.cfg.n_attn_round;
        if state.n_attn_round() != n_round {
            candle::bail!(
                "state has {} attention rounds, decoder has {n_round}",
                state.n_attn_round()
            )
        }
        let batch_size = match y {
            Some(y) => y.batch_size()?,
            None => input.dim(0)?,
        };
        let input = expand_batch(input, batch_size)?;
        let time = input.dim(1)?;

        let mut hy = match y {
            None => self
                .start_embedding
                .unsqueeze(0)?
                .broadcast_as((batch_size, self.cfg.hidden_size))?
                .contiguous()?,
            Some(StepInput::Tokens(ids)) => self.embedding.forward(&ids.flatten_all()?)?,
            Some(StepInput::Soft(probs)) => probs.matmul(self.embedding.embeddings())?,
        };
        if self.cfg.input_feeding && y.is_some() {
            match &state.summary {
                Some(summary) => hy = (hy + summary)?,
                None => candle::bail!("input feeding needs the previous attention summary"),
            }
        }

        let window = match &self.window {
            Some(window) if self.window_active() => Some(window.compute_window(
                state.alpha.as_ref(),
                state.step,
                max_steps,
                time,
                batch_size,
                input_sizes,
                target_sizes,
                input.device(),
            )?),
            _ => None,
        };

        let mut next = DecoderState::new(n_round);
        next.step = state.step + 1;
        for (i, (rnn, attention)) in self.rnns.iter().zip(self.attentions.iter()).enumerate() {
            let (out, hidden) = rnn.step(&hy, state.hidden[i].as_ref(), self.train)?;
            next.hidden[i] = Some(hidden);
            let (alpha, summary) = attention.forward(
                &out.unsqueeze(1)?,
                &input,
                state.alpha.as_ref(),
                window.as_ref(),
                input_sizes,
            )?;
            let summary = summary.squeeze(1)?;
            hy = (out + &summary)?;
            next.alpha = Some(alpha.squeeze(1)?);
            next.summary = Some(summary);
        }
        Ok((self.linear_out.forward(&hy)?, next))
    }

    /// Greedy decoding of a single utterance `[1, time, hidden]`.
    ///
    /// Stops at the end token, which is not part of the returned path, or after
    /// `max_decoder_output_len` tokens. With `save_attn` the attention of every step
    /// is returned as `[steps, time]`.
    pub fn viterbi_path_base(
        &mut self,
        input: &Tensor,
        input_sizes: Option<&[usize]>,
        save_attn: bool,
    ) -> Result<(Vec<u32>, Option<Tensor>)> {
        self.with_eval(|this| this.greedy_decode(input, input_sizes, save_attn))
    }

    pub fn viterbi_path(&mut self, input: &Tensor, input_sizes: Option<&[usize]>) -> Result<Vec<u32>> {
        Ok(self.viterbi_path_base(input, input_sizes, false)?.0)
    }

    fn greedy_decode(
        &self,
        input: &Tensor,
        input_sizes: Option<&[usize]>,
        save_attn: bool,
    ) -> Result<(Vec<u32>, Option<Tensor>)> {
        if input.dim(0)? != 1 {
            candle::bail!("greedy decoding expects a single utterance, got {}", input.dim(0)?)
        }
        let time = input.dim(1)?;
        let mut state = DecoderState::new(self.cfg.n_attn_round);
        let mut y = None;
        let mut path = Vec::new();
        let mut alphas = Vec::new();
        for _ in 0..self.cfg.max_decoder_output_len {
            let (logits, next) = self.decode_step(input, y.as_ref(), &state, input_sizes, None, time)?;
            state = next;
            let pred = logits.squeeze(0)?.argmax(0)?.to_scalar::<u32>()?;
            if save_attn {
                if let Some(alpha) = &state.alpha {
                    alphas.push(alpha.clone());
                }
            }
            if pred == self.cfg.eos_id {
                break;
            }
            y = Some(StepInput::Tokens(Tensor::new(&[pred], input.device())?));
            path.push(pred);
        }
        let alpha = if save_attn && !alphas.is_empty() {
            Some(Tensor::cat(&alphas, 0)?)
        } else {
            None
        };
        Ok((path, alpha))
    }

    /// Beam search over a single utterance `[1, time, hidden]` starting from `beam`.
    pub fn beam_search(
        &mut self,
        input: &Tensor,
        input_sizes: Option<&[usize]>,
        beam: Vec<CandidateHypo>,
        beam_size: usize,
        max_len: usize,
    ) -> Result<Vec<CandidateHypo>> {
        self.with_eval(|this| {
            let decoder = CriterionBeamStep {
                criterion: this,
                input,
                input_sizes,
            };
            beam::beam_search(&decoder, beam, beam_size, max_len)
        })
    }

    /// Best beam search path from an empty hypothesis.
    pub fn beam_path(
        &mut self,
        input: &Tensor,
        input_sizes: Option<&[usize]>,
        beam_size: usize,
    ) -> Result<Vec<u32>> {
        let beam = vec![CandidateHypo::new(self.cfg.n_attn_round)];
        let max_len = self.cfg.max_decoder_output_len;
        let hypos = self.beam_search(input, input_sizes, beam, beam_size, max_len)?;
        Ok(hypos.into_iter().next().map(|h| h.path).unwrap_or_default())
    }

    /// Advances independent hypotheses of one utterance in a single batched step.
    ///
    /// `ys[i]` is the last token of hypothesis i, `None` before its first token.
    /// Returns the temperature-smoothed log-probabilities of every hypothesis and
    /// its next state, or `None` when its attention peak moved further than
    /// `attention_threshold` frames.
    pub fn decode_batch_step(
        &self,
        input: &Tensor,
        ys: &[Option<u32>],
        states: &[&DecoderState],
        attention_threshold: i64,
        temperature: f32,
    ) -> Result<(Vec<Vec<f32>>, Vec<Option<DecoderState>>)> {
        let _enter = self.batch_span.enter();
        if ys.len() != states.len() {
            candle::bail!("got {} tokens for {} states", ys.len(), states.len())
        }
        if self.window_active() {
            candle::bail!("batched decoding does not support attention windows")
        }
        if temperature.is_nan() || temperature <= 0.0 {
            candle::bail!("smoothing temperature must be positive, got {temperature}")
        }
        let prev_batch = concat_states(states)?;
        if ys.iter().any(|y| y.is_some() != (prev_batch.step > 0)) {
            candle::bail!("tokens must be given exactly for hypotheses past step 0")
        }
        let batch_size = ys.len();
        let n_round = self.cfg.n_attn_round;
        let device = input.device();
        let input = expand_batch(input, batch_size)?;

        let mut rows = Vec::with_capacity(batch_size);
        for (y, state) in ys.iter().zip(states.iter()) {
            let row = match y {
                None => self.start_embedding.unsqueeze(0)?,
                Some(token) => {
                    let row = self.embedding.forward(&Tensor::new(&[*token], device)?)?;
                    match (&state.summary, self.cfg.input_feeding) {
                        (Some(summary), true) => (row + summary)?,
                        (None, true) => {
                            candle::bail!("input feeding needs the previous attention summary")
                        }
                        (_, false) => row,
                    }
                }
            };
            rows.push(row);
        }
        let mut hy = Tensor::cat(&rows, 0)?;

        let mut batched = DecoderState::new(n_round);
        let mut peaks = vec![];
        for (i, (rnn, attention)) in self.rnns.iter().zip(self.attentions.iter()).enumerate() {
            let (out, hidden) = rnn.step(&hy, prev_batch.hidden[i].as_ref(), self.train)?;
            let (alpha, summary) = attention.forward(&out.unsqueeze(1)?, &input, None, None, None)?;
            let (alpha, summary) = (alpha.squeeze(1)?, summary.squeeze(1)?);
            hy = (out + &summary)?;
            peaks = alpha.argmax(D::Minus1)?.to_vec1::<u32>()?;
            batched.hidden[i] = Some(hidden);
            batched.alpha = Some(alpha);
            batched.summary = Some(summary);
        }

        let logits = (self.linear_out.forward(&hy)? / temperature as f64)?;
        let logp = candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let mut next_states = Vec::with_capacity(batch_size);
        for (i, prev) in states.iter().enumerate() {
            let mut next = select_state(&batched, i)?;
            next.step = prev.step + 1;
            next.peak_attn_pos = peaks[i] as i64;
            next.is_valid = (next.peak_attn_pos - prev.peak_attn_pos).abs() <= attention_threshold;
            next_states.push(next.is_valid.then_some(next));
        }
        Ok((logp, next_states))
    }
}

/// Feeds batched beam hypotheses of one utterance through `decode_step`.
struct CriterionBeamStep<'a> {
    criterion: &'a Seq2SeqCriterion,
    input: &'a Tensor,
    input_sizes: Option<&'a [usize]>,
}

impl BeamStep for CriterionBeamStep<'_> {
    fn device(&self) -> &Device {
        self.input.device()
    }

    fn eos_id(&self) -> u32 {
        self.criterion.cfg.eos_id
    }

    fn step(
        &self,
        tokens: Option<&Tensor>,
        state: &DecoderState,
        n_hyps: usize,
    ) -> Result<(Tensor, DecoderState)> {
        let input = expand_batch(self.input, n_hyps)?;
        let input_sizes = match self.input_sizes {
            Some([size]) => Some(vec![*size; n_hyps]),
            Some(sizes) if sizes.len() == n_hyps => Some(sizes.to_vec()),
            Some(sizes) => candle::bail!("got {} input sizes for one utterance", sizes.len()),
            None => None,
        };
        let y = tokens.map(|ids| StepInput::Tokens(ids.clone()));
        let time = input.dim(1)?;
        self.criterion
            .decode_step(&input, y.as_ref(), state, input_sizes.as_deref(), None, time)
    }
}
