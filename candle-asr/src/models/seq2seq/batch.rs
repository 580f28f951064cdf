//! Adapter exposing the decoder to an external beam search driver.
//!
//! The driver owns the hypotheses and passes opaque state handles back and forth;
//! it calls [`BatchDecodeAdapter::update`] once per output position with the last
//! token and state of every live hypothesis.
use std::sync::Arc;

use candle::{Device, Result, Tensor};

use super::criterion::Seq2SeqCriterion;
use super::state::DecoderState;

pub struct BatchDecodeAdapter<'a> {
    criterion: &'a Seq2SeqCriterion,
    device: Device,
    input: Option<Tensor>,
    attention_threshold: i64,
    smoothing_temperature: f32,
    initial_state: DecoderState,
}

impl<'a> BatchDecodeAdapter<'a> {
    pub fn new(
        criterion: &'a Seq2SeqCriterion,
        attention_threshold: i64,
        smoothing_temperature: f32,
        device: &Device,
    ) -> Self {
        Self {
            criterion,
            device: device.clone(),
            input: None,
            attention_threshold,
            smoothing_temperature,
            initial_state: DecoderState::new(criterion.config().n_attn_round),
        }
    }

    /// Scores the next token of every hypothesis.
    ///
    /// `emissions` is the encoder output of one utterance, `t_len` frames of `n`
    /// values each, and is read on the first call (`t == 0`). At `t == 0` tokens and
    /// previous states are ignored and every hypothesis starts afresh. Returns the
    /// log-probabilities over the vocabulary per hypothesis and its next state,
    /// `None` for hypotheses whose attention jumped too far.
    pub fn update(
        &mut self,
        emissions: &[f32],
        n: usize,
        t_len: usize,
        tokens: &[u32],
        prev_states: &[Option<Arc<DecoderState>>],
        t: usize,
    ) -> Result<(Vec<Vec<f32>>, Vec<Option<Arc<DecoderState>>>)> {
        if t == 0 {
            if emissions.len() != n * t_len {
                candle::bail!(
                    "expected {} emissions for {t_len} frames of {n} values, got {}",
                    n * t_len,
                    emissions.len()
                )
            }
            self.input = Some(Tensor::from_slice(emissions, (1, t_len, n), &self.device)?);
        }
        let input = match &self.input {
            Some(input) => input,
            None => candle::bail!("decoding must start at t = 0"),
        };
        if tokens.len() != prev_states.len() {
            candle::bail!(
                "got {} tokens for {} hypotheses",
                tokens.len(),
                prev_states.len()
            )
        }

        let mut ys = Vec::with_capacity(tokens.len());
        let mut states = Vec::with_capacity(tokens.len());
        for (token, prev) in tokens.iter().zip(prev_states.iter()) {
            if t == 0 {
                ys.push(None);
                states.push(&self.initial_state);
            } else {
                match prev {
                    Some(prev) => states.push(prev.as_ref()),
                    None => candle::bail!("hypothesis without decoder state at t = {t}"),
                }
                ys.push(Some(*token));
            }
        }

        let (scores, next) = self.criterion.decode_batch_step(
            input,
            &ys,
            &states,
            self.attention_threshold,
            self.smoothing_temperature,
        )?;
        Ok((scores, next.into_iter().map(|s| s.map(Arc::new)).collect()))
    }
}
