//! Per-hypothesis decoder state.
//!
//! A [`DecoderState`] is produced fresh by every decode step and never mutated
//! afterwards, so forking a beam is a plain clone (tensors are reference counted).
//! States with the same step count can be batched with [`concat_states`] and split
//! back with [`select_state`].
use candle::{Result, Tensor};

use crate::index::{Index, Range};

#[derive(Debug, Clone)]
pub struct DecoderState {
    /// Number of decode steps taken so far.
    pub step: usize,
    /// Recurrent hidden state per attention round: `[layers, batch, hidden]`.
    pub hidden: Vec<Option<Tensor>>,
    /// Attention weights of the last step: `[batch, time]`.
    pub alpha: Option<Tensor>,
    /// Attention context of the last step: `[batch, hidden]`.
    pub summary: Option<Tensor>,
    /// Position of the attention peak, -1 before the first batched step.
    pub peak_attn_pos: i64,
    /// False once the attention peak jumped further than the allowed threshold.
    pub is_valid: bool,
}

impl DecoderState {
    /// Empty state at the start of decoding.
    pub fn new(n_attn_round: usize) -> Self {
        Self {
            step: 0,
            hidden: vec![None; n_attn_round],
            alpha: None,
            summary: None,
            peak_attn_pos: -1,
            is_valid: false,
        }
    }

    pub fn n_attn_round(&self) -> usize {
        self.hidden.len()
    }

    /// Batch size held by the state, `None` while it is still empty.
    pub fn batch_size(&self) -> Result<Option<usize>> {
        if let Some(alpha) = &self.alpha {
            return Ok(Some(alpha.dim(0)?));
        }
        if let Some(summary) = &self.summary {
            return Ok(Some(summary.dim(0)?));
        }
        match self.hidden.iter().flatten().next() {
            Some(hidden) => Ok(Some(hidden.dim(1)?)),
            None => Ok(None),
        }
    }
}

fn cat_optional(parts: &[Option<&Tensor>], dim: usize, what: &str) -> Result<Option<Tensor>> {
    let present: Vec<&Tensor> = parts.iter().flatten().copied().collect();
    if present.is_empty() {
        Ok(None)
    } else if present.len() != parts.len() {
        candle::bail!("cannot concatenate states where only some hold a {what}")
    } else {
        Ok(Some(Tensor::cat(&present, dim)?))
    }
}

/// Batches per-hypothesis states along the batch axis.
///
/// All states must share the same `step` and `is_valid`; the peak position of the
/// first state is carried over.
pub fn concat_states(states: &[&DecoderState]) -> Result<DecoderState> {
    let first = match states.first() {
        Some(first) => *first,
        None => candle::bail!("cannot concatenate an empty list of decoder states"),
    };
    let n_attn_round = first.n_attn_round();
    for state in states {
        if state.step != first.step {
            candle::bail!("step unmatched: {} vs {}", state.step, first.step)
        }
        if state.is_valid != first.is_valid {
            candle::bail!("is_valid unmatched")
        }
        if state.n_attn_round() != n_attn_round {
            candle::bail!(
                "attention rounds unmatched: {} vs {n_attn_round}",
                state.n_attn_round()
            )
        }
    }

    let mut hidden = Vec::with_capacity(n_attn_round);
    for round in 0..n_attn_round {
        let parts: Vec<_> = states.iter().map(|s| s.hidden[round].as_ref()).collect();
        hidden.push(cat_optional(&parts, 1, "hidden state")?);
    }
    let alphas: Vec<_> = states.iter().map(|s| s.alpha.as_ref()).collect();
    let summaries: Vec<_> = states.iter().map(|s| s.summary.as_ref()).collect();

    Ok(DecoderState {
        step: first.step,
        hidden,
        alpha: cat_optional(&alphas, 0, "attention")?,
        summary: cat_optional(&summaries, 0, "summary")?,
        peak_attn_pos: first.peak_attn_pos,
        is_valid: first.is_valid,
    })
}

/// Extracts the hypothesis at `batch_idx`, keeping a batch axis of size one.
pub fn select_state(state: &DecoderState, batch_idx: usize) -> Result<DecoderState> {
    let pick = Index::from(Range::new(batch_idx as i64, batch_idx as i64 + 1));
    let hidden = state
        .hidden
        .iter()
        .map(|h| h.as_ref().map(|h| pick.apply(h, 1)).transpose())
        .collect::<Result<Vec<_>>>()?;
    Ok(DecoderState {
        step: state.step,
        hidden,
        alpha: state.alpha.as_ref().map(|a| pick.apply(a, 0)).transpose()?,
        summary: state.summary.as_ref().map(|s| pick.apply(s, 0)).transpose()?,
        peak_attn_pos: state.peak_attn_pos,
        is_valid: state.is_valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn filled(seed: f32, step: usize, dev: &Device) -> Result<DecoderState> {
        let mut state = DecoderState::new(2);
        state.step = step;
        state.alpha = Some(Tensor::full(seed, (1, 5), dev)?);
        state.summary = Some(Tensor::full(seed + 0.5, (1, 3), dev)?);
        state.hidden = vec![
            Some(Tensor::full(seed + 1.0, (2, 1, 3), dev)?),
            Some(Tensor::full(seed + 2.0, (2, 1, 3), dev)?),
        ];
        Ok(state)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_concat_select_round_trip() -> Result<()> {
        let dev = Device::Cpu;
        let states = vec![filled(0.0, 3, &dev)?, filled(10.0, 3, &dev)?, filled(20.0, 3, &dev)?];
        let refs: Vec<&DecoderState> = states.iter().collect();
        let batched = concat_states(&refs)?;
        assert_eq!(batched.batch_size()?, Some(3));
        assert_eq!(batched.hidden[0].as_ref().map(|h| h.dims().to_vec()), Some(vec![2, 3, 3]));

        for (i, original) in states.iter().enumerate() {
            let back = select_state(&batched, i)?;
            assert_eq!(back.step, 3);
            let pairs = [
                (back.alpha.as_ref(), original.alpha.as_ref()),
                (back.summary.as_ref(), original.summary.as_ref()),
                (back.hidden[0].as_ref(), original.hidden[0].as_ref()),
                (back.hidden[1].as_ref(), original.hidden[1].as_ref()),
            ];
            for (got, want) in pairs {
                let (got, want) = (got.expect("present"), want.expect("present"));
                assert_eq!(got.dims(), want.dims());
                assert_eq!(max_abs_diff(got, want)?, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_concat_rejects_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let a = filled(0.0, 1, &dev)?;
        let b = filled(1.0, 2, &dev)?;
        assert!(concat_states(&[&a, &b]).is_err());

        let mut c = filled(1.0, 1, &dev)?;
        c.is_valid = true;
        assert!(concat_states(&[&a, &c]).is_err());

        let empty = DecoderState::new(2);
        let mut partial = DecoderState::new(2);
        partial.summary = Some(Tensor::zeros((1, 3), DType::F32, &dev)?);
        assert!(concat_states(&[&empty, &partial]).is_err());
        assert!(concat_states(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_concat_empty_states() -> Result<()> {
        let a = DecoderState::new(1);
        let b = DecoderState::new(1);
        let batched = concat_states(&[&a, &b])?;
        assert_eq!(batched.step, 0);
        assert!(batched.alpha.is_none());
        assert!(batched.hidden[0].is_none());
        assert_eq!(batched.batch_size()?, None);
        Ok(())
    }
}
