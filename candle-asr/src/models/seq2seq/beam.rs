//! Beam search over decoder hypotheses.
//!
//! Every round batches all live hypotheses into a single decode step, scores each
//! (hypothesis, token) continuation by cumulative log-probability, and keeps the
//! best `beam_size` of them. Hypotheses that emit the end token move to a separate
//! completed set. The search stops after `max_len` rounds, when no live hypothesis
//! remains, or once the worst kept completion beats the best live hypothesis.
use candle::{DType, Device, Result, Tensor, D};

use super::state::{concat_states, select_state, DecoderState};

/// A decoder that can advance a batch of hypotheses by one token.
pub trait BeamStep {
    fn device(&self) -> &Device;

    fn eos_id(&self) -> u32;

    /// Advances `n_hyps` batched hypotheses.
    ///
    /// `tokens` holds the last emitted token per hypothesis `[n_hyps]`, or `None`
    /// when no hypothesis has emitted anything yet. Returns logits `[n_hyps, vocab]`
    /// and the batched next state.
    fn step(
        &self,
        tokens: Option<&Tensor>,
        state: &DecoderState,
        n_hyps: usize,
    ) -> Result<(Tensor, DecoderState)>;
}

#[derive(Debug, Clone)]
pub struct CandidateHypo {
    /// Cumulative log-probability of `path`.
    pub score: f32,
    pub path: Vec<u32>,
    pub state: DecoderState,
}

impl CandidateHypo {
    /// An empty hypothesis to start the search from.
    pub fn new(n_attn_round: usize) -> Self {
        Self {
            score: 0.0,
            path: vec![],
            state: DecoderState::new(n_attn_round),
        }
    }
}

/// Indices of the `k` largest scores, best first. Equal scores keep index order.
fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let cmp = |a: &usize, b: &usize| scores[*b].total_cmp(&scores[*a]).then(a.cmp(b));
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    let k = k.min(indices.len());
    if k == 0 {
        return vec![];
    }
    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, cmp);
        indices.truncate(k);
    }
    indices.sort_by(cmp);
    indices
}

fn sort_by_score(hypos: &mut [CandidateHypo]) {
    hypos.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Extends `beam` for at most `max_len` rounds.
///
/// Returns the completed hypotheses (paths without the end token) sorted by
/// score, or the live beam if nothing completed. Both sets hold at most
/// `beam_size` hypotheses.
pub fn beam_search<S: BeamStep + ?Sized>(
    decoder: &S,
    beam: Vec<CandidateHypo>,
    beam_size: usize,
    max_len: usize,
) -> Result<Vec<CandidateHypo>> {
    if beam_size == 0 {
        candle::bail!("beam size must be positive")
    }
    let eos = decoder.eos_id();
    let mut beam = beam;
    let mut complete: Vec<CandidateHypo> = Vec::new();

    for round in 0..max_len {
        let first_step = match beam.first() {
            Some(hypo) => hypo.path.is_empty(),
            None => break,
        };
        if beam.iter().any(|h| h.path.is_empty() != first_step) {
            candle::bail!("cannot batch empty and non-empty hypotheses in one beam")
        }
        let n_hyps = beam.len();
        let tokens = if first_step {
            None
        } else {
            let last: Vec<u32> = beam.iter().filter_map(|h| h.path.last().copied()).collect();
            Some(Tensor::new(last.as_slice(), decoder.device())?)
        };
        let states: Vec<&DecoderState> = beam.iter().map(|h| &h.state).collect();
        let state = concat_states(&states)?;
        let (logits, state) = decoder.step(tokens.as_ref(), &state, n_hyps)?;

        let (rows, n_class) = logits.dims2()?;
        if rows != n_hyps {
            candle::bail!("decoder returned {rows} rows for {n_hyps} hypotheses")
        }
        let logp = candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let scores: Vec<f32> = logp
            .iter()
            .enumerate()
            .map(|(i, lp)| lp + beam[i / n_class].score)
            .collect();

        let mut new_beam = Vec::with_capacity(beam_size);
        for (j, idx) in top_k_indices(&scores, 2 * beam_size).into_iter().enumerate() {
            let hyp_idx = idx / n_class;
            let token = (idx % n_class) as u32;
            if token == eos {
                if j < beam_size {
                    complete.push(CandidateHypo {
                        score: scores[idx],
                        path: beam[hyp_idx].path.clone(),
                        state: select_state(&state, hyp_idx)?,
                    });
                }
            } else {
                let mut path = beam[hyp_idx].path.clone();
                path.push(token);
                new_beam.push(CandidateHypo {
                    score: scores[idx],
                    path,
                    state: select_state(&state, hyp_idx)?,
                });
            }
            if new_beam.len() >= beam_size {
                break;
            }
        }
        beam = new_beam;

        if complete.len() >= beam_size {
            sort_by_score(&mut complete);
            complete.truncate(beam_size);
            // Scores only decrease as paths grow, so no live hypothesis can overtake
            // the worst completion.
            let worst = complete[complete.len() - 1].score;
            if beam.first().map_or(true, |best| worst > best.score) {
                tracing::debug!(round, worst, "beam search converged");
                break;
            }
        }
    }

    if complete.is_empty() {
        Ok(beam)
    } else {
        sort_by_score(&mut complete);
        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores tokens {0, 1} and the end token 2 independently of the history. The
    /// end token becomes likely from the third step on.
    struct ScriptedDecoder {
        device: Device,
    }

    impl BeamStep for ScriptedDecoder {
        fn device(&self) -> &Device {
            &self.device
        }

        fn eos_id(&self) -> u32 {
            2
        }

        fn step(
            &self,
            _tokens: Option<&Tensor>,
            state: &DecoderState,
            n_hyps: usize,
        ) -> Result<(Tensor, DecoderState)> {
            let probs: [f32; 3] = if state.step < 2 {
                [0.6, 0.3, 0.1]
            } else {
                [0.06, 0.04, 0.9]
            };
            let row: Vec<f32> = probs.iter().map(|p| p.ln()).collect();
            let logits = Tensor::new(row.as_slice(), &self.device)?
                .unsqueeze(0)?
                .repeat((n_hyps, 1))?;
            let mut next = state.clone();
            next.step += 1;
            Ok((logits, next))
        }
    }

    #[test]
    fn test_top_k_indices() {
        let scores = [0.1, 0.9, 0.5, 0.9, -1.0];
        assert_eq!(top_k_indices(&scores, 3), vec![1, 3, 2]);
        assert_eq!(top_k_indices(&scores, 10).len(), 5);
        assert!(top_k_indices(&scores, 0).is_empty());
    }

    #[test]
    fn test_dominant_path_wins() -> Result<()> {
        let decoder = ScriptedDecoder {
            device: Device::Cpu,
        };
        let hypos = beam_search(&decoder, vec![CandidateHypo::new(1)], 3, 10)?;
        assert!(!hypos.is_empty() && hypos.len() <= 3);
        assert_eq!(hypos[0].path, vec![0, 0]);
        let expected = 0.6f32.ln() * 2.0 + 0.9f32.ln();
        assert!((hypos[0].score - expected).abs() < 1e-5);
        for pair in hypos.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(hypos.iter().all(|h| !h.path.contains(&2)));
        Ok(())
    }

    #[test]
    fn test_beam_bounds() -> Result<()> {
        let decoder = ScriptedDecoder {
            device: Device::Cpu,
        };
        for width in 1..5 {
            for max_len in 0..5 {
                let hypos = beam_search(&decoder, vec![CandidateHypo::new(1)], width, max_len)?;
                assert!(hypos.len() <= width);
                assert!(hypos.iter().all(|h| h.path.len() <= max_len));
            }
        }
        assert!(beam_search(&decoder, vec![CandidateHypo::new(1)], 0, 3).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_mixed_beam() {
        let decoder = ScriptedDecoder {
            device: Device::Cpu,
        };
        let mut started = CandidateHypo::new(1);
        started.path.push(0);
        started.state.step = 1;
        let fresh = CandidateHypo::new(1);
        assert!(beam_search(&decoder, vec![started, fresh], 2, 3).is_err());
    }
}
