//! Attention windows restricting which encoder frames a decode step may attend to.
//!
//! Windows are returned as additive log-weights: 0 inside the window and -inf
//! outside, shaped [batch, steps, time]. Each window is clamped to the valid frames
//! of its sequence and always covers at least one frame.

use std::sync::Arc;

use candle::{DType, Device, Result, Tensor};
use serde::Deserialize;

pub trait AttentionWindow: std::fmt::Debug + Send + Sync {
    /// Window for decode step `step`: [batch, 1, time].
    #[allow(clippy::too_many_arguments)]
    fn compute_window(
        &self,
        prev_alpha: Option<&Tensor>,
        step: usize,
        max_steps: usize,
        encoder_len: usize,
        batch_size: usize,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
        device: &Device,
    ) -> Result<Tensor>;

    /// Windows for all `target_len` steps at once: [batch, target_len, time].
    fn compute_vectorized_window(
        &self,
        target_len: usize,
        encoder_len: usize,
        batch_size: usize,
        input_sizes: Option<&[usize]>,
        target_sizes: Option<&[usize]>,
        device: &Device,
    ) -> Result<Tensor>;

    /// Whether the window depends on the previous step's alignment.
    fn requires_previous_alpha(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowConfig {
    Step {
        s_min: f64,
        s_max: f64,
        v_min: f64,
        v_max: f64,
    },
    Median {
        left: usize,
        right: usize,
    },
}

pub fn build(cfg: &WindowConfig) -> Arc<dyn AttentionWindow> {
    match *cfg {
        WindowConfig::Step {
            s_min,
            s_max,
            v_min,
            v_max,
        } => Arc::new(StepWindow::new(s_min, s_max, v_min, v_max)),
        WindowConfig::Median { left, right } => Arc::new(MedianWindow::new(left, right)),
    }
}

fn frame_limit(input_sizes: Option<&[usize]>, b: usize, encoder_len: usize) -> Result<usize> {
    if encoder_len == 0 {
        candle::bail!("cannot build an attention window over zero encoder frames")
    }
    let limit = match input_sizes {
        Some(sizes) => match sizes.get(b) {
            Some(&size) => size.min(encoder_len),
            None => candle::bail!("no input size for batch element {b}"),
        },
        None => encoder_len,
    };
    Ok(limit.max(1))
}

/// Builds the mask from half-open `[start, end)` spans, one per (batch, step).
fn spans_to_mask(
    spans: &[(usize, usize)],
    batch_size: usize,
    steps: usize,
    time: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut mask = vec![f32::NEG_INFINITY; batch_size * steps * time];
    for (row, &(start, end)) in spans.iter().enumerate() {
        mask[row * time + start..row * time + end].fill(0.0);
    }
    Tensor::from_vec(mask, (batch_size, steps, time), device)
}

/// Window sliding linearly with the step index: step `s` attends
/// `[s_min + s * v_min, s_max + s * v_max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepWindow {
    s_min: f64,
    s_max: f64,
    v_min: f64,
    v_max: f64,
}

impl StepWindow {
    pub fn new(s_min: f64, s_max: f64, v_min: f64, v_max: f64) -> Self {
        Self {
            s_min,
            s_max,
            v_min,
            v_max,
        }
    }

    fn span(&self, step: usize, limit: usize) -> (usize, usize) {
        let s = step as f64;
        let start = (self.s_min + s * self.v_min).floor().max(0.0) as usize;
        let start = start.min(limit - 1);
        let end = (self.s_max + s * self.v_max).ceil().max(0.0) as usize;
        (start, end.clamp(start + 1, limit))
    }
}

impl AttentionWindow for StepWindow {
    fn compute_window(
        &self,
        _prev_alpha: Option<&Tensor>,
        step: usize,
        _max_steps: usize,
        encoder_len: usize,
        batch_size: usize,
        input_sizes: Option<&[usize]>,
        _target_sizes: Option<&[usize]>,
        device: &Device,
    ) -> Result<Tensor> {
        let spans = (0..batch_size)
            .map(|b| Ok(self.span(step, frame_limit(input_sizes, b, encoder_len)?)))
            .collect::<Result<Vec<_>>>()?;
        spans_to_mask(&spans, batch_size, 1, encoder_len, device)
    }

    fn compute_vectorized_window(
        &self,
        target_len: usize,
        encoder_len: usize,
        batch_size: usize,
        input_sizes: Option<&[usize]>,
        _target_sizes: Option<&[usize]>,
        device: &Device,
    ) -> Result<Tensor> {
        let mut spans = Vec::with_capacity(batch_size * target_len);
        for b in 0..batch_size {
            let limit = frame_limit(input_sizes, b, encoder_len)?;
            spans.extend((0..target_len).map(|u| self.span(u, limit)));
        }
        spans_to_mask(&spans, batch_size, target_len, encoder_len, device)
    }
}

/// Window centred on the median of the previous alignment: `[m - left, m + right]`.
/// The first step attends the leading `left + right` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedianWindow {
    left: usize,
    right: usize,
}

impl MedianWindow {
    pub fn new(left: usize, right: usize) -> Self {
        Self { left, right }
    }
}

/// First position where the cumulative weight reaches one half.
fn median(weights: &[f32]) -> usize {
    let mut acc = 0f32;
    for (t, w) in weights.iter().enumerate() {
        acc += w;
        if acc >= 0.5 {
            return t;
        }
    }
    weights.len().saturating_sub(1)
}

impl AttentionWindow for MedianWindow {
    fn compute_window(
        &self,
        prev_alpha: Option<&Tensor>,
        _step: usize,
        _max_steps: usize,
        encoder_len: usize,
        batch_size: usize,
        input_sizes: Option<&[usize]>,
        _target_sizes: Option<&[usize]>,
        device: &Device,
    ) -> Result<Tensor> {
        let medians = match prev_alpha {
            None => None,
            Some(alpha) => {
                let alpha = alpha.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                if alpha.len() != batch_size {
                    candle::bail!(
                        "previous attention has {} rows for a batch of {batch_size}",
                        alpha.len()
                    )
                }
                Some(alpha.iter().map(|row| median(row)).collect::<Vec<_>>())
            }
        };
        let mut spans = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let limit = frame_limit(input_sizes, b, encoder_len)?;
            let (start, end) = match &medians {
                None => (0, self.left + self.right),
                Some(medians) => (
                    medians[b].saturating_sub(self.left),
                    medians[b] + self.right + 1,
                ),
            };
            let start = start.min(limit - 1);
            spans.push((start, end.clamp(start + 1, limit)));
        }
        spans_to_mask(&spans, batch_size, 1, encoder_len, device)
    }

    fn compute_vectorized_window(
        &self,
        _target_len: usize,
        _encoder_len: usize,
        _batch_size: usize,
        _input_sizes: Option<&[usize]>,
        _target_sizes: Option<&[usize]>,
        _device: &Device,
    ) -> Result<Tensor> {
        candle::bail!("median window depends on the previous alignment and cannot be vectorized")
    }

    fn requires_previous_alpha(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_frames(mask: &Tensor) -> Result<Vec<Vec<usize>>> {
        let (b, u, t) = mask.dims3()?;
        let rows = mask.reshape((b * u, t))?.to_vec2::<f32>()?;
        Ok(rows
            .iter()
            .map(|row| (0..t).filter(|&i| row[i] == 0.0).collect())
            .collect())
    }

    #[test]
    fn test_step_window() -> Result<()> {
        let dev = Device::Cpu;
        let window = StepWindow::new(0.0, 2.0, 1.0, 1.0);
        let mask = window.compute_window(None, 3, 10, 8, 2, Some(&[8, 4]), None, &dev)?;
        assert_eq!(mask.dims(), &[2, 1, 8]);
        let open = open_frames(&mask)?;
        assert_eq!(open[0], vec![3, 4]);
        // Clamped to the shorter sequence.
        assert_eq!(open[1], vec![3]);
        Ok(())
    }

    #[test]
    fn test_step_window_vectorized_matches_steps() -> Result<()> {
        let dev = Device::Cpu;
        let window = StepWindow::new(0.0, 3.0, 1.0, 1.5);
        let all = window.compute_vectorized_window(4, 10, 1, None, None, &dev)?;
        assert_eq!(all.dims(), &[1, 4, 10]);
        for u in 0..4 {
            let single = window.compute_window(None, u, 4, 10, 1, None, None, &dev)?;
            let row = open_frames(&all.narrow(1, u, 1)?)?;
            assert_eq!(row, open_frames(&single)?);
        }
        Ok(())
    }

    #[test]
    fn test_median_window() -> Result<()> {
        let dev = Device::Cpu;
        let window = MedianWindow::new(1, 2);
        assert!(window.requires_previous_alpha());

        let first = window.compute_window(None, 0, 5, 6, 1, None, None, &dev)?;
        assert_eq!(open_frames(&first)?[0], vec![0, 1, 2]);

        let prev = Tensor::new(&[[0.0f32, 0.1, 0.2, 0.6, 0.1, 0.0]], &dev)?;
        let next = window.compute_window(Some(&prev), 1, 5, 6, 1, None, None, &dev)?;
        assert_eq!(open_frames(&next)?[0], vec![2, 3, 4, 5]);

        assert!(window.compute_vectorized_window(3, 6, 1, None, None, &dev).is_err());
        Ok(())
    }

    #[test]
    fn test_config_deserialize() {
        let cfg: WindowConfig =
            serde_json::from_str(r#"{"type": "median", "left": 4, "right": 40}"#).expect("valid");
        assert_eq!(cfg, WindowConfig::Median { left: 4, right: 40 });
        assert!(build(&cfg).requires_previous_alpha());
    }

    #[test]
    fn test_rejects_zero_frames() {
        let dev = Device::Cpu;
        let step = StepWindow::new(0.0, 2.0, 1.0, 1.0);
        assert!(step.compute_window(None, 0, 4, 0, 1, None, None, &dev).is_err());
        assert!(step.compute_vectorized_window(3, 0, 1, None, None, &dev).is_err());
        let median = MedianWindow::new(1, 2);
        assert!(median.compute_window(None, 0, 4, 0, 1, None, None, &dev).is_err());
    }
}
