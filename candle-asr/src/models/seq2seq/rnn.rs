//! Recurrent decoder cell: a stack of GRU layers stepped one token at a time.
//!
//! Layer k loads its weights from `{k}.weight_ih_l0`, `{k}.weight_hh_l0`,
//! `{k}.bias_ih_l0` and `{k}.bias_hh_l0`, the layout of a single-layer PyTorch GRU.

use candle::{DType, Result, Tensor};
use candle_nn::rnn::{GRUConfig, GRUState, GRU, RNN};
use candle_nn::VarBuilder;

/// Multi-layer GRU with dropout between layers while training.
#[derive(Debug, Clone)]
pub struct DecoderRnn {
    layers: Vec<GRU>,
    hidden_size: usize,
    dropout: f32,
    span: tracing::Span,
}

impl DecoderRnn {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle::bail!("decoder rnn needs at least one layer")
        }
        let layers = (0..num_layers)
            .map(|k| {
                let in_dim = if k == 0 { input_size } else { hidden_size };
                candle_nn::rnn::gru(in_dim, hidden_size, GRUConfig::default(), vb.pp(k))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            hidden_size,
            dropout,
            span: tracing::span!(tracing::Level::TRACE, "decoder-rnn"),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Zero hidden state for `batch_size` sequences: [layers, batch, hidden].
    pub fn zero_state(&self, batch_size: usize, dtype: DType, device: &candle::Device) -> Result<Tensor> {
        Tensor::zeros(
            (self.layers.len(), batch_size, self.hidden_size),
            dtype,
            device,
        )
    }

    /// One step. `prev` of `None` starts from zeros.
    ///
    /// xs: [batch, input], prev: [layers, batch, hidden]
    /// Returns (output [batch, hidden], new hidden [layers, batch, hidden]).
    pub fn step(&self, xs: &Tensor, prev: Option<&Tensor>, train: bool) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let batch_size = xs.dim(0)?;
        let prev = match prev {
            Some(prev) => prev.clone(),
            None => self.zero_state(batch_size, xs.dtype(), xs.device())?,
        };
        let mut input = xs.clone();
        let mut hiddens = Vec::with_capacity(self.layers.len());
        for (k, layer) in self.layers.iter().enumerate() {
            let state = GRUState { h: prev.get(k)? };
            let h = layer.step(&input, &state)?.h;
            hiddens.push(h.clone());
            input = if train && self.dropout > 0.0 && k + 1 < self.layers.len() {
                candle_nn::ops::dropout(&h, self.dropout)?
            } else {
                h
            };
        }
        Ok((input, Tensor::stack(&hiddens, 0)?))
    }

    /// Runs a whole sequence from a zero state: [batch, len, input] -> [batch, len, hidden].
    pub fn forward_seq(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = xs.dim(1)?;
        let mut hidden = None;
        let mut outputs = Vec::with_capacity(seq_len);
        for u in 0..seq_len {
            let x = xs.narrow(1, u, 1)?.squeeze(1)?.contiguous()?;
            let (out, h) = self.step(&x, hidden.as_ref(), train)?;
            outputs.push(out);
            hidden = Some(h);
        }
        Tensor::stack(&outputs, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_step_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rnn = DecoderRnn::new(4, 6, 2, 0.0, vb)?;
        assert_eq!(rnn.num_layers(), 2);

        let xs = Tensor::randn(0f32, 1., (3, 4), &dev)?;
        let (out, hidden) = rnn.step(&xs, None, false)?;
        assert_eq!(out.dims(), &[3, 6]);
        assert_eq!(hidden.dims(), &[2, 3, 6]);
        // The output is the top layer's hidden state.
        let diff = (out - hidden.get(1)?)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        let (_, next) = rnn.step(&xs, Some(&hidden), false)?;
        assert_eq!(next.dims(), &[2, 3, 6]);
        Ok(())
    }

    #[test]
    fn test_forward_seq_matches_steps() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rnn = DecoderRnn::new(4, 4, 1, 0.0, vb)?;

        let xs = Tensor::randn(0f32, 1., (2, 3, 4), &dev)?;
        let seq = rnn.forward_seq(&xs, false)?;
        assert_eq!(seq.dims(), &[2, 3, 4]);

        let mut hidden = None;
        for u in 0..3 {
            let (out, h) = rnn.step(&xs.narrow(1, u, 1)?.squeeze(1)?, hidden.as_ref(), false)?;
            let diff = (out - seq.narrow(1, u, 1)?.squeeze(1)?)?
                .abs()?
                .sum_all()?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-6);
            hidden = Some(h);
        }
        Ok(())
    }

    #[test]
    fn test_layers_match_candle_gru() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let rnn = DecoderRnn::new(6, 6, 2, 0.0, vb.pp("rnn"))?;
        let names: Vec<String> = varmap.data().lock().expect("lock").keys().cloned().collect();
        assert!(names.contains(&"rnn.0.weight_ih_l0".to_string()));
        assert!(names.contains(&"rnn.1.bias_hh_l0".to_string()));

        // Same variables, looked up again by a plain single-layer GRU.
        let gru = candle_nn::rnn::gru(6, 6, GRUConfig::default(), vb.pp("rnn").pp(0))?;
        let xs = Tensor::randn(0f32, 1., (3, 6), &dev)?;
        let h0 = Tensor::randn(0f32, 1., (2, 3, 6), &dev)?;
        let (_, hidden) = rnn.step(&xs, Some(&h0), false)?;
        let expected = gru.step(&xs, &GRUState { h: h0.get(0)? })?.h;
        let diff = (hidden.get(0)? - expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{diff}");
        Ok(())
    }
}
