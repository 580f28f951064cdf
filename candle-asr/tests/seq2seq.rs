#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use candle::{test_device, DType, Device, Result, Tensor, D};
use candle_asr::index::{Range, END, SPAN};
use candle_asr::models::seq2seq::{
    concat_states, select_state, AttentionConfig, Config, DecoderState, Seq2SeqCriterion,
    StepInput,
};
use candle_nn::{Optimizer, VarBuilder, VarMap};

fn config() -> Config {
    Config {
        vocab_size: 8,
        hidden_size: 12,
        eos_id: 6,
        pad_id: 7,
        max_decoder_output_len: 10,
        n_attn_round: 2,
        n_rnn_layers: 2,
        seed: Some(7),
        ..Default::default()
    }
}

fn criterion(cfg: Config, varmap: &VarMap, dev: &Device) -> Result<Seq2SeqCriterion> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, dev);
    Seq2SeqCriterion::from_config(cfg, vb)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// Decodes `tokens` one at a time from the start state.
fn run_prefix(
    criterion: &Seq2SeqCriterion,
    input: &Tensor,
    tokens: &[u32],
) -> Result<DecoderState> {
    let time = input.dim(1)?;
    let (_, mut state) =
        criterion.decode_step(input, None, &DecoderState::new(2), None, None, time)?;
    for &token in tokens {
        let y = StepInput::Tokens(Tensor::new(&[token], input.device())?);
        state = criterion.decode_step(input, Some(&y), &state, None, None, time)?.1;
    }
    Ok(state)
}

fn index_ranges(_dev: &Device) -> Result<()> {
    assert_eq!(Range::until(5), Range::new(0, 5));
    let full = Range::new(0, END);
    assert_eq!(full.end(), END);
    assert_eq!(full, SPAN);
    let strided = Range::with_stride(2, 7, 2);
    assert_eq!(
        (strided.start(), strided.end(), strided.stride()),
        (2, 6, 2)
    );
    Ok(())
}

fn state_round_trip(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let mut criterion = criterion(config(), &varmap, dev)?;
    criterion.eval();
    let input = Tensor::randn(0f32, 1., (1, 9, 12), dev)?;
    let states = [
        run_prefix(&criterion, &input, &[0, 1])?,
        run_prefix(&criterion, &input, &[2, 3])?,
        run_prefix(&criterion, &input, &[5, 4])?,
    ];
    let refs: Vec<&DecoderState> = states.iter().collect();
    let batched = concat_states(&refs)?;
    assert_eq!(batched.step, 3);
    assert_eq!(batched.batch_size()?, Some(3));

    for (i, original) in states.iter().enumerate() {
        let back = select_state(&batched, i)?;
        let (a, b) = (back.alpha.as_ref(), original.alpha.as_ref());
        assert_eq!(max_abs_diff(a.expect("alpha"), b.expect("alpha"))?, 0.0);
        let (a, b) = (back.summary.as_ref(), original.summary.as_ref());
        assert_eq!(max_abs_diff(a.expect("summary"), b.expect("summary"))?, 0.0);
        for round in 0..2 {
            let (a, b) = (back.hidden[round].as_ref(), original.hidden[round].as_ref());
            let (a, b) = (a.expect("hidden"), b.expect("hidden"));
            assert_eq!(a.dims(), &[2, 1, 12]);
            assert_eq!(max_abs_diff(a, b)?, 0.0);
        }
    }

    let shorter = run_prefix(&criterion, &input, &[0])?;
    assert!(concat_states(&[&states[0], &shorter]).is_err());
    Ok(())
}

fn batch_step_invariance(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let cfg = Config {
        input_feeding: true,
        ..config()
    };
    let mut criterion = criterion(cfg, &varmap, dev)?;
    criterion.eval();
    let input = Tensor::randn(0f32, 1., (1, 9, 12), dev)?;
    let states = [
        run_prefix(&criterion, &input, &[0, 1])?,
        run_prefix(&criterion, &input, &[2, 3])?,
        run_prefix(&criterion, &input, &[5, 5])?,
    ];
    let refs: Vec<&DecoderState> = states.iter().collect();
    let ys = [Some(4u32), Some(0), Some(2)];
    let (scores, next) = criterion.decode_batch_step(&input, &ys, &refs, i64::MAX, 1.0)?;
    assert_eq!(scores.len(), 3);

    for (i, state) in states.iter().enumerate() {
        let y = StepInput::Tokens(Tensor::new(&[ys[i].unwrap_or_default()], dev)?);
        let (logits, single) = criterion.decode_step(&input, Some(&y), state, None, None, 9)?;
        let expected = candle_nn::ops::log_softmax(&logits, D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for (a, b) in scores[i].iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "hypothesis {i}: {a} vs {b}");
        }
        let batched = next[i].as_ref().expect("valid state");
        assert_eq!(batched.step, single.step);
        let diff = max_abs_diff(
            batched.summary.as_ref().expect("summary"),
            single.summary.as_ref().expect("summary"),
        )?;
        assert!(diff < 1e-5);
    }
    Ok(())
}

fn greedy_and_beam(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let mut criterion = criterion(config(), &varmap, dev)?;
    for _ in 0..4 {
        let input = Tensor::randn(0f32, 1., (1, 9, 12), dev)?;
        let (greedy, alpha) = criterion.viterbi_path_base(&input, Some(&[7]), true)?;
        assert!(greedy.len() <= 10);
        assert!(!greedy.contains(&6));
        let alpha = alpha.expect("attention trace");
        let (steps, time) = alpha.dims2()?;
        assert_eq!(time, 9);
        assert!(steps == greedy.len() || steps == greedy.len() + 1);

        let beam = criterion.beam_path(&input, Some(&[7]), 1)?;
        assert_eq!(greedy, beam);
    }
    assert!(criterion.is_training());
    Ok(())
}

fn forced_eos_gives_empty_path(dev: &Device) -> Result<()> {
    let mut varmap = VarMap::new();
    let cfg = Config {
        vocab_size: 5,
        hidden_size: 4,
        eos_id: 4,
        pad_id: 3,
        max_decoder_output_len: 3,
        seed: Some(0),
        ..Default::default()
    };
    let mut criterion = criterion(cfg, &varmap, dev)?;
    varmap.set_one("linear_out.weight", Tensor::zeros((5, 4), DType::F32, dev)?)?;
    varmap.set_one("linear_out.bias", Tensor::new(&[0f32, 0., 0., 0., 20.], dev)?)?;
    let input = Tensor::randn(0f32, 1., (1, 5, 4), dev)?;
    assert!(criterion.viterbi_path(&input, None)?.is_empty());
    Ok(())
}

fn zero_smoothing_matches_cross_entropy(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let mut plain = criterion(config(), &varmap, dev)?;
    let mut smoothed = criterion(
        Config {
            label_smoothing: 0.0,
            attention: AttentionConfig::NeuralContent { dim: 6 },
            ..config()
        },
        &varmap,
        dev,
    )?;
    let mut reference = criterion(
        Config {
            attention: AttentionConfig::NeuralContent { dim: 6 },
            ..config()
        },
        &varmap,
        dev,
    )?;
    reference.eval();
    let target = Tensor::new(&[[0u32, 1, 2, 6], [3, 6, 7, 7], [5, 5, 4, 6]], dev)?;
    for _ in 0..3 {
        let input = Tensor::randn(0f32, 1., (3, 6, 12), dev)?;
        let (a, _) = smoothed.forward(&input, &target, Some(&[6, 4, 5]), None)?;
        let (b, _) = reference.forward(&input, &target, Some(&[6, 4, 5]), None)?;
        assert_eq!(a.to_vec1::<f32>()?, b.to_vec1::<f32>()?);
        let (losses, _) = plain.forward(&input, &target, Some(&[6, 4, 5]), None)?;
        assert_eq!(losses.dims(), &[3]);
    }
    Ok(())
}

fn training_reduces_loss(dev: &Device) -> Result<()> {
    let varmap = VarMap::new();
    let cfg = Config {
        n_attn_round: 1,
        n_rnn_layers: 1,
        label_smoothing: 0.05,
        ..config()
    };
    let mut criterion = criterion(cfg, &varmap, dev)?;
    let params = candle_nn::ParamsAdamW {
        lr: 0.02,
        ..Default::default()
    };
    let mut opt = candle_nn::AdamW::new(varmap.all_vars(), params)?;
    let input = Tensor::randn(0f32, 1., (2, 6, 12), dev)?;
    let target = Tensor::new(&[[0u32, 1, 2, 6], [3, 3, 6, 7]], dev)?;

    let mut first = None;
    let mut last = 0f32;
    for _ in 0..30 {
        let (losses, _) = criterion.forward(&input, &target, None, None)?;
        let loss = losses.mean_all()?;
        last = loss.to_scalar::<f32>()?;
        first.get_or_insert(last);
        opt.backward_step(&loss)?;
    }
    let first = first.expect("at least one step");
    assert!(last < first, "loss went from {first} to {last}");
    Ok(())
}

test_device!(index_ranges, index_ranges_cpu, index_ranges_gpu, index_ranges_metal);
test_device!(
    state_round_trip,
    state_round_trip_cpu,
    state_round_trip_gpu,
    state_round_trip_metal
);
test_device!(
    batch_step_invariance,
    batch_step_invariance_cpu,
    batch_step_invariance_gpu,
    batch_step_invariance_metal
);
test_device!(
    greedy_and_beam,
    greedy_and_beam_cpu,
    greedy_and_beam_gpu,
    greedy_and_beam_metal
);
test_device!(
    forced_eos_gives_empty_path,
    forced_eos_gives_empty_path_cpu,
    forced_eos_gives_empty_path_gpu,
    forced_eos_gives_empty_path_metal
);
test_device!(
    zero_smoothing_matches_cross_entropy,
    zero_smoothing_matches_cross_entropy_cpu,
    zero_smoothing_matches_cross_entropy_gpu,
    zero_smoothing_matches_cross_entropy_metal
);
test_device!(
    training_reduces_loss,
    training_reduces_loss_cpu,
    training_reduces_loss_gpu,
    training_reduces_loss_metal
);
