//! Attention-based sequence-to-sequence decoder for speech recognition.
//!
//! The decoder consumes encoder features `[batch, time, hidden]` and emits tokens
//! until the end token. Weights come from a safetensors file, or are freshly
//! initialized when none is given.
//!
//! ```bash
//! # Greedy decoding of encoder features stored as a [1, time, hidden] npy array
//! cargo run --example seq2seq --release -- \
//!     --config decoder.json --weights decoder.safetensors decode --input feats.npy
//!
//! # Beam search with the attention trace saved next to the input
//! cargo run --example seq2seq --release -- \
//!     --config decoder.json --weights decoder.safetensors \
//!     decode --input feats.npy --beam-size 8 --save-attention attn.npy
//!
//! # Fit a fresh decoder on random data
//! cargo run --example seq2seq --release -- train --steps 100 --lr 1e-3
//!
//! # Word and token error rates over random utterances on 4 threads
//! cargo run --example seq2seq --release -- test --n-samples 16 --n-threads 4
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

use candle_asr::eval::{self, EvalConfig, Sample, Transcripts};
use candle_asr::models::seq2seq::{Config, Seq2SeqCriterion};

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode the encoder features of one utterance.
    Decode {
        /// Encoder output `[1, time, hidden]` or `[time, hidden]` as an npy file.
        #[arg(long)]
        input: PathBuf,

        /// Use beam search with this many hypotheses instead of greedy decoding.
        #[arg(long)]
        beam_size: Option<usize>,

        /// Write the greedy attention trace `[steps, time]` to this npy file.
        #[arg(long)]
        save_attention: Option<PathBuf>,
    },
    /// Train the decoder on random encoder features and targets.
    Train {
        #[arg(long, default_value_t = 50)]
        steps: usize,

        #[arg(long, default_value_t = 1e-3)]
        lr: f64,

        #[arg(long, default_value_t = 4)]
        batch_size: usize,

        #[arg(long, default_value_t = 40)]
        time: usize,

        #[arg(long, default_value_t = 12)]
        target_len: usize,

        /// Save the trained weights to this safetensors file.
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Greedy-decode random utterances and report error rates.
    Test {
        #[arg(long, default_value_t = 8)]
        n_samples: usize,

        #[arg(long, default_value_t = 1)]
        n_threads: usize,

        #[arg(long, default_value_t = 30)]
        time: usize,

        /// Token dictionary, one token per line. Tokens are named by their id
        /// otherwise.
        #[arg(long)]
        dictionary: Option<PathBuf>,

        /// Print every hypothesis and reference.
        #[arg(long)]
        show: bool,

        /// Write `<hyp> (<id>)` lines here, and reference lines next to it.
        #[arg(long)]
        hyp_output: Option<PathBuf>,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Seq2seq attention decoder for speech recognition")]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Log decoder progress to stderr.
    #[arg(long)]
    verbose: bool,

    /// Decoder configuration as a JSON file, defaults are used otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decoder weights as a safetensors file.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Seed for scheduled sampling and the random data of `train` and `test`.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    #[command(subcommand)]
    command: Command,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut cfg = match &args.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    cfg.seed.get_or_insert(args.seed);
    Ok(cfg)
}

fn load_criterion(
    args: &Args,
    cfg: Config,
    device: &Device,
) -> Result<(Seq2SeqCriterion, VarMap)> {
    let varmap = VarMap::new();
    let criterion = match &args.weights {
        Some(path) => {
            println!("Loading weights from {:?}...", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
            Seq2SeqCriterion::from_config(cfg, vb)?
        }
        None => {
            println!("No weights given, initializing a fresh decoder");
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            Seq2SeqCriterion::from_config(cfg, vb)?
        }
    };
    Ok((criterion, varmap))
}

/// Random targets ending in the end token, without pad or end tokens inside.
fn random_targets<R: Rng>(rng: &mut R, cfg: &Config, len: usize) -> Vec<u32> {
    let mut target: Vec<u32> = (0..len.saturating_sub(1))
        .map(|_| loop {
            let token = rng.random_range(0..cfg.vocab_size as u32);
            if token != cfg.eos_id && token != cfg.pad_id {
                break token;
            }
        })
        .collect();
    target.push(cfg.eos_id);
    target
}

fn decode(
    criterion: &mut Seq2SeqCriterion,
    input: &Path,
    beam_size: Option<usize>,
    save_attention: Option<&Path>,
    device: &Device,
) -> Result<()> {
    let input = Tensor::read_npy(input)?.to_dtype(DType::F32)?.to_device(device)?;
    let input = match input.rank() {
        2 => input.unsqueeze(0)?,
        3 => input,
        rank => anyhow::bail!("expected encoder output of rank 2 or 3, got {rank}"),
    };
    println!("Encoder output: {:?}", input.shape());

    let start = std::time::Instant::now();
    let (path, alpha) = match beam_size {
        Some(beam_size) => (criterion.beam_path(&input, None, beam_size)?, None),
        None => criterion.viterbi_path_base(&input, None, save_attention.is_some())?,
    };
    println!("Decoded {} tokens in {:.2?}", path.len(), start.elapsed());
    println!("{path:?}");

    match (save_attention, alpha) {
        (Some(out), Some(alpha)) => {
            alpha.write_npy(out)?;
            println!("Attention trace {:?} written to {:?}", alpha.shape(), out);
        }
        (Some(_), None) if beam_size.is_some() => {
            println!("Attention traces are only saved for greedy decoding");
        }
        _ => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn train(
    criterion: &mut Seq2SeqCriterion,
    varmap: &VarMap,
    steps: usize,
    lr: f64,
    batch_size: usize,
    time: usize,
    target_len: usize,
    save: Option<&Path>,
    seed: u64,
    device: &Device,
) -> Result<()> {
    let vars = varmap.all_vars();
    if vars.is_empty() {
        anyhow::bail!("weights loaded from a file cannot be trained, drop --weights")
    }
    let cfg = criterion.config().clone();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let input = Tensor::randn(0f32, 1., (batch_size, time, cfg.hidden_size), device)?;
    let targets: Vec<u32> = (0..batch_size)
        .flat_map(|_| random_targets(&mut rng, &cfg, target_len))
        .collect();
    let target = Tensor::from_vec(targets, (batch_size, target_len), device)?;

    let params = candle_nn::ParamsAdamW {
        lr,
        ..Default::default()
    };
    let mut opt = candle_nn::AdamW::new(vars, params)?;
    criterion.train();
    for step in 0..steps {
        let (losses, _) = criterion.forward(&input, &target, None, None)?;
        let loss = losses.mean_all()?;
        opt.backward_step(&loss)?;
        tracing::debug!(step, "optimizer step");
        if step % 10 == 0 || step + 1 == steps {
            println!("step {step:5}: loss {:.4}", loss.to_scalar::<f32>()?);
        }
    }

    criterion.eval();
    let first = input.narrow(0, 0, 1)?;
    println!("greedy path after training: {:?}", criterion.viterbi_path(&first, None)?);
    println!("target:                     {:?}", target.get(0)?.to_vec1::<u32>()?);

    if let Some(path) = save {
        varmap.save(path)?;
        println!("Weights saved to {:?}", path);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn test(
    criterion: &Seq2SeqCriterion,
    n_samples: usize,
    n_threads: usize,
    time: usize,
    dictionary: Option<&Path>,
    show: bool,
    hyp_output: Option<&Path>,
    seed: u64,
    device: &Device,
) -> Result<()> {
    let cfg = criterion.config();
    let dictionary = match dictionary {
        Some(path) => candle_examples::load_dictionary(path)?,
        None => (0..cfg.vocab_size).map(|i| i.to_string()).collect(),
    };
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let samples = (0..n_samples)
        .map(|i| {
            let encoder_output = Tensor::randn(0f32, 1., (1, time, cfg.hidden_size), device)?;
            let len = rng.random_range(2..=cfg.max_decoder_output_len.clamp(2, 10));
            Ok(Sample {
                id: format!("utt{i}"),
                encoder_output,
                input_size: None,
                target: random_targets(&mut rng, cfg, len),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let eval_cfg = EvalConfig {
        n_threads,
        show,
        ..Default::default()
    };
    let report = match hyp_output {
        Some(path) => {
            let hyp = std::fs::File::create(path)?;
            let reference = std::fs::File::create(path.with_extension("ref"))?;
            let transcripts = Transcripts::new(hyp, reference);
            eval::run(criterion, &samples, &dictionary, &eval_cfg, device, Some(&transcripts))?
        }
        None => eval::run::<std::fs::File>(
            criterion,
            &samples,
            &dictionary,
            &eval_cfg,
            device,
            None,
        )?,
    };
    println!(
        "{} samples, WER {:.2}%, TER {:.2}%, {:.2?} decoding, {:.2?} wall",
        report.n_samples, report.wer, report.ter, report.decode_time, report.wall_time
    );
    Ok(())
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        if args.verbose {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_subscriber::filter::LevelFilter::DEBUG)
                .init();
        }
        None
    };

    let device = candle_examples::device(args.cpu)?;
    println!("Using device: {:?}", device);

    let cfg = load_config(&args)?;
    println!(
        "Decoder: vocab {}, hidden {}, {} attention round(s), sampling {}",
        cfg.vocab_size, cfg.hidden_size, cfg.n_attn_round, cfg.sampling_strategy
    );
    let (mut criterion, varmap) = load_criterion(&args, cfg, &device)?;

    match &args.command {
        Command::Decode {
            input,
            beam_size,
            save_attention,
        } => decode(
            &mut criterion,
            input,
            *beam_size,
            save_attention.as_deref(),
            &device,
        )?,
        Command::Train {
            steps,
            lr,
            batch_size,
            time,
            target_len,
            save,
        } => train(
            &mut criterion,
            &varmap,
            *steps,
            *lr,
            *batch_size,
            *time,
            *target_len,
            save.as_deref(),
            args.seed,
            &device,
        )?,
        Command::Test {
            n_samples,
            n_threads,
            time,
            dictionary,
            show,
            hyp_output,
        } => {
            criterion.eval();
            test(
                &criterion,
                *n_samples,
                *n_threads,
                *time,
                dictionary.as_deref(),
                *show,
                hyp_output.as_deref(),
                args.seed,
                &device,
            )?
        }
    }
    Ok(())
}
