//! Multi-threaded greedy evaluation with word and token error rates.
//!
//! Samples are sharded round-robin over `n_threads` workers: worker `tid` decodes
//! samples `tid, tid + n_threads, ...` with its own copy of the criterion. Each
//! worker accumulates its own [`SliceMeters`]; they are summed once all workers
//! are done. Transcript lines are appended to shared writers guarded by a mutex.
//! The first failing worker aborts the run and its error is returned.
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use candle::{Device, Result, Tensor};
use rayon::prelude::*;

use crate::models::seq2seq::Seq2SeqCriterion;

/// One utterance to decode.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    /// Encoder output `[1, time, hidden]`.
    pub encoder_output: Tensor,
    /// Number of valid encoder frames.
    pub input_size: Option<usize>,
    /// Reference token ids; end and pad tokens are ignored.
    pub target: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub n_threads: usize,
    /// Token marking word boundaries.
    pub word_separator: String,
    /// Log reference and prediction of every sample.
    pub show: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            n_threads: 1,
            word_separator: "|".to_string(),
            show: false,
        }
    }
}

/// Hypothesis and reference transcripts, one `"<words> (<id>)"` line per sample.
#[derive(Debug)]
pub struct Transcripts<W> {
    hyp: Mutex<W>,
    reference: Mutex<W>,
}

impl<W: Write> Transcripts<W> {
    pub fn new(hyp: W, reference: W) -> Self {
        Self {
            hyp: Mutex::new(hyp),
            reference: Mutex::new(reference),
        }
    }

    fn write_line(writer: &Mutex<W>, line: &str) -> Result<()> {
        let mut writer = writer
            .lock()
            .map_err(|_| candle::Error::Msg("transcript writer poisoned".to_string()))?;
        writer.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn write_hyp(&self, line: &str) -> Result<()> {
        Self::write_line(&self.hyp, line)
    }

    pub fn write_ref(&self, line: &str) -> Result<()> {
        Self::write_line(&self.reference, line)
    }

    /// Returns `(hyp, reference)`.
    pub fn into_inner(self) -> Result<(W, W)> {
        let poisoned = |_| candle::Error::Msg("transcript writer poisoned".to_string());
        Ok((
            self.hyp.into_inner().map_err(poisoned)?,
            self.reference.into_inner().map_err(poisoned)?,
        ))
    }
}

/// Counters of a single worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceMeters {
    pub word_errors: usize,
    pub token_errors: usize,
    pub n_words: usize,
    pub n_tokens: usize,
    pub n_samples: usize,
    pub elapsed: Duration,
}

impl SliceMeters {
    fn merge(&mut self, other: &SliceMeters) {
        self.word_errors += other.word_errors;
        self.token_errors += other.token_errors;
        self.n_words += other.n_words;
        self.n_tokens += other.n_tokens;
        self.n_samples += other.n_samples;
        self.elapsed += other.elapsed;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub n_samples: usize,
    pub n_words: usize,
    pub n_tokens: usize,
    /// Word error rate in percent.
    pub wer: f64,
    /// Token error rate in percent.
    pub ter: f64,
    /// Decoding time summed over workers.
    pub decode_time: Duration,
    pub wall_time: Duration,
}

/// Levenshtein distance between two sequences.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(x != y);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Percentage of `errors` over `units`; errors without any reference unit give infinity.
pub fn error_rate(errors: usize, units: usize) -> f64 {
    if units > 0 {
        errors as f64 / units as f64 * 100.0
    } else if errors > 0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Maps token ids to their dictionary entries, dropping the ids in `skip`.
pub fn tokens_to_letters(tokens: &[u32], dictionary: &[String], skip: &[u32]) -> Result<Vec<String>> {
    tokens
        .iter()
        .filter(|t| !skip.contains(t))
        .map(|&t| match dictionary.get(t as usize) {
            Some(entry) => Ok(entry.clone()),
            None => candle::bail!("token {t} outside dictionary of {} entries", dictionary.len()),
        })
        .collect()
}

/// Splits letters into words at `separator`.
pub fn letters_to_words(letters: &[String], separator: &str) -> Vec<String> {
    let mut words = vec![];
    let mut current = String::new();
    for letter in letters {
        if letter == separator {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push_str(letter);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn run_shard<W: Write>(
    tid: usize,
    criterion: &Seq2SeqCriterion,
    samples: &[Sample],
    dictionary: &[String],
    cfg: &EvalConfig,
    device: &Device,
    transcripts: Option<&Transcripts<W>>,
) -> Result<SliceMeters> {
    let mut criterion = criterion.clone();
    criterion.eval();
    let skip = [criterion.config().eos_id, criterion.config().pad_id];
    let shard_len = samples.len().saturating_sub(tid).div_ceil(cfg.n_threads);

    let mut meters = SliceMeters::default();
    let start = Instant::now();
    for (cnt, sample) in samples.iter().skip(tid).step_by(cfg.n_threads).enumerate() {
        let input = sample.encoder_output.to_device(device)?;
        let input_sizes = sample.input_size.map(|size| [size]);
        let prediction = criterion.viterbi_path(&input, input_sizes.as_ref().map(|s| s.as_slice()))?;

        let letter_target = tokens_to_letters(&sample.target, dictionary, &skip)?;
        let letter_prediction = tokens_to_letters(&prediction, dictionary, &skip)?;
        let word_target = letters_to_words(&letter_target, &cfg.word_separator);
        let word_prediction = letters_to_words(&letter_prediction, &cfg.word_separator);

        let token_errors = edit_distance(&letter_prediction, &letter_target);
        let word_errors = edit_distance(&word_prediction, &word_target);
        meters.token_errors += token_errors;
        meters.word_errors += word_errors;
        meters.n_tokens += letter_target.len();
        meters.n_words += word_target.len();
        meters.n_samples += 1;

        if let Some(transcripts) = transcripts {
            transcripts.write_ref(&format!("{} ({})\n", word_target.join(" "), sample.id))?;
            transcripts.write_hyp(&format!("{} ({})\n", word_prediction.join(" "), sample.id))?;
        }
        if cfg.show {
            tracing::info!(
                "|T|: {}\n|P|: {}\n[sample: {}, WER: {:.2}%, TER: {:.2}%, total WER: {:.2}%, total TER: {:.2}%, progress (thread {tid}): {:.1}%]",
                letter_target.join(" "),
                letter_prediction.join(" "),
                sample.id,
                error_rate(word_errors, word_target.len()),
                error_rate(token_errors, letter_target.len()),
                error_rate(meters.word_errors, meters.n_words),
                error_rate(meters.token_errors, meters.n_tokens),
                (cnt + 1) as f64 / shard_len as f64 * 100.0,
            );
        }
    }
    meters.elapsed = start.elapsed();
    tracing::debug!(tid, samples = meters.n_samples, elapsed = ?meters.elapsed, "shard done");
    Ok(meters)
}

/// Greedy-decodes every sample and reports word and token error rates.
pub fn run<W: Write + Send>(
    criterion: &Seq2SeqCriterion,
    samples: &[Sample],
    dictionary: &[String],
    cfg: &EvalConfig,
    device: &Device,
    transcripts: Option<&Transcripts<W>>,
) -> Result<EvalReport> {
    if cfg.n_threads == 0 {
        candle::bail!("evaluation needs at least one thread")
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.n_threads)
        .build()
        .map_err(candle::Error::wrap)?;

    let start = Instant::now();
    let slices = pool.install(|| {
        (0..cfg.n_threads)
            .into_par_iter()
            .map(|tid| run_shard(tid, criterion, samples, dictionary, cfg, device, transcripts))
            .collect::<Result<Vec<_>>>()
    })?;
    let wall_time = start.elapsed();

    let mut total = SliceMeters::default();
    for slice in &slices {
        total.merge(slice);
    }
    let report = EvalReport {
        n_samples: total.n_samples,
        n_words: total.n_words,
        n_tokens: total.n_tokens,
        wer: error_rate(total.word_errors, total.n_words),
        ter: error_rate(total.token_errors, total.n_tokens),
        decode_time: total.elapsed,
        wall_time,
    };
    let per_sample = if report.n_samples > 0 {
        report.decode_time.as_secs_f64() / report.n_samples as f64
    } else {
        0.0
    };
    tracing::info!(
        "[Test ({} samples) in {:.2}s (actual decoding time {per_sample:.3}s/sample) -- WER: {:.6}%, TER: {:.6}%]",
        report.n_samples,
        report.wall_time.as_secs_f64(),
        report.wer,
        report.ter,
    );
    Ok(report)
}
