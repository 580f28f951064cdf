//! Attention-based sequence-to-sequence speech recognition on candle.
//!
//! The decoder in [`models::seq2seq`] consumes encoder output and produces token
//! sequences, either for training (teacher forced, with scheduled sampling) or for
//! inference (greedy, beam search, or batched steps driven by an external search).
//! [`eval`] shards a test set across worker threads and reports WER/TER.
pub mod eval;
pub mod index;
pub mod models;
