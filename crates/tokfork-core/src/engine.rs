//! Sampling engine contract.
//!
//! The model runtime is an external collaborator. The session only needs the
//! operations below; anything that can tokenize, evaluate and sample can drive
//! a branch.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::candidates::{Candidate, TokenId};
use crate::settings::SampleSettings;

/// Failure reported by the engine (tokenize, evaluate, sample, detokenize).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A sampled token and the distribution it was drawn from.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub token: TokenId,
    pub candidates: Vec<Candidate>,
}

/// Operations the generation session needs from a model runtime.
pub trait SamplingEngine: Send {
    /// Converts text to tokens.
    ///
    /// # Errors
    /// Returns an error if the text cannot be tokenized.
    fn tokenize(&mut self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Appends `tokens` to the evaluated context.
    ///
    /// # Errors
    /// Returns an error when the engine runs out of resources.
    fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Samples the token following context position `index`.
    ///
    /// # Errors
    /// Returns an error if `index` has not been evaluated or sampling fails.
    fn sample(
        &mut self,
        index: usize,
        settings: &SampleSettings,
    ) -> Result<SampledToken, EngineError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Converts tokens back to text.
    ///
    /// # Errors
    /// Returns an error for unknown token ids.
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError>;

    /// Tokens evaluated so far. Entries past the position being sampled are
    /// the continuation the engine currently assumes.
    fn context(&self) -> &[TokenId];

    /// Rolls the evaluated context back to `index` tokens.
    fn truncate_context(&mut self, index: usize);
}

/// Engine shared between the session owner and its worker.
///
/// Locked per engine call, never across a whole branch.
pub type SharedEngine = Arc<Mutex<Box<dyn SamplingEngine>>>;

/// Builds engines from model files.
pub trait EngineLoader: Send + Sync {
    /// Loads the model at `path`.
    ///
    /// # Errors
    /// Returns an error if the model cannot be loaded.
    fn load(&self, path: &Path) -> Result<Box<dyn SamplingEngine>>;
}

/// Length of the shared prefix of two token sequences.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix_len(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(common_prefix_len(&[], &[1]), 0);
        assert_eq!(common_prefix_len(&[5], &[6]), 0);
    }
}
