//! Deterministic engine described by a JSON file.
//!
//! Used as the bundled backend for the CLI and for tests. The file lists a
//! vocabulary (token id = index), the end-of-generation id, and for each
//! previous token the candidates that may follow it.
//!
//! ```json
//! {
//!   "vocab": ["<eos>", "The", " cat", " dog", " sat"],
//!   "eos": 0,
//!   "default": [[1, 1.0]],
//!   "transitions": { "1": [[2, 2.0], [3, 1.5]], "2": [[4, 3.0]] }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::candidates::{Candidate, TokenId};
use crate::engine::{EngineError, EngineLoader, SampledToken, SamplingEngine};
use crate::settings::SampleSettings;

const DEFAULT_N_CTX: usize = 2048;

fn default_n_ctx() -> usize {
    DEFAULT_N_CTX
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFile {
    vocab: Vec<String>,
    eos: TokenId,
    #[serde(default = "default_n_ctx")]
    n_ctx: usize,
    #[serde(default)]
    default: Vec<(TokenId, f32)>,
    #[serde(default)]
    transitions: HashMap<TokenId, Vec<(TokenId, f32)>>,
}

/// Engine whose next-token candidates come from a fixed transition table.
#[derive(Debug, Clone)]
pub struct FixtureEngine {
    vocab: Vec<String>,
    eos: TokenId,
    n_ctx: usize,
    default: Vec<(TokenId, f32)>,
    transitions: HashMap<TokenId, Vec<(TokenId, f32)>>,
    context: Vec<TokenId>,
}

impl FixtureEngine {
    /// Parses a fixture description.
    ///
    /// # Errors
    /// Returns an error for malformed JSON or token ids outside the vocabulary.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(json).context("Failed to parse fixture")?;
        let engine = Self {
            vocab: file.vocab,
            eos: file.eos,
            n_ctx: file.n_ctx,
            default: file.default,
            transitions: file.transitions,
            context: Vec::new(),
        };
        engine.validate()?;
        Ok(engine)
    }

    fn validate(&self) -> Result<()> {
        let limit = self.vocab.len();
        let in_vocab = |id: TokenId| (id as usize) < limit;
        anyhow::ensure!(in_vocab(self.eos), "eos id {} is outside the vocabulary", self.eos);
        let tables = std::iter::once(&self.default).chain(self.transitions.values());
        for (id, _) in tables.flatten() {
            anyhow::ensure!(in_vocab(*id), "candidate id {id} is outside the vocabulary");
        }
        for prev in self.transitions.keys() {
            anyhow::ensure!(in_vocab(*prev), "transition key {prev} is outside the vocabulary");
        }
        Ok(())
    }

    fn table_after(&self, prev: TokenId) -> &[(TokenId, f32)] {
        self.transitions
            .get(&prev)
            .map_or(self.default.as_slice(), Vec::as_slice)
    }
}

impl SamplingEngine for FixtureEngine {
    fn tokenize(&mut self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let mut tokens = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let best = self
                .vocab
                .iter()
                .enumerate()
                .filter(|(_, piece)| !piece.is_empty() && rest.starts_with(piece.as_str()))
                .max_by_key(|(_, piece)| piece.len());
            let Some((id, piece)) = best else {
                return Err(EngineError::new(format!(
                    "cannot tokenize text at byte {pos}"
                )));
            };
            tokens.push(id as TokenId);
            pos += piece.len();
        }
        Ok(tokens)
    }

    fn evaluate(&mut self, tokens: &[TokenId]) -> Result<(), EngineError> {
        if self.context.len() + tokens.len() > self.n_ctx {
            return Err(EngineError::new("context window exhausted"));
        }
        self.context.extend_from_slice(tokens);
        Ok(())
    }

    fn sample(
        &mut self,
        index: usize,
        settings: &SampleSettings,
    ) -> Result<SampledToken, EngineError> {
        let prev = *self.context.get(index).ok_or_else(|| {
            EngineError::new(format!("position {index} has not been evaluated"))
        })?;
        let mut table = self.table_after(prev).to_vec();
        if table.is_empty() {
            return Err(EngineError::new(format!("no candidates follow token {prev}")));
        }
        table.sort_by(|a, b| b.1.total_cmp(&a.1));

        let scale = if settings.temperature > 0.0 {
            settings.temperature
        } else {
            1.0
        };
        let max = table[0].1 / scale;
        let weights: Vec<f32> = table.iter().map(|(_, l)| (l / scale - max).exp()).collect();
        let total: f32 = weights.iter().sum();

        let mut candidates: Vec<Candidate> = table
            .iter()
            .zip(&weights)
            .map(|(&(id, logit), w)| Candidate {
                id,
                logit,
                probability: w / total,
            })
            .collect();
        if let Ok(k) = usize::try_from(settings.top_k)
            && k > 0
        {
            candidates.truncate(k);
        }

        Ok(SampledToken {
            token: candidates[0].id,
            candidates,
        })
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == self.eos
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        tokens
            .iter()
            .map(|&id| {
                self.vocab
                    .get(id as usize)
                    .map(String::as_str)
                    .ok_or_else(|| EngineError::new(format!("unknown token id {id}")))
            })
            .collect()
    }

    fn context(&self) -> &[TokenId] {
        &self.context
    }

    fn truncate_context(&mut self, index: usize) {
        self.context.truncate(index);
    }
}

/// Loads [`FixtureEngine`]s from JSON files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureLoader;

impl EngineLoader for FixtureLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn SamplingEngine>> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model {}", path.display()))?;
        let engine = FixtureEngine::from_json(&contents)
            .with_context(|| format!("Failed to load model {}", path.display()))?;
        Ok(Box::new(engine))
    }
}
