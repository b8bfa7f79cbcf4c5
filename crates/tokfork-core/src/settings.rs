//! Sampling settings and their persisted form.
//!
//! Settings are stored as a flat JSON object carrying a `__type__` tag.
//! Reading goes through [`SettingsRegistry`], which maps each known tag to a
//! constructor. Unknown or missing tags are errors, never silently defaulted.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key holding the type tag inside a persisted object.
pub const TYPE_TAG_KEY: &str = "__type__";

/// Options passed to the engine when sampling a token.
///
/// A copy is moved into the worker when a branch starts, so editing the
/// caller's value never affects a branch that is already generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampleSettings {
    /// Maximum tokens per branch (0 = unbounded).
    pub max_samples: usize,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub tail_free_z: f32,
    /// 0 = disabled, 1 = mirostat, 2 = mirostat 2.0
    pub mirostat_mode: u8,
    pub mirostat_eta: f32,
    pub mirostat_tau: f32,
    pub penalize_newline: bool,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            max_samples: 40,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            temperature: 0.8,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            tail_free_z: 1.0,
            mirostat_mode: 0,
            mirostat_eta: 0.1,
            mirostat_tau: 5.0,
            penalize_newline: true,
        }
    }
}

impl SampleSettings {
    pub const TYPE_TAG: &'static str = "sample_settings";

    /// Returns true when `steps` produced tokens reach the configured cap.
    pub fn reached_limit(&self, steps: usize) -> bool {
        self.max_samples > 0 && steps >= self.max_samples
    }
}

/// Errors raised while reading a persisted settings object.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persisted object has no `__type__` tag")]
    MissingTag,
    #[error("unknown settings type `{0}`")]
    UnknownTag(String),
    #[error("persisted settings must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A reconstructed persisted value.
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    Sample(SampleSettings),
}

impl Persisted {
    pub fn into_sample(self) -> SampleSettings {
        match self {
            Persisted::Sample(settings) => settings,
        }
    }
}

type Constructor = fn(Map<String, Value>) -> Result<Persisted, PersistError>;

/// Tag -> constructor table used to rebuild persisted values.
pub struct SettingsRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl SettingsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Creates a registry holding every built-in settings type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SampleSettings::TYPE_TAG, |fields| {
            let settings = serde_json::from_value(Value::Object(fields))?;
            Ok(Persisted::Sample(settings))
        });
        registry
    }

    pub fn register(&mut self, tag: &'static str, constructor: Constructor) {
        self.constructors.insert(tag, constructor);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Rebuilds a value from its tagged JSON object.
    ///
    /// # Errors
    /// Returns an error when the tag is missing or unknown, or when the
    /// remaining fields do not fit the tagged type.
    pub fn reconstruct(&self, value: Value) -> Result<Persisted, PersistError> {
        let Value::Object(mut fields) = value else {
            return Err(PersistError::NotAnObject);
        };
        let tag = match fields.remove(TYPE_TAG_KEY) {
            Some(Value::String(tag)) => tag,
            Some(_) | None => return Err(PersistError::MissingTag),
        };
        let constructor = self
            .constructors
            .get(tag.as_str())
            .ok_or(PersistError::UnknownTag(tag))?;
        constructor(fields)
    }

    /// Parses a JSON document and rebuilds the tagged value it holds.
    ///
    /// # Errors
    /// Returns an error for malformed JSON or any [`reconstruct`](Self::reconstruct) failure.
    pub fn from_json(&self, json: &str) -> Result<Persisted, PersistError> {
        self.reconstruct(serde_json::from_str(json)?)
    }
}

impl Default for SettingsRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Serializes settings to a flat tagged JSON object.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_tagged_value(settings: &SampleSettings) -> Result<Value, PersistError> {
    let Value::Object(mut fields) = serde_json::to_value(settings)? else {
        return Err(PersistError::NotAnObject);
    };
    fields.insert(
        TYPE_TAG_KEY.to_string(),
        Value::String(SampleSettings::TYPE_TAG.to_string()),
    );
    Ok(Value::Object(fields))
}

/// Writes settings to `path` as pretty tagged JSON, creating parent dirs.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_to(path: &Path, settings: &SampleSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let value = to_tagged_value(settings)?;
    let json = serde_json::to_string_pretty(&value)?;
    fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}

/// Loads settings from `path`, returning defaults when the file is absent.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or reconstructed.
pub fn load_from(path: &Path) -> Result<SampleSettings> {
    if !path.exists() {
        return Ok(SampleSettings::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    let persisted = SettingsRegistry::with_builtins()
        .from_json(&contents)
        .with_context(|| format!("Failed to parse settings from {}", path.display()))?;
    Ok(persisted.into_sample())
}
