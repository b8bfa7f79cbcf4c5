//! Session event types.
//!
//! This module defines the contract between the generation worker and its
//! consumer. Events are serializable so a run can be dumped as JSON lines.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::candidates::CandidateSet;

/// Events emitted by a generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// One token was sampled. The consumer appends a node for it.
    StepProduced {
        candidates: Arc<CandidateSet>,
        /// Decoded text of the selected token.
        text: String,
    },

    /// The worker left its step loop. Sent exactly once per `start()`.
    SessionEnded { reason: EndReason },
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    /// The engine reported an end-of-generation token.
    EndOfGeneration,
    /// `stop()` was requested.
    Cancelled,
    /// The branch produced `max_samples` tokens.
    MaxSamples,
    /// An engine call failed; the branch was abandoned.
    Failed { message: String },
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::EndOfGeneration => write!(f, "end of generation"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::MaxSamples => write!(f, "sample limit reached"),
            EndReason::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}
