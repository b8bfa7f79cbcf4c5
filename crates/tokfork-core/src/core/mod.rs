//! Session core: generation worker and the events it emits.
//!
//! Nothing here knows about the branch tree or layout; consumers subscribe to
//! the event channel returned by [`session::GenerationSession::start`].

pub mod events;
pub mod session;

pub use events::{EndReason, SessionEvent};
pub use session::{
    GenerationSession, LoadError, SessionError, SessionEventRx, SessionEventTx, SessionState,
    SessionStopper, Transcript,
};
