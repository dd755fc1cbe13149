use crate::session::machine::MachineEvent;
use crate::session::state::Phase;
use thiserror::Error;

/// The error kinds the core distinguishes.  Everything else travels as
/// plain `anyhow` context chains; these five get matched at the CLI
/// boundary to pick exit codes and user-visible behavior.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The repository has no commits yet.  Hooks short-circuit with a
    /// friendly message and exit 0.
    #[error("repository has no commits yet — make an initial commit first")]
    EmptyRepository,

    /// A recoverable condition for which the caller has already produced
    /// the user-visible message.
    #[error("{0}")]
    Silent(String),

    /// The state machine rejected the event.  Surfaced as a warning; the
    /// session state is left untouched.
    #[error("invalid transition: {event} while {phase}")]
    InvalidTransition { phase: Phase, event: MachineEvent },

    /// The adapter could not parse its own hook payload.
    #[error("parsing {hook} payload: {message}")]
    HookParse { hook: String, message: String },

    /// The transcript was not flushed before the preparation deadline.
    /// The framework proceeds with whatever is on disk.
    #[error("transcript {path} was not flushed before the deadline")]
    StaleTranscript { path: String },
}

impl CoreError {
    pub fn hook_parse(hook: &str, err: impl std::fmt::Display) -> Self {
        Self::HookParse {
            hook: hook.to_string(),
            message: err.to_string(),
        }
    }
}

/// Check whether an `anyhow` chain bottoms out in one of the quiet kinds
/// (empty repository, silent) that map to exit code 0.
pub fn is_benign(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::EmptyRepository | CoreError::Silent(_))
    )
}
