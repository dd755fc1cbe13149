use std::fmt;

use crate::errors::CoreError;
use crate::session::state::Phase;

// ===================================================================
// Machine events — the subset of lifecycle moments that move phases
// ===================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    SessionStart,
    TurnStart,
    TurnEnd,
    /// A real commit was made by the user.
    GitCommit,
    Compaction,
    SessionEnd,
}

impl fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SessionStart => "session-start",
            Self::TurnStart => "turn-start",
            Self::TurnEnd => "turn-end",
            Self::GitCommit => "git-commit",
            Self::Compaction => "compaction",
            Self::SessionEnd => "session-end",
        };
        f.write_str(s)
    }
}

// ===================================================================
// Actions — what the strategy must do after a transition
// ===================================================================

/// Side effects a transition asks the strategy to perform.  The machine
/// itself performs no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Snapshot the turn's file changes onto the shadow reference.
    SaveStep,
    /// Drain the queued turn-checkpoint IDs into permanent checkpoints.
    CondenseTurnQueue,
    /// Reset the transcript cursor to zero.
    ResetTranscriptOffset,
    /// Advance the session's base commit to the new HEAD.
    AdvanceBaseCommit,
    /// Stamp the end timestamp and release per-session temp files.
    MarkEnded,
}

/// The phase to persist plus the actions to run, in order.
#[derive(Debug)]
pub struct Transition {
    pub phase: Phase,
    pub actions: Vec<Action>,
}

fn to(phase: Phase, actions: &[Action]) -> Transition {
    Transition {
        phase,
        actions: actions.to_vec(),
    }
}

/// Apply `event` to a session in `phase`.
///
/// `SessionStart` on an existing record is treated as a resume and keeps
/// the phase (Claude restarts sessions on `/clear` and resume without a
/// fresh ID).  Invalid combinations return `InvalidTransition` and the
/// caller must leave the state file untouched.
pub fn transition(phase: Phase, event: MachineEvent) -> Result<Transition, CoreError> {
    use MachineEvent as E;
    use Phase as P;

    let t = match (phase, event) {
        (P::Active | P::ActiveCommitted | P::Idle, E::SessionStart) => to(phase, &[]),
        (P::Ended, E::SessionStart) => to(P::Active, &[]),

        (P::Idle | P::Active | P::ActiveCommitted, E::TurnStart) => to(P::Active, &[]),

        (P::Active | P::ActiveCommitted, E::TurnEnd) => {
            to(P::Idle, &[Action::SaveStep, Action::CondenseTurnQueue])
        }

        (P::Active, E::GitCommit) => {
            to(P::ActiveCommitted, &[Action::AdvanceBaseCommit])
        }
        (P::ActiveCommitted, E::GitCommit) => {
            to(P::ActiveCommitted, &[Action::AdvanceBaseCommit])
        }
        // Base commit stays frozen outside a turn; condensation overlap
        // handling is the strategy's business, not the machine's.
        (P::Idle | P::Ended, E::GitCommit) => to(phase, &[]),

        (P::Active | P::ActiveCommitted | P::Idle, E::Compaction) => {
            to(phase, &[Action::ResetTranscriptOffset])
        }

        (P::Active | P::ActiveCommitted | P::Idle, E::SessionEnd) => {
            to(P::Ended, &[Action::MarkEnded])
        }
        (P::Ended, E::SessionEnd) => to(P::Ended, &[]),

        (phase, event) => return Err(CoreError::InvalidTransition { phase, event }),
    };
    Ok(t)
}
