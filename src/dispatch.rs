use anyhow::Result;
use chrono::Utc;

use crate::agent::Agent;
use crate::capture;
use crate::event::{Event, EventKind};
use crate::paths::Workspace;
use crate::session::machine::{transition, Action, MachineEvent};
use crate::session::state::SessionState;
use crate::settings::Settings;
use crate::strategy::ManualCommitStrategy;

/// The single entry point behind `entire hooks <agent> <verb>`: ask the
/// adapter to translate the payload, then route the normalized event to
/// the strategy.
///
/// Non-fatal trouble (missing snapshots, transcript extraction failures)
/// degrades to warnings; only failures that would leave state
/// inconsistent propagate.
pub fn dispatch(
    ws: &Workspace,
    settings: &Settings,
    agent: &dyn Agent,
    verb: &str,
    payload: &[u8],
) -> Result<()> {
    let started = std::time::Instant::now();
    let event = match agent.parse_hook_event(verb, payload)? {
        Some(event) => event,
        None => {
            tracing::debug!(agent = agent.name(), hook = verb, "acknowledged, no action");
            return Ok(());
        }
    };
    if !agent.hook_names().contains(&verb) {
        tracing::debug!(agent = agent.name(), hook = verb, "verb outside the advertised hook set");
    }
    tracing::debug!(
        agent = agent.name(),
        hook = verb,
        event = %event.kind,
        session = %event.session_id,
        // Plumbed for session-handoff adapters; carried, never acted on.
        handoff = event.previous_session_id.is_some(),
        "event dispatched"
    );

    let strategy = ManualCommitStrategy::new(ws, settings);
    let result = handle_event(&strategy, agent, &event);

    tracing::debug!(
        agent = agent.name(),
        hook = verb,
        duration_ms = started.elapsed().as_millis() as u64,
        success = result.is_ok(),
        "event completed"
    );
    result
}

fn handle_event(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    match event.kind {
        EventKind::SessionStart => on_session_start(strategy, agent, event),
        EventKind::TurnStart => on_turn_start(strategy, agent, event),
        EventKind::TurnEnd => on_turn_end(strategy, agent, event),
        EventKind::Compaction => on_compaction(strategy, event),
        EventKind::SessionEnd => on_session_end(strategy, event),
        EventKind::SubagentStart => on_subagent_start(strategy, agent, event),
        EventKind::SubagentEnd => on_subagent_end(strategy, agent, event),
    }
}

/// Apply a machine event to loaded state, mutating phase and running the
/// bookkeeping actions that need no further context.  Returns the action
/// list for the caller to act on, or `None` when the transition was
/// rejected (in which case state must not be saved).
fn apply_transition(
    state: &mut SessionState,
    event: MachineEvent,
) -> Option<Vec<Action>> {
    match transition(state.phase, event) {
        Ok(t) => {
            state.phase = t.phase;
            for action in &t.actions {
                match action {
                    Action::ResetTranscriptOffset => state.checkpoint_transcript_start = 0,
                    Action::MarkEnded => state.ended_at = Some(Utc::now()),
                    _ => {}
                }
            }
            Some(t.actions)
        }
        Err(e) => {
            tracing::warn!("{e}; skipping");
            None
        }
    }
}

fn on_session_start(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    match strategy.store.load(&event.session_id)? {
        Some(mut state) => {
            let Some(_) = apply_transition(&mut state, MachineEvent::SessionStart) else {
                return Ok(());
            };
            if let Some(session_ref) = &event.session_ref {
                state.transcript_path = Some(session_ref.clone());
            }
            state.last_interaction_time = Utc::now();
            strategy.store.save(&state)?;
        }
        None => {
            strategy.initialize_session(
                agent,
                &event.session_id,
                event.session_ref.as_deref(),
                None,
            )?;
            tracing::debug!(session = %event.session_id, "session initialized");
        }
    }
    Ok(())
}

fn on_turn_start(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    let mut state = match strategy.store.load(&event.session_id)? {
        Some(state) => state,
        // A prompt for a session we never saw start (hooks installed
        // mid-session); adopt it.
        None => strategy.initialize_session(
            agent,
            &event.session_id,
            event.session_ref.as_deref(),
            event.prompt.as_deref(),
        )?,
    };
    let Some(_) = apply_transition(&mut state, MachineEvent::TurnStart) else {
        return Ok(());
    };
    if state.first_prompt.is_none() {
        state.first_prompt = event.prompt.clone();
    }
    if let Some(session_ref) = &event.session_ref {
        state.transcript_path = Some(session_ref.clone());
    }
    state.last_interaction_time = Utc::now();
    strategy.store.save(&state)?;

    // Baseline capture is best-effort: the turn proceeds with a zero
    // offset and empty baseline if anything here fails.
    let snapshot =
        capture::build_snapshot(strategy.ws, agent, event.session_ref.as_deref());
    if let Err(e) = capture::write_pre_prompt(strategy.ws, &event.session_id, &snapshot) {
        tracing::warn!("writing pre-prompt snapshot: {e:#}");
    }
    Ok(())
}

fn on_turn_end(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    let Some(mut state) = strategy.store.load(&event.session_id)? else {
        tracing::warn!(session = %event.session_id, "turn end for unknown session");
        return Ok(());
    };

    let Some(actions) = apply_transition(&mut state, MachineEvent::TurnEnd) else {
        return Ok(());
    };

    if let (Some(preparer), Some(session_ref)) =
        (agent.as_preparer(), event.session_ref.as_deref())
    {
        if let Err(e) = preparer.prepare_transcript(session_ref, event.timestamp) {
            tracing::warn!("{e}; proceeding with what is on disk");
        }
    }
    if let Some(session_ref) = &event.session_ref {
        state.transcript_path = Some(session_ref.clone());
    }

    if let Some(message) = &event.response_message {
        tracing::debug!(response = %message, "turn response");
    }
    let snapshot = capture::take_pre_prompt(strategy.ws, &event.session_id)?
        .unwrap_or_else(|| capture::PrePromptSnapshot::empty(Utc::now()));

    for action in actions {
        match action {
            Action::SaveStep => strategy.save_step(agent, &mut state, &snapshot)?,
            Action::CondenseTurnQueue => strategy.handle_turn_end(agent, &mut state)?,
            _ => {}
        }
    }
    strategy.store.save(&state)?;
    Ok(())
}

fn on_compaction(strategy: &ManualCommitStrategy, event: &Event) -> Result<()> {
    let Some(mut state) = strategy.store.load(&event.session_id)? else {
        tracing::warn!(session = %event.session_id, "compaction for unknown session");
        return Ok(());
    };
    let Some(_) = apply_transition(&mut state, MachineEvent::Compaction) else {
        return Ok(());
    };
    // The pre-prompt baseline belongs to the pre-compaction transcript.
    if let Err(e) = capture::take_pre_prompt(strategy.ws, &event.session_id) {
        tracing::warn!("discarding pre-prompt snapshot: {e:#}");
    }
    state.last_interaction_time = Utc::now();
    strategy.store.save(&state)?;
    tracing::debug!(session = %event.session_id, "transcript cursor reset on compaction");
    Ok(())
}

fn on_session_end(strategy: &ManualCommitStrategy, event: &Event) -> Result<()> {
    let Some(mut state) = strategy.store.load(&event.session_id)? else {
        return Ok(());
    };
    let Some(_) = apply_transition(&mut state, MachineEvent::SessionEnd) else {
        return Ok(());
    };
    state.last_interaction_time = Utc::now();
    strategy.store.save(&state)?;
    if let Err(e) = capture::cleanup_session_tmp(strategy.ws, &event.session_id) {
        tracing::warn!("cleaning session temp files: {e:#}");
    }
    tracing::info!(session = %event.session_id, "session ended");
    Ok(())
}

fn on_subagent_start(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    let Some(tool_use_id) = event.tool_use_id.as_deref() else {
        tracing::warn!("subagent start without a tool-use id");
        return Ok(());
    };
    tracing::debug!(
        tool_use = tool_use_id,
        input = ?event.tool_input,
        "subagent baseline capture"
    );
    let snapshot =
        capture::build_snapshot(strategy.ws, agent, event.session_ref.as_deref());
    if let Err(e) = capture::write_pre_task(strategy.ws, tool_use_id, &snapshot) {
        tracing::warn!("writing pre-task snapshot: {e:#}");
    }
    Ok(())
}

fn on_subagent_end(
    strategy: &ManualCommitStrategy,
    agent: &dyn Agent,
    event: &Event,
) -> Result<()> {
    let Some(mut state) = strategy.store.load(&event.session_id)? else {
        tracing::warn!(session = %event.session_id, "subagent end for unknown session");
        return Ok(());
    };
    let Some(tool_use_id) = event.tool_use_id.as_deref() else {
        tracing::warn!("subagent end without a tool-use id");
        return Ok(());
    };
    let snapshot = capture::take_pre_task(strategy.ws, tool_use_id)?
        .unwrap_or_else(|| capture::PrePromptSnapshot::empty(Utc::now()));
    let subagent = event.subagent_id.as_deref().unwrap_or(tool_use_id);
    strategy.save_subagent_step(agent, &mut state, &snapshot, subagent)?;
    state.last_interaction_time = Utc::now();
    strategy.store.save(&state)?;
    Ok(())
}
