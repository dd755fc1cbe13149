use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;

use crate::agent::Registry;
use crate::checkpoint::{gc, trailer, CHECKPOINTS_REF};
use crate::paths::Workspace;
use crate::settings::Settings;
use crate::strategy::ManualCommitStrategy;

/// Route an `entire hooks git <verb>` invocation.
pub fn handle_git_hook(
    ws: &Workspace,
    settings: &Settings,
    registry: &Registry,
    verb: &str,
    args: &[String],
) -> Result<()> {
    match verb {
        "prepare-commit-msg" => prepare_commit_msg(ws, settings, args),
        "commit-msg" => commit_msg(args),
        "post-commit" => post_commit(ws, settings, registry),
        "pre-push" => pre_push(ws, settings, args),
        other => anyhow::bail!("unknown git hook verb {other:?}"),
    }
}

/// Append the `Entire-Checkpoint:` trailer to the message being edited,
/// when any session on this worktree could condense into the commit.
/// The minted ID is parked for post-commit in case the user rewrites the
/// message and strips the trailer.
fn prepare_commit_msg(ws: &Workspace, settings: &Settings, args: &[String]) -> Result<()> {
    let file = args
        .first()
        .context("prepare-commit-msg requires the message file path")?;
    let source = args.get(1).map(String::as_str);
    // Merge and squash commits assemble history rather than new work.
    if matches!(source, Some("merge" | "squash")) {
        return Ok(());
    }

    let strategy = ManualCommitStrategy::new(ws, settings);
    if !strategy.has_condensation_candidate()? {
        return Ok(());
    }

    let message = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    if trailer::parse_trailer(&message).is_some() {
        return Ok(());
    }
    let id = trailer::new_checkpoint_id();
    fs::write(file, trailer::append_trailer(&message, &id))
        .with_context(|| format!("writing {file}"))?;
    strategy.park_trailer(&id)?;
    tracing::debug!(checkpoint = id.as_str(), "trailer added to commit message");
    Ok(())
}

/// Validate the trailer when present.  A missing trailer is fine (the
/// user may have written their own message); a malformed one is a
/// recoverable failure.
fn commit_msg(args: &[String]) -> Result<()> {
    let file = args
        .first()
        .context("commit-msg requires the message file path")?;
    let message = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    if let Some(id) = trailer::parse_trailer(&message) {
        if !trailer::is_well_formed_id(&id) {
            anyhow::bail!("malformed {} trailer: {id:?}", trailer::TRAILER_KEY);
        }
    }
    Ok(())
}

/// Condense the sessions the just-made commit belongs to, then run the
/// cheap cleanup sweepers.
fn post_commit(ws: &Workspace, settings: &Settings, registry: &Registry) -> Result<()> {
    let strategy = ManualCommitStrategy::new(ws, settings);
    strategy.post_commit(registry)?;

    let removed = gc::sweep_stale_sessions(&strategy.store, Utc::now())?;
    let sessions = strategy.store.list()?;
    let refs = gc::sweep_orphaned_shadow_refs(&ws.repo, &sessions)?;
    if !removed.is_empty() || !refs.is_empty() {
        tracing::info!(
            stale_sessions = removed.len(),
            shadow_refs = refs.len(),
            "post-commit cleanup"
        );
    }
    Ok(())
}

/// Best-effort push of the permanent reference alongside the user's own
/// push.  Failures never block the push itself.
fn pre_push(ws: &Workspace, settings: &Settings, args: &[String]) -> Result<()> {
    if !settings.push_sessions {
        return Ok(());
    }
    let remote_name = args.first().map(String::as_str).unwrap_or("origin");
    let mut remote = match ws.repo.find_remote(remote_name) {
        Ok(remote) => remote,
        Err(e) => {
            tracing::warn!("no remote {remote_name:?}: {e}");
            return Ok(());
        }
    };
    let refspec = format!("{CHECKPOINTS_REF}:{CHECKPOINTS_REF}");
    if let Err(e) = remote.push(&[refspec.as_str()], None) {
        tracing::warn!("pushing {CHECKPOINTS_REF} to {remote_name}: {e}");
    }
    Ok(())
}
