use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::checkpoint::{shadow_ref_name, trailer, CHECKPOINTS_REF};
use crate::session::state::{SessionState, SessionStore};

/// Sessions untouched for this many days become eligible for removal.
pub const STALE_SESSION_THRESHOLD_DAYS: i64 = 14;

/// Summary of one full collection pass.
#[derive(Debug, Default)]
pub struct GcSummary {
    pub stale_sessions: usize,
    pub shadow_refs: usize,
    pub orphaned_checkpoints: usize,
}

/// Delete session records that are idle or ended, carry nothing forward,
/// and have not been touched since the staleness threshold.
pub fn sweep_stale_sessions(
    store: &SessionStore,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let threshold = chrono::Duration::days(STALE_SESSION_THRESHOLD_DAYS);
    for session in store.list()? {
        if session.is_stale(now, threshold) {
            store.remove(&session.session_id)?;
            removed.push(session.session_id);
        }
    }
    Ok(removed)
}

/// Delete shadow references no session's `(base commit, worktree)` maps
/// to any more.  Objects stay behind for git's own gc.
pub fn sweep_orphaned_shadow_refs(
    repo: &git2::Repository,
    sessions: &[SessionState],
) -> Result<Vec<String>> {
    let live: HashSet<String> = sessions
        .iter()
        .filter_map(|s| {
            git2::Oid::from_str(&s.base_commit)
                .ok()
                .map(|base| shadow_ref_name(base, &s.worktree_id))
        })
        .collect();

    let mut removed = Vec::new();
    let refs = repo
        .references_glob("refs/heads/shadow/*")
        .context("listing shadow references")?;
    for reference in refs {
        let mut reference = reference.context("reading shadow reference")?;
        let Some(name) = reference.name().map(String::from) else {
            continue;
        };
        if !live.contains(&name) {
            reference
                .delete()
                .with_context(|| format!("deleting {name}"))?;
            removed.push(name);
        }
    }
    Ok(removed)
}

/// Checkpoint IDs referenced by any commit reachable from a local branch
/// other than the shadow and checkpoint references themselves.
fn reachable_trailer_ids(repo: &git2::Repository) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    let mut walk = repo.revwalk().context("starting revwalk")?;
    let mut pushed = false;
    for branch in repo.branches(Some(git2::BranchType::Local)).context("listing branches")? {
        let (branch, _) = branch.context("reading branch")?;
        let Some(name) = branch.get().name() else { continue };
        if name.starts_with("refs/heads/shadow/") || name == CHECKPOINTS_REF {
            continue;
        }
        if let Some(target) = branch.get().target() {
            walk.push(target)
                .with_context(|| format!("pushing {name}"))?;
            pushed = true;
        }
    }
    if !pushed {
        return Ok(ids);
    }
    for oid in walk {
        let oid = oid.context("walking branch history")?;
        let commit = repo.find_commit(oid).context("loading commit")?;
        if let Some(id) = commit.message().and_then(trailer::parse_trailer) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Remove condensation commits whose checkpoint ID is referenced neither
/// by a reachable commit trailer nor by any session record, rewriting the
/// permanent reference in place.  The reference itself is never deleted.
pub fn sweep_orphaned_checkpoints(
    repo: &git2::Repository,
    sessions: &[SessionState],
) -> Result<usize> {
    let tip = match repo.find_reference(CHECKPOINTS_REF) {
        Ok(r) => match r.target() {
            Some(t) => t,
            None => return Ok(0),
        },
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(0),
        Err(e) => return Err(e).context("reading checkpoint reference"),
    };

    let mut keep_ids = reachable_trailer_ids(repo)?;
    for session in sessions {
        if let Some(id) = &session.pending_checkpoint_id {
            keep_ids.insert(id.clone());
        }
        for id in &session.turn_checkpoint_ids {
            keep_ids.insert(id.clone());
        }
    }

    // Oldest-first chain of (commit, keep?).
    let mut chain = Vec::new();
    let mut walk = repo.revwalk().context("starting revwalk")?;
    walk.push(tip).context("pushing checkpoint tip")?;
    for oid in walk {
        let oid = oid.context("walking checkpoint history")?;
        let commit = repo.find_commit(oid).context("loading checkpoint commit")?;
        let keep = commit
            .message()
            .and_then(trailer::parse_trailer)
            .map(|id| keep_ids.contains(&id))
            // Commits without a parseable ID are preserved.
            .unwrap_or(true);
        chain.push((oid, keep));
    }
    chain.reverse();

    let dropped = chain.iter().filter(|(_, keep)| !keep).count();
    if dropped == 0 {
        return Ok(0);
    }

    // Rebuild the kept commits on a fresh parent chain.
    let mut parent: Option<git2::Oid> = None;
    for (oid, keep) in chain {
        if !keep {
            continue;
        }
        let commit = repo.find_commit(oid).context("loading kept commit")?;
        let tree = commit.tree().context("loading kept tree")?;
        let message = commit.message().unwrap_or_default().to_string();
        let author = commit.author();
        let new_oid = match parent {
            Some(p) => {
                let parent_commit = repo.find_commit(p).context("loading new parent")?;
                repo.commit(None, &author, &author, &message, &tree, &[&parent_commit])
            }
            None => repo.commit(None, &author, &author, &message, &tree, &[]),
        }
        .context("rewriting checkpoint commit")?;
        parent = Some(new_oid);
    }

    match parent {
        Some(new_tip) => {
            repo.reference(CHECKPOINTS_REF, new_tip, true, "entire: gc rewrite")
                .context("moving checkpoint reference")?;
        }
        None => {
            // Every checkpoint was orphaned; park the ref on an empty
            // commit so the branch itself survives.
            let sig = repo
                .signature()
                .or_else(|_| git2::Signature::now("entire", "entire@localhost"))
                .context("building signature")?;
            let builder = repo.treebuilder(None).context("creating empty tree")?;
            let tree_oid = builder.write().context("writing empty tree")?;
            let tree = repo.find_tree(tree_oid).context("loading empty tree")?;
            let new_tip = repo
                .commit(None, &sig, &sig, "entire: checkpoints pruned\n", &tree, &[])
                .context("creating placeholder commit")?;
            repo.reference(CHECKPOINTS_REF, new_tip, true, "entire: gc rewrite")
                .context("moving checkpoint reference")?;
        }
    }
    Ok(dropped)
}

/// Run all three sweepers.
pub fn collect(
    repo: &git2::Repository,
    store: &SessionStore,
    now: DateTime<Utc>,
) -> Result<GcSummary> {
    let mut summary = GcSummary::default();
    summary.stale_sessions = sweep_stale_sessions(store, now)?.len();
    let sessions = store.list()?;
    summary.shadow_refs = sweep_orphaned_shadow_refs(repo, &sessions)?.len();
    summary.orphaned_checkpoints = sweep_orphaned_checkpoints(repo, &sessions)?;
    Ok(summary)
}
