mod agent;
mod capture;
mod checkpoint;
mod cli;
mod dispatch;
mod errors;
mod event;
mod githooks;
mod logging;
mod paths;
mod session;
mod settings;
mod strategy;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::process;

use agent::{PayloadSource, Registry};
use cli::{Cli, Command};
use paths::Workspace;
use session::state::SessionStore;
use settings::Settings;

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Hooks { target, verb, args } => run_hook(&target, &verb, &args, cli.debug),
        Command::Sessions => run_sessions(cli.debug),
        Command::Checkpoints { id } => run_checkpoints(id.as_deref(), cli.debug),
        Command::Gc => run_gc(cli.debug),
    };
    process::exit(code);
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buffer)
        .context("reading hook payload from stdin")?;
    Ok(buffer)
}

/// Hook verbs never block the agent: outside a repository or with
/// `enabled=false` they are silent no-ops that exit 0.
fn run_hook(target: &str, verb: &str, args: &[String], debug: bool) -> i32 {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("entire: reading working directory: {e}");
            return 2;
        }
    };
    let ws = match Workspace::discover(&cwd) {
        Ok(ws) => ws,
        Err(_) => return 0,
    };
    let settings = match Settings::load(&ws.data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            // A broken settings file must not block the agent.
            eprintln!("entire: {e:#}; using defaults");
            Settings::default()
        }
    };
    logging::init(settings.log_level.as_deref(), debug);
    tracing::debug!(
        enabled = settings.enabled,
        push_sessions = settings.push_sessions,
        summarize = settings.summarize,
        telemetry = ?settings.telemetry,
        "settings loaded"
    );
    if !settings.enabled {
        return 0;
    }
    if let Err(e) = settings.validate() {
        eprintln!("entire: {e:#}");
        return 2;
    }

    let registry = Registry::builtin();
    let result = if target == "git" {
        githooks::handle_git_hook(&ws, &settings, &registry, verb, args)
    } else {
        let Some(agent) = registry.get(target) else {
            eprintln!("entire: unknown agent {target:?}; supported agents:");
            eprintln!("{}", registry.describe());
            return 2;
        };
        let payload = match agent.payload_source() {
            PayloadSource::Stdin => match read_stdin() {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("entire: {e:#}");
                    return 1;
                }
            },
            // The legacy variant delivers the payload as the final
            // argument; fall back to stdin when it is absent.
            PayloadSource::LastArg => match args.last() {
                Some(arg) => arg.clone().into_bytes(),
                None => match read_stdin() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        eprintln!("entire: {e:#}");
                        return 1;
                    }
                },
            },
        };
        dispatch::dispatch(&ws, &settings, agent, verb, &payload)
    };

    match result {
        Ok(()) => 0,
        Err(e) if errors::is_benign(&e) => {
            eprintln!("entire: {e:#}");
            0
        }
        Err(e) => {
            eprintln!("entire: {e:#}");
            1
        }
    }
}

fn open_workspace(debug: bool) -> Result<(Workspace, Settings), i32> {
    let cwd = std::env::current_dir().map_err(|e| {
        eprintln!("entire: reading working directory: {e}");
        2
    })?;
    let ws = Workspace::discover(&cwd).map_err(|e| {
        eprintln!("entire: {e:#}");
        2
    })?;
    let settings = Settings::load(&ws.data_dir).map_err(|e| {
        eprintln!("entire: {e:#}");
        2
    })?;
    logging::init(settings.log_level.as_deref(), debug);
    Ok((ws, settings))
}

fn run_sessions(debug: bool) -> i32 {
    let (ws, _settings) = match open_workspace(debug) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let store = SessionStore::new(ws.sessions_dir());
    let sessions = match store.list() {
        Ok(sessions) => sessions,
        Err(e) => {
            eprintln!("entire: {e:#}");
            return 1;
        }
    };
    if sessions.is_empty() {
        println!("no sessions recorded");
        return 0;
    }
    for s in sessions {
        let prompt = s.first_prompt.as_deref().unwrap_or("-");
        let preview: String = prompt.chars().take(48).collect();
        println!(
            "{}  {:<8}  {:<16}  steps={:<3} carry={:<3} {}",
            s.session_id,
            s.agent_type,
            s.phase,
            s.step_count,
            s.files_touched.len(),
            preview,
        );
    }
    0
}

fn run_checkpoints(id: Option<&str>, debug: bool) -> i32 {
    let (ws, _settings) = match open_workspace(debug) {
        Ok(v) => v,
        Err(code) => return code,
    };
    match id {
        None => {
            let checkpoints = match checkpoint::list_checkpoints(&ws.repo) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("entire: {e:#}");
                    return 1;
                }
            };
            if checkpoints.is_empty() {
                println!("no checkpoints recorded");
                return 0;
            }
            for c in checkpoints {
                println!(
                    "{}  {}  session={}  {}",
                    c.checkpoint_id.as_deref().unwrap_or("-"),
                    &c.commit.to_string()[..8],
                    c.session_id.as_deref().unwrap_or("-"),
                    c.summary.as_deref().unwrap_or(""),
                );
            }
            0
        }
        Some(id) => {
            let commit = match checkpoint::find_checkpoint_commit(&ws.repo, id) {
                Ok(Some(commit)) => commit,
                Ok(None) => {
                    eprintln!("entire: no checkpoint {id:?}");
                    return 1;
                }
                Err(e) => {
                    eprintln!("entire: {e:#}");
                    return 1;
                }
            };
            let registry = Registry::builtin();
            // Transcript formats differ per agent, but the chunk layout
            // is adapter-neutral enough that any reassembler works for
            // display purposes.
            let agent = registry.get("claude").expect("builtin adapter");
            match checkpoint::read_committed_context(&ws.repo, commit) {
                Ok(Some(context)) => print!("{context}"),
                Ok(None) => println!("checkpoint {id} has no context document"),
                Err(e) => {
                    eprintln!("entire: {e:#}");
                    return 1;
                }
            }
            match checkpoint::read_committed_transcript(&ws.repo, agent, commit) {
                Ok(transcript) => {
                    println!("\ntranscript: {} bytes", transcript.len());
                    0
                }
                Err(e) => {
                    eprintln!("entire: {e:#}");
                    1
                }
            }
        }
    }
}

fn run_gc(debug: bool) -> i32 {
    let (ws, _settings) = match open_workspace(debug) {
        Ok(v) => v,
        Err(code) => return code,
    };
    let store = SessionStore::new(ws.sessions_dir());
    match checkpoint::gc::collect(&ws.repo, &store, chrono::Utc::now()) {
        Ok(summary) => {
            println!(
                "gc: removed {} stale sessions, {} shadow refs, {} orphaned checkpoints",
                summary.stale_sessions, summary.shadow_refs, summary.orphaned_checkpoints
            );
            0
        }
        Err(e) => {
            eprintln!("entire: {e:#}");
            1
        }
    }
}
