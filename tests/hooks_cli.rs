mod common;

use std::fs;

use common::{claude_common, run_entire, run_hook, temp_git_repo};

#[test]
fn hooks_are_no_ops_outside_a_repository() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_hook(
        dir.path(),
        "claude",
        "SessionStart",
        r#"{"hook_event_name":"SessionStart","session_id":"s","transcript_path":"/tmp/t.jsonl","cwd":"/tmp","source":"startup"}"#,
    );
    assert_eq!(code, 0, "agents must never be blocked outside a repo");
    assert!(stdout.is_empty());
}

#[test]
fn hooks_are_no_ops_when_disabled() {
    let repo = temp_git_repo();
    fs::create_dir_all(repo.path().join(".entire")).unwrap();
    fs::write(
        repo.path().join(".entire/settings.json"),
        r#"{"enabled": false}"#,
    )
    .unwrap();

    let transcript = repo.path().join("t.jsonl");
    let common = claude_common(repo.path(), &transcript, "s1");
    let (code, _, _) = run_hook(
        repo.path(),
        "claude",
        "SessionStart",
        &format!(r#"{{ {common}, "source": "startup" }}"#),
    );
    assert_eq!(code, 0);
    assert!(
        !repo.path().join(".git/sessions/s1.json").exists(),
        "disabled hooks must not write state"
    );
}

#[test]
fn unknown_agent_is_a_misconfiguration() {
    let repo = temp_git_repo();
    let (code, _, stderr) = run_hook(repo.path(), "copilot", "SessionStart", "{}");
    assert_eq!(code, 2);
    assert!(stderr.contains("unknown agent"), "stderr: {stderr}");
}

#[test]
fn unknown_strategy_is_a_misconfiguration() {
    let repo = temp_git_repo();
    fs::create_dir_all(repo.path().join(".entire")).unwrap();
    fs::write(
        repo.path().join(".entire/settings.json"),
        r#"{"strategy": "auto-commit"}"#,
    )
    .unwrap();
    let (code, _, stderr) = run_hook(repo.path(), "claude", "SessionStart", "{}");
    assert_eq!(code, 2);
    assert!(stderr.contains("strategy"), "stderr: {stderr}");
}

#[test]
fn malformed_payload_fails_the_hook() {
    let repo = temp_git_repo();
    let (code, _, stderr) = run_hook(repo.path(), "claude", "SessionStart", "{not json");
    assert_eq!(code, 1);
    assert!(stderr.contains("SessionStart"), "stderr: {stderr}");
}

#[test]
fn unrecognized_verb_is_acknowledged() {
    let repo = temp_git_repo();
    let (code, _, _) = run_hook(repo.path(), "claude", "PostToolUse", "{}");
    assert_eq!(code, 0);
}

#[test]
fn broken_settings_fall_back_to_defaults_for_hooks() {
    let repo = temp_git_repo();
    fs::create_dir_all(repo.path().join(".entire")).unwrap();
    fs::write(
        repo.path().join(".entire/settings.json"),
        r#"{"enbaled": true}"#,
    )
    .unwrap();

    let transcript = repo.path().join("t.jsonl");
    let common = claude_common(repo.path(), &transcript, "s1");
    let (code, _, stderr) = run_hook(
        repo.path(),
        "claude",
        "SessionStart",
        &format!(r#"{{ {common}, "source": "startup" }}"#),
    );
    assert_eq!(code, 0, "hook must proceed on defaults: {stderr}");
    assert!(stderr.contains("using defaults"), "stderr: {stderr}");
    assert!(repo.path().join(".git/sessions/s1.json").exists());
}

#[test]
fn sessions_command_outside_repo_is_a_misconfiguration() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, _) = run_entire(dir.path(), &["sessions"], "");
    assert_eq!(code, 2);
}

#[test]
fn sessions_command_lists_records() {
    let repo = temp_git_repo();
    let transcript = repo.path().join("t.jsonl");
    let common = claude_common(repo.path(), &transcript, "s1");
    let (code, _, _) = run_hook(
        repo.path(),
        "claude",
        "SessionStart",
        &format!(r#"{{ {common}, "source": "startup" }}"#),
    );
    assert_eq!(code, 0);

    let (code, stdout, _) = run_entire(repo.path(), &["sessions"], "");
    assert_eq!(code, 0);
    assert!(stdout.contains("s1"), "stdout: {stdout}");
    assert!(stdout.contains("claude"), "stdout: {stdout}");
}

#[test]
fn opencode_payload_arrives_as_the_last_argument() {
    let repo = temp_git_repo();
    let (code, _, stderr) = run_entire(
        repo.path(),
        &[
            "hooks",
            "opencode",
            "session.created",
            r#"{"sessionID":"ses_9"}"#,
        ],
        "",
    );
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(
        repo.path().join(".git/sessions/ses_9.json").exists(),
        "legacy argv payload is normalized by the dispatcher"
    );
}

#[test]
fn empty_repository_short_circuits_politely() {
    // A repo with no commits at all.
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();

    let transcript = dir.path().join("t.jsonl");
    let common = claude_common(dir.path(), &transcript, "s1");
    let (code, _, stderr) = run_hook(
        dir.path(),
        "claude",
        "SessionStart",
        &format!(r#"{{ {common}, "source": "startup" }}"#),
    );
    assert_eq!(code, 0, "empty repo must not block the agent");
    assert!(stderr.contains("no commits"), "stderr: {stderr}");
}
