#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Run the `entire` binary inside `dir` with the given args, feeding
/// `stdin_json` on stdin.  Returns (exit code, stdout, stderr).
pub fn run_entire(dir: &Path, args: &[&str], stdin_json: &str) -> (i32, String, String) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_entire"))
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn binary");

    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(stdin_json.as_bytes())
        .unwrap();

    let output = child.wait_with_output().unwrap();
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

/// Shorthand for an agent hook invocation.
pub fn run_hook(dir: &Path, agent: &str, verb: &str, stdin_json: &str) -> (i32, String, String) {
    run_entire(dir, &["hooks", agent, verb], stdin_json)
}

/// Create a temp git repo with an initial commit, checked out on a
/// feature branch `work` so step snapshots are not skipped by the
/// default-branch rule.  The `TempDir` must be kept alive for the test.
pub fn temp_git_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();

    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();

    let workdir = repo.workdir().unwrap().to_path_buf();
    fs::write(workdir.join("README.md"), "# test\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_oid = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = repo.signature().unwrap();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();

    let commit = repo.find_commit(oid).unwrap();
    repo.branch("work", &commit, false).unwrap();
    repo.set_head("refs/heads/work").unwrap();

    dir
}

/// Stage the given paths and commit with `message`.  Returns the new
/// commit OID.  Paths missing from the worktree are staged as deletions.
pub fn commit_paths(repo_path: &Path, paths: &[&str], message: &str) -> git2::Oid {
    let repo = git2::Repository::open(repo_path).unwrap();
    let workdir = repo.workdir().unwrap().to_path_buf();
    let mut index = repo.index().unwrap();
    for path in paths {
        if workdir.join(path).exists() {
            index.add_path(Path::new(path)).unwrap();
        } else {
            index.remove_path(Path::new(path)).unwrap();
        }
    }
    index.write().unwrap();
    let tree_oid = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = repo.signature().unwrap();
    let parent = repo.head().unwrap().peel_to_commit().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .unwrap()
}

pub fn head_oid(repo_path: &Path) -> git2::Oid {
    let repo = git2::Repository::open(repo_path).unwrap();
    repo.head().unwrap().peel_to_commit().unwrap().id()
}

/// Path of a session record: `<git-dir>/sessions/<session-id>.json`.
pub fn session_state_path(repo_path: &Path, session_id: &str) -> PathBuf {
    repo_path
        .join(".git/sessions")
        .join(format!("{session_id}.json"))
}

pub fn read_session_state(repo_path: &Path, session_id: &str) -> serde_json::Value {
    let contents = fs::read_to_string(session_state_path(repo_path, session_id)).unwrap();
    serde_json::from_str(&contents).unwrap()
}

/// Commits on the permanent checkpoint branch, newest first, as
/// `(oid, message)`.  Empty when the branch does not exist.
pub fn checkpoint_commits(repo_path: &Path) -> Vec<(git2::Oid, String)> {
    let repo = git2::Repository::open(repo_path).unwrap();
    let tip = match repo.find_reference("refs/heads/entire/checkpoints/v1") {
        Ok(r) => r.target().unwrap(),
        Err(_) => return Vec::new(),
    };
    let mut walk = repo.revwalk().unwrap();
    walk.push(tip).unwrap();
    walk.map(|oid| {
        let oid = oid.unwrap();
        let message = repo
            .find_commit(oid)
            .unwrap()
            .message()
            .unwrap_or_default()
            .to_string();
        (oid, message)
    })
    .collect()
}

/// Shadow branch names currently present in the repository.
pub fn shadow_refs(repo_path: &Path) -> Vec<String> {
    let repo = git2::Repository::open(repo_path).unwrap();
    repo.references_glob("refs/heads/shadow/*")
        .unwrap()
        .filter_map(|r| r.unwrap().name().map(String::from))
        .collect()
}

/// Read a blob out of a commit's tree by path.
pub fn blob_at(repo_path: &Path, commit: git2::Oid, path: &str) -> Option<Vec<u8>> {
    let repo = git2::Repository::open(repo_path).unwrap();
    let tree = repo.find_commit(commit).unwrap().tree().unwrap();
    let entry = tree.get_path(Path::new(path)).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    Some(blob.content().to_vec())
}

// ===================================================================
// Claude payload and transcript fixtures
// ===================================================================

/// Common hook payload fields for a Claude event.
pub fn claude_common(cwd: &Path, transcript_path: &Path, session_id: &str) -> String {
    format!(
        r#""session_id": "{session_id}", "transcript_path": "{}", "cwd": "{}""#,
        transcript_path.display(),
        cwd.display(),
    )
}

/// One user + assistant exchange in Claude JSONL form.  The assistant
/// entry carries a `Write` tool call for each path in `written`, stamped
/// with the current time so transcript preparation sees a fresh tail.
pub fn claude_turn(prompt: &str, written: &[&str], response: &str) -> String {
    let now = chrono::Utc::now().to_rfc3339();
    let key = prompt.replace(' ', "-");
    let mut blocks: Vec<String> = written
        .iter()
        .map(|path| {
            format!(
                r#"{{"type":"tool_use","name":"Write","input":{{"file_path":"{path}","content":"x"}}}}"#
            )
        })
        .collect();
    blocks.push(format!(r#"{{"type":"text","text":"{response}"}}"#));
    format!(
        "{{\"type\":\"user\",\"uuid\":\"u-{key}\",\"isSidechain\":false,\"timestamp\":\"{now}\",\"message\":{{\"role\":\"user\",\"content\":\"{prompt}\"}}}}\n\
         {{\"type\":\"assistant\",\"uuid\":\"a-{key}\",\"isSidechain\":false,\"timestamp\":\"{now}\",\"message\":{{\"role\":\"assistant\",\"content\":[{blocks}],\"usage\":{{\"input_tokens\":10,\"output_tokens\":5}}}}}}\n",
        blocks = blocks.join(","),
    )
}

/// Drive one full turn for a Claude session: prompt submit, write the
/// given files, append the transcript exchange, and stop.
pub fn run_claude_turn(
    repo_path: &Path,
    transcript_path: &Path,
    session_id: &str,
    prompt: &str,
    files: &[(&str, &str)],
) {
    let common = claude_common(repo_path, transcript_path, session_id);
    let (code, _, stderr) = run_hook(
        repo_path,
        "claude",
        "UserPromptSubmit",
        &format!(r#"{{ {common}, "prompt": "{prompt}" }}"#),
    );
    assert_eq!(code, 0, "prompt submit failed: {stderr}");

    for (path, contents) in files {
        let full = repo_path.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }

    let written: Vec<&str> = files.iter().map(|(p, _)| *p).collect();
    let mut transcript = if transcript_path.exists() {
        fs::read_to_string(transcript_path).unwrap()
    } else {
        String::new()
    };
    transcript.push_str(&claude_turn(prompt, &written, "done"));
    fs::write(transcript_path, transcript).unwrap();

    let (code, _, stderr) = run_hook(
        repo_path,
        "claude",
        "Stop",
        &format!(r#"{{ {common}, "stop_hook_active": false }}"#),
    );
    assert_eq!(code, 0, "stop failed: {stderr}");
}
