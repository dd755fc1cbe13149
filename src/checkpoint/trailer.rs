use uuid::Uuid;

/// Trailer key on user commits that were associated with a condensed
/// session.
pub const TRAILER_KEY: &str = "Entire-Checkpoint";

/// Mint an opaque 128-bit checkpoint ID.
pub fn new_checkpoint_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Extract the checkpoint ID from a commit message, if present.
pub fn parse_trailer(message: &str) -> Option<String> {
    let prefix = format!("{TRAILER_KEY}:");
    message
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Check that a trailer value looks like an ID we minted.
pub fn is_well_formed_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Append the trailer to a commit message, idempotently.  Comment lines
/// (as found in the `prepare-commit-msg` file) stay below the trailer.
pub fn append_trailer(message: &str, id: &str) -> String {
    if parse_trailer(message).is_some() {
        return message.to_string();
    }
    let lines: Vec<&str> = message.lines().collect();
    let last_content = lines
        .iter()
        .rposition(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
    let trailer = format!("{TRAILER_KEY}: {id}");
    match last_content {
        Some(i) => {
            let mut out: Vec<String> = lines[..=i].iter().map(|s| s.to_string()).collect();
            out.push(String::new());
            out.push(trailer);
            for line in &lines[i + 1..] {
                out.push(line.to_string());
            }
            out.join("\n") + "\n"
        }
        None => format!("{trailer}\n{message}"),
    }
}
