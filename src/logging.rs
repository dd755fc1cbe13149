use tracing_subscriber::EnvFilter;

/// Env var that overrides the `log_level` setting.
pub const LOG_ENV: &str = "ENTIRE_LOG";

/// Initialize the stderr tracing subscriber.  Precedence:
/// `ENTIRE_LOG` env var > `--debug` flag > `log_level` setting > `warn`.
///
/// Safe to call more than once (later calls are ignored), which matters
/// for in-process tests.
pub fn init(settings_level: Option<&str>, debug: bool) {
    let filter = match std::env::var(LOG_ENV) {
        Ok(spec) if !spec.is_empty() => EnvFilter::new(spec),
        _ if debug => EnvFilter::new("entire=debug"),
        _ => EnvFilter::new(format!("entire={}", settings_level.unwrap_or("warn"))),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
