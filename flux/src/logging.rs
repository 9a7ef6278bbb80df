//! Structured logging setup shared by every binary in the workspace. Nothing here is a
//! process-wide singleton: callers build a `Logger` once at startup and thread it down
//! explicitly, the way the rest of the core expects it to be injected.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use serdeconv;
use sloggers::{Build, Config, LoggerConfig};

/// Build the default terminal logger from an embedded config, mirroring how config-driven
/// services in this workspace bootstrap their logger. `verbose` bumps the level to trace.
pub fn init(verbose: bool) -> Logger {
    let level = if verbose { "trace" } else { "info" };

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("built-in logger config is valid toml");

    config.build_logger().expect("failed to initialize logger")
}

/// A logger that discards everything, used by tests and library callers that don't want to
/// wire up their own sink.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
