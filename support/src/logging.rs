//! Logging facade built on `slog` + `sloggers`, mirroring the source's `flux::logging`.
//!
//! Every module in `reactor`, `dispatcher` and `resolver` logs through a `slog::Logger`
//! obtained from [`root`] or handed down from a caller, rather than a process-wide global.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Builds the default terminal logger used when a caller does not supply its own.
///
/// Mirrors the source's `msg_err`/`msg_warn`/`msg_info` call sites, which always had a
/// destination to write to; here that destination is stderr at debug level unless overridden.
pub fn root(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// A logger that discards everything, used in tests and wherever a caller passes no logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Builds a logger from a TOML-encoded `sloggers::LoggerConfig` (source: `flux::logging::init`,
/// which hardcoded an equivalent `type = "terminal" / level = "debug" / destination = "stderr"`
/// document inline; this makes that document a caller-supplied argument instead).
pub fn from_toml(toml: &str) -> Result<Logger, Box<dyn std::error::Error>> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml)?;
    let logger = config.build_logger()?;
    Ok(logger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_logger_from_a_toml_document() {
        let logger = from_toml(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .unwrap();
        info!(logger, "support::logging self-test"; "ok" => true);
    }

    #[test]
    fn rejects_an_unparseable_document() {
        assert!(from_toml("not valid toml = [").is_err());
    }
}
