//! Logging setup for engine processes.

use std::io::IsTerminal as _;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Crates whose info-level output belongs to the operator. Everything
/// else (hypervisor clients, store backends, tokio internals) is
/// capped at warn unless `RUST_LOG` overrides the whole filter.
const ENGINE_CRATES: [&str; 3] = ["vmherd", "vmherd_core", "vmherd_engine"];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines (interactive use).
    Human,
    /// One JSON object per line (daemon mode, log shippers).
    Json,
}

impl LogFormat {
    /// Resolve an operator-supplied format string. Anything
    /// unrecognized auto-detects: human when stderr is a terminal,
    /// JSON when it is redirected.
    pub fn resolve(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "human" | "text" => Self::Human,
            _ => {
                if std::io::stderr().is_terminal() {
                    Self::Human
                } else {
                    Self::Json
                }
            }
        }
    }
}

/// Filter directives applied when `RUST_LOG` is unset: the vmherd
/// crates at info, dependencies at warn.
pub fn default_filter() -> String {
    let mut directives: Vec<String> = ENGINE_CRATES
        .iter()
        .map(|krate| format!("{}=info", krate))
        .collect();
    directives.push("warn".to_string());
    directives.join(",")
}

/// Install the global tracing subscriber on stderr.
///
/// Idempotent: if a subscriber is already installed (a second engine
/// in the same process, or a test harness that set its own), the
/// existing one is kept.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .json(),
            )
            .try_init(),
    };
    // Err means a subscriber already won the race; keep it.
    drop(installed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_engine_crates() {
        let filter = default_filter();
        for krate in ENGINE_CRATES {
            assert!(filter.contains(&format!("{}=info", krate)), "{}", filter);
        }
        assert!(filter.ends_with(",warn"));
        // Must be a filter EnvFilter actually accepts.
        assert!(EnvFilter::try_new(&filter).is_ok());
    }

    #[test]
    fn test_resolve_explicit_formats() {
        assert_eq!(LogFormat::resolve(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::resolve("json"), LogFormat::Json);
        assert_eq!(LogFormat::resolve("human"), LogFormat::Human);
        assert_eq!(LogFormat::resolve("Text"), LogFormat::Human);
    }

    #[test]
    fn test_resolve_unknown_picks_a_format() {
        // Auto-detection depends on where stderr points; it must
        // still land on one of the two variants without panicking.
        let auto = LogFormat::resolve("");
        assert!(auto == LogFormat::Human || auto == LogFormat::Json);
        assert_eq!(LogFormat::resolve("???"), auto);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LogFormat::Json);
        // Second install loses the race and is a no-op.
        init(LogFormat::Human);
    }
}
