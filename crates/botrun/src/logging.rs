//! Tracing setup shared by the orchestrator and its children.
//!
//! Everything logs to stderr; children inherit the orchestrator's stderr, and their
//! stdout is the control channel.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "BOTRUN_LOG";

fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    level.to_string()
}

/// Install the global subscriber. `RUST_LOG` wins over `BOTRUN_LOG`;
/// `LOG_FORMAT=json` switches to JSON lines. Calling it again is a no-op.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var(LOG_ENV).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(default_filter(None), "info");
        assert_eq!(default_filter(Some("warning")), "warn");
        assert_eq!(default_filter(Some("debug")), "debug");
        assert_eq!(default_filter(Some("nonsense")), "info");
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
