//! Ambient logging setup, grounded on the teacher's `strata-common::logging`.
//! The opentelemetry exporter the teacher wires in is dropped here (see
//! DESIGN.md) — everything else (the stdout `tracing_subscriber` layer
//! driven by `EnvFilter::from_default_env`) is kept as-is.

pub mod logging {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    pub struct LoggerConfig {
        whoami: String,
    }

    impl LoggerConfig {
        pub fn new(whoami: impl Into<String>) -> Self {
            Self {
                whoami: whoami.into(),
            }
        }
    }

    /// Initializes the logging subsystem. Safe to call once per process;
    /// calling it twice will panic, same as the teacher's version.
    pub fn init(config: LoggerConfig) {
        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let stdout = tracing_subscriber::fmt::layer().compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .init();

        tracing::info!(whoami = %config.whoami, "logging started");
    }
}
