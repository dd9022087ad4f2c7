// ── Tracing setup ──
//
// Installs the global subscriber: an `EnvFilter` (RUST_LOG wins over the
// configured filter) feeding either human-readable or JSON lines on stderr.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directives used when RUST_LOG is unset.
    pub filter: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "ontowatch=info".into(),
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

impl LogSettings {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_tracing(settings: &LogSettings) -> Result<(), ConfigError> {
    let registry = tracing_subscriber::registry().with(settings.env_filter());
    match settings.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(settings.ansi)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init()?,
    }
    tracing::debug!(filter = %settings.filter, format = %settings.format, "tracing initialised");
    Ok(())
}
