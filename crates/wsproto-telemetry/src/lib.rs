//! Logging setup for processes embedding the WebSocket server.

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output encoding of log records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Where log records are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "wsproto_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::DEBUG,
            module_levels: Vec::new(),
            format: LogFormat::Text,
            output: LogOutput::Stdout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Handle for changing log levels after initialization.
pub struct TelemetryGuard {
    handle: reload::Handle<EnvFilter, Registry>,
    levels: LevelOverrides,
}

impl TelemetryGuard {
    /// Change the default log level at runtime.
    pub fn set_level(&self, level: Level) -> Result<(), TelemetryError> {
        let filter = self.levels.set_default(level);
        self.apply(&filter)
    }

    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let filter = self.levels.set_module(module, level);
        self.apply(&filter)
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.levels.modules()
    }

    fn apply(&self, filter: &str) -> Result<(), TelemetryError> {
        self.handle.reload(EnvFilter::new(filter))?;
        Ok(())
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let levels = LevelOverrides::new(config.log_level, config.module_levels.clone());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config.log_level, &config.module_levels)));
    let (filter, handle) = reload::Layer::new(env_filter);

    let writer = match config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(TelemetryGuard { handle, levels })
}

/// Build an `EnvFilter` directive string such as `info,wsproto_server=debug`.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut directives = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Current default level plus module overrides, kept so a single change
/// can rebuild the whole filter.
struct LevelOverrides {
    state: RwLock<(Level, Vec<(String, Level)>)>,
}

impl LevelOverrides {
    fn new(level: Level, modules: Vec<(String, Level)>) -> Self {
        Self {
            state: RwLock::new((level, modules)),
        }
    }

    fn set_default(&self, level: Level) -> String {
        let mut state = self.state.write();
        state.0 = level;
        filter_directives(state.0, &state.1)
    }

    fn set_module(&self, module: &str, level: Level) -> String {
        let mut state = self.state.write();
        if let Some(entry) = state.1.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            state.1.push((module.to_string(), level));
        }
        filter_directives(state.0, &state.1)
    }

    fn modules(&self) -> Vec<(String, Level)> {
        self.state.read().1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_default_only() {
        assert_eq!(filter_directives(Level::INFO, &[]), "info");
    }

    #[test]
    fn directives_with_modules() {
        let modules = vec![
            ("wsproto_server".to_string(), Level::DEBUG),
            ("hyper".to_string(), Level::WARN),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &modules),
            "info,wsproto_server=debug,hyper=warn"
        );
    }

    #[test]
    fn overrides_update_existing_module() {
        let levels = LevelOverrides::new(Level::INFO, vec![("a".into(), Level::WARN)]);
        assert_eq!(levels.set_module("a", Level::TRACE), "info,a=trace");
        assert_eq!(levels.set_module("b", Level::ERROR), "info,a=trace,b=error");
        assert_eq!(levels.set_default(Level::DEBUG), "debug,a=trace,b=error");
        assert_eq!(levels.modules().len(), 2);
    }

    #[test]
    fn default_config_logs_text_to_stdout_at_debug() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.output, LogOutput::Stdout);
    }

    #[test]
    fn guard_changes_levels_at_runtime() {
        let config = TelemetryConfig {
            log_level: Level::INFO,
            module_levels: vec![("wsproto_server".into(), Level::WARN)],
            output: LogOutput::Stderr,
            ..Default::default()
        };
        match init_telemetry(config) {
            Ok(guard) => {
                guard.set_level(Level::WARN).unwrap();
                guard.set_module_level("wsproto_server", Level::DEBUG).unwrap();
                guard.set_module_level("hyper", Level::ERROR).unwrap();
                assert_eq!(
                    guard.module_levels(),
                    vec![
                        ("wsproto_server".to_string(), Level::DEBUG),
                        ("hyper".to_string(), Level::ERROR),
                    ]
                );
                tracing::warn!("telemetry reloaded");
            }
            // Another test in this binary already installed a subscriber.
            Err(TelemetryError::Init(_)) => {}
            Err(other) => panic!("unexpected: {other}"),
        }
    }
}
