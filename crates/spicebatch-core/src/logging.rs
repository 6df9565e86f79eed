//! Log output configuration
//!
//! The library only emits `tracing` events. Applications (and the bindings)
//! install a subscriber through [`LogConfig::init`]; `RUST_LOG` takes
//! precedence over the configured levels when it is set.

use indexmap::IndexMap;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

const CRATE_TARGET: &str = "spicebatch_core";

/// Levels and formatting of the log output
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Per-component levels keyed by target
    pub components: IndexMap<String, Level>,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            components: IndexMap::new(),
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Level for one component: `raw`, `sim`, or any full target path
    pub fn component(mut self, name: &str, level: Level) -> Self {
        let target = match name {
            "raw" | "sim" | "logging" => format!("{}::{}", CRATE_TARGET, name),
            _ => name.to_string(),
        };
        self.components.insert(target, level);
        self
    }

    pub fn ansi(mut self, on: bool) -> Self {
        self.ansi = on;
        self
    }

    /// Filter directives, e.g. `info,spicebatch_core::sim=debug`
    pub fn directives(&self) -> String {
        let mut out = self.level.as_str().to_lowercase();
        for (target, level) in &self.components {
            out.push_str(&format!(",{}={}", target, level.as_str().to_lowercase()));
        }
        out
    }

    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }

    /// Install a global `fmt` subscriber; returns `false` when one was already installed
    pub fn init(&self) -> bool {
        fmt()
            .with_env_filter(self.env_filter())
            .with_ansi(self.ansi)
            .with_target(true)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives() {
        let config = LogConfig::new(Level::WARN)
            .component("sim", Level::DEBUG)
            .component("my_app", Level::TRACE);
        assert_eq!(
            config.directives(),
            "warn,spicebatch_core::sim=debug,my_app=trace"
        );
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = LogConfig::default().ansi(false);
        let first = config.init();
        let second = config.init();
        assert!(!second || !first);
    }
}
