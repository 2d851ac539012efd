//! Structured logging setup for the governance plugin
//!
//! Builds tracing filter directives from the logging configuration and
//! installs the global subscriber the way the host gateway expects.

use crate::config::{LogFormat, LoggingConfig};

/// Build filter directives string from LoggingConfig
///
/// Constructs a tracing filter string that includes the base log level
/// and any component-specific log levels configured in the LoggingConfig.
///
/// # Examples
///
/// ```
/// use aegis::config::logging::LoggingConfig;
/// use aegis::logging::build_filter_directives;
/// use std::collections::HashMap;
///
/// let mut component_levels = HashMap::new();
/// component_levels.insert("store".to_string(), "debug".to_string());
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: aegis::config::logging::LogFormat::Pretty,
///     component_levels: Some(component_levels),
///     log_decisions: false,
/// };
///
/// let filter_str = build_filter_directives(&config);
/// assert_eq!(filter_str, "info,aegis::store=debug");
/// ```
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let mut filter_str = config.level.clone();

    if let Some(component_levels) = &config.component_levels {
        let mut components: Vec<_> = component_levels.iter().collect();
        components.sort();
        for (component, level) in components {
            filter_str.push_str(&format!(",aegis::{}={}", component, level));
        }
    }

    filter_str
}

/// Install the global tracing subscriber for standalone use of the plugin.
///
/// A host gateway that already owns a subscriber should skip this and rely
/// on `build_filter_directives` alone.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(build_filter_directives(config)));

    match config.format {
        LogFormat::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init();
        }
        LogFormat::Pretty => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
}
