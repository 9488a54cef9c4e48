//! Logging configuration.

use serde::Deserialize;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `mqbridge=debug,info`.
    pub level: String,
    #[serde(alias = "encoder")]
    pub format: LogFormat,
    /// ANSI colours (text format only).
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            color: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert!(!config.color);
    }

    #[test]
    fn test_log_config_accepts_encoder_alias() {
        let config: LogConfig = serde_json::from_str(r#"{"encoder":"text","level":"debug"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "debug");
    }
}
