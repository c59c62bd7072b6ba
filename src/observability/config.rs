//! Logging Configuration
//!
//! All settings are loaded from environment variables for 12-factor compliance.

/// Output encoding for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive (default: info)
    pub filter: String,
    pub format: LogFormat,
    /// Service name attached to the root span (default: objsink)
    pub service_name: String,
    /// Environment tag (default: development)
    pub env: String,
    /// Service version (default: from Cargo.toml)
    pub version: String,
    /// Additional fields (parsed from OBJSINK_LOG_TAGS)
    pub global_tags: Vec<(String, String)>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        LogConfig {
            filter: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            format: match lookup("OBJSINK_LOG_FORMAT").as_deref() {
                Some("json") | Some("JSON") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            service_name: lookup("OBJSINK_SERVICE").unwrap_or_else(|| "objsink".to_string()),
            env: lookup("OBJSINK_ENV").unwrap_or_else(|| "development".to_string()),
            version: lookup("OBJSINK_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            global_tags: Self::parse_global_tags(&lookup("OBJSINK_LOG_TAGS").unwrap_or_default()),
        }
    }

    /// Parse tags of the form "key1:value1,key2:value2"
    fn parse_global_tags(raw: &str) -> Vec<(String, String)> {
        raw.split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|tag| {
                let (k, v) = tag.split_once(':')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    /// All tags as `key:value` strings
    pub fn formatted_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .global_tags
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();

        tags.push(format!("env:{}", self.env));
        tags.push(format!("service:{}", self.service_name));
        tags.push(format!("version:{}", self.version));

        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.service_name, "objsink");
        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.global_tags.is_empty());
    }

    #[test]
    fn test_json_and_tags() {
        let config = LogConfig::from_lookup(lookup(&[
            ("OBJSINK_LOG_FORMAT", "json"),
            ("OBJSINK_LOG_TAGS", "region:us-east-1,cluster:primary,bogus"),
            ("RUST_LOG", "objsink=debug"),
        ]));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter, "objsink=debug");
        assert_eq!(config.global_tags.len(), 2);
        assert_eq!(config.global_tags[0], ("region".to_string(), "us-east-1".to_string()));
        assert!(config.formatted_tags().contains(&"service:objsink".to_string()));
    }
}
