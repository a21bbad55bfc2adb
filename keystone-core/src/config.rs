//! Runtime configuration for shared references.

use serde::Deserialize;

/// Default backlog at which a change subscriber is reported as slow.
pub const DEFAULT_BACKLOG_WARNING: usize = 1024;

/// Settings applied to every reference cell a registry creates.
///
/// Can be deserialized from any serde format; missing fields take their
/// defaults.
///
/// ```rust,ignore
/// let config: SharedConfig = serde_json::from_str(r#"{ "backlog_warning": 256 }"#)?;
/// let registry = PersistentReferences::with_config(config);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// Number of undelivered changes a publisher may queue before a warning
    /// is logged. Changes are never dropped. Zero turns the warning off.
    pub backlog_warning: usize,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            backlog_warning: DEFAULT_BACKLOG_WARNING,
        }
    }
}

impl SharedConfig {
    /// The backlog that triggers a warning, if the warning is enabled.
    pub(crate) fn backlog_threshold(&self) -> Option<usize> {
        (self.backlog_warning > 0).then_some(self.backlog_warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: SharedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SharedConfig::default());
        assert_eq!(config.backlog_threshold(), Some(DEFAULT_BACKLOG_WARNING));
    }

    #[test]
    fn zero_disables_the_backlog_warning() {
        let config = SharedConfig { backlog_warning: 0 };
        assert_eq!(config.backlog_threshold(), None);
    }
}
