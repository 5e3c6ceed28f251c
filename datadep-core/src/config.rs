//! Instance configuration.

use serde::Deserialize;

/// Default suffix that binds a dependency to the previous value of a slot.
pub const DEFAULT_OLD_SUFFIX: &str = ":old";

/// Settings for an [`Instance`](crate::Instance).
///
/// Can be built in code or deserialized:
///
/// ```rust
/// use datadep_core::InstanceConfig;
///
/// let config = InstanceConfig::from_json(r#"{ "old_suffix": "@prev", "label": "form" }"#).unwrap();
/// assert_eq!(config.old_suffix, "@prev");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Suffix marking a "previous value" binding, e.g. `foo:old`.
    pub old_suffix: String,
    /// Label attached to the tracing span of every evaluation pass.
    pub label: Option<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            old_suffix: DEFAULT_OLD_SUFFIX.to_string(),
            label: None,
        }
    }
}

impl InstanceConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = InstanceConfig::from_json("{}").unwrap();
        assert_eq!(config, InstanceConfig::default());
        assert_eq!(config.old_suffix, ":old");
        assert!(config.label.is_none());
    }
}
