//! Placeholder parameters.

use std::collections::BTreeMap;

/// Service display name.
pub const SERVICE_NAME: &str = "SERVICE_NAME";
/// Deployment identifier.
pub const SERVICE_ID: &str = "SERVICE_ID";
/// Original request text.
pub const DESCRIPTION: &str = "DESCRIPTION";
/// Category name.
pub const CATEGORY: &str = "CATEGORY";
/// Port the service listens on inside its container.
pub const PORT: &str = "PORT";
/// Comma-separated requirement labels.
pub const REQUIREMENTS: &str = "REQUIREMENTS";

/// Values substituted for `{{NAME}}` markers.
///
/// Backed by an ordered map so that iteration, and therefore output, is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderParams {
    values: BTreeMap<String, String>,
}

impl RenderParams {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard parameters for a generated service.
    #[must_use]
    pub fn for_service(
        id: impl Into<String>,
        name: impl Into<String>,
        description: &str,
        requirements: &[String],
    ) -> Self {
        Self::new()
            .with(SERVICE_ID, id)
            .with(SERVICE_NAME, name)
            .with_text(DESCRIPTION, description)
            .with_text(REQUIREMENTS, &requirements.join(", "))
    }

    /// Set a raw value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Set a free-text value, escaped for use inside a quoted string literal.
    #[must_use]
    pub fn with_text(self, key: impl Into<String>, value: &str) -> Self {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace(['\n', '\r'], " ");
        self.with(key, escaped)
    }

    /// Set a value only if the key is not already present.
    #[must_use]
    pub fn with_default(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values
            .entry(key.to_owned())
            .or_insert_with(|| value.into());
        self
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over all key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_values_are_escaped() {
        let params = RenderParams::new().with_text(DESCRIPTION, "say \"hi\"\nnow");
        assert_eq!(params.get(DESCRIPTION), Some("say \\\"hi\\\" now"));
    }

    #[test]
    fn defaults_do_not_override() {
        let params = RenderParams::new()
            .with(PORT, "9000")
            .with_default(PORT, "8000")
            .with_default(CATEGORY, "api");
        assert_eq!(params.get(PORT), Some("9000"));
        assert_eq!(params.get(CATEGORY), Some("api"));
    }
}
