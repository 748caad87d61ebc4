//! Closed sets of service categories and optional features.

use std::fmt;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// The kind of service a request asks for.
///
/// Declaration order doubles as the tie-break priority when two categories
/// score the same number of keyword hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Query analysis and database tuning.
    Database,
    /// HTTP endpoint monitoring.
    Api,
    /// Log parsing and analysis.
    Logs,
    /// Vulnerability and secret scanning.
    Security,
    /// Profiling and bottleneck detection.
    Performance,
    /// Fallback when nothing more specific matches.
    Generic,
}

impl Category {
    /// Every category, in priority order.
    pub const ALL: [Self; 6] = [
        Self::Database,
        Self::Api,
        Self::Logs,
        Self::Security,
        Self::Performance,
        Self::Generic,
    ];

    /// Get the category name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Api => "api",
            Self::Logs => "logs",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Generic => "generic",
        }
    }

    /// Human-readable name used when synthesising service names.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Database => "Database",
            Self::Api => "Api",
            Self::Logs => "Logs",
            Self::Security => "Security",
            Self::Performance => "Performance",
            Self::Generic => "Generic",
        }
    }

    /// Identifier of the template that renders this category.
    #[must_use]
    pub const fn template_name(&self) -> &'static str {
        match self {
            Self::Database => "database_analyzer",
            Self::Api => "api_monitor",
            Self::Logs => "log_analyzer",
            Self::Security => "security_scanner",
            Self::Performance => "performance_profiler",
            Self::Generic => "generic_agent",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category name that is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s || category.template_name() == s)
            .ok_or_else(|| UnknownCategory(s.to_owned()))
    }
}

/// An optional capability layered on top of a category template.
///
/// Declaration order is the canonical order in which feature snippets are
/// appended to generated sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Charts and dashboards.
    Visualization,
    /// Threshold alerts and notifications.
    Alerting,
    /// Summary reports.
    Reporting,
    /// Streaming updates.
    RealTime,
    /// Model-based predictions.
    MachineLearning,
    /// Result caching.
    Caching,
}

impl Feature {
    /// Every feature, in canonical order.
    pub const ALL: [Self; 6] = [
        Self::Visualization,
        Self::Alerting,
        Self::Reporting,
        Self::RealTime,
        Self::MachineLearning,
        Self::Caching,
    ];

    /// Get the feature name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Visualization => "visualization",
            Self::Alerting => "alerting",
            Self::Reporting => "reporting",
            Self::RealTime => "real_time",
            Self::MachineLearning => "machine_learning",
            Self::Caching => "caching",
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::Visualization => 1,
            Self::Alerting => 1 << 1,
            Self::Reporting => 1 << 2,
            Self::RealTime => 1 << 3,
            Self::MachineLearning => 1 << 4,
            Self::Caching => 1 << 5,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent on/off switches, one per [`Feature`].
///
/// Iteration always follows the canonical [`Feature::ALL`] order, no matter
/// in which order flags were set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureFlags(u8);

impl FeatureFlags {
    /// No features enabled.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Enable a feature.
    #[must_use]
    pub const fn with(self, feature: Feature) -> Self {
        Self(self.0 | feature.bit())
    }

    /// Enable or disable a feature in place.
    pub fn set(&mut self, feature: Feature, enabled: bool) {
        if enabled {
            self.0 |= feature.bit();
        } else {
            self.0 &= !feature.bit();
        }
    }

    /// Whether `feature` is enabled.
    #[must_use]
    pub const fn is_enabled(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// Whether no feature is enabled.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Enabled features in canonical order.
    pub fn enabled(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.into_iter().filter(|f| self.is_enabled(*f))
    }
}

impl FromIterator<Feature> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

impl Serialize for FeatureFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Feature::ALL.len()))?;
        for feature in Feature::ALL {
            map.serialize_entry(feature.as_str(), &self.is_enabled(feature))?;
        }
        map.end()
    }
}
