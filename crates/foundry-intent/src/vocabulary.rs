//! Keyword tables driving classification.
//!
//! These are data, not logic: changing a table changes which requests land
//! in which category, never how scoring works.

use crate::category::{Category, Feature};

/// Keywords counted towards a category's score.
pub(crate) const fn category_keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::Database => &[
            "database",
            "query",
            "sql",
            "mongodb",
            "postgres",
            "mysql",
            "elasticsearch",
            "redis",
            "cassandra",
            "schema",
            "table",
            "index",
            "optimize",
        ],
        Category::Api => &[
            "api",
            "http",
            "endpoint",
            "rest",
            "graphql",
            "response",
            "request",
            "status",
            "latency",
            "performance",
            "monitoring",
            "health",
        ],
        Category::Logs => &[
            "logs",
            "logging",
            "error",
            "trace",
            "debug",
            "event",
            "monitoring",
            "tracking",
            "audit",
            "syslog",
            "application log",
        ],
        Category::Security => &[
            "security",
            "vulnerability",
            "exploit",
            "auth",
            "password",
            "encryption",
            "ssl",
            "tls",
            "attack",
            "threat",
            "malware",
            "intrusion",
        ],
        Category::Performance => &[
            "performance",
            "speed",
            "optimize",
            "bottleneck",
            "profile",
            "benchmark",
            "latency",
            "throughput",
            "memory",
            "cpu",
            "cache",
            "efficiency",
        ],
        Category::Generic => &[],
    }
}

/// Phrase to requirement-label table for a category.
pub(crate) const fn requirement_phrases(category: Category) -> &'static [(&'static str, &'static str)] {
    match category {
        Category::Database => &[
            ("optimiz", "query optimization"),
            ("analyze performance", "performance analysis"),
            ("slow", "slow query detection"),
            ("join", "join analysis"),
            ("index", "index optimization"),
            ("statistic", "query statistics"),
            ("explain plan", "execution analysis"),
        ],
        Category::Api => &[
            ("response time", "response time monitoring"),
            ("error rate", "error rate tracking"),
            ("endpoint health", "endpoint health monitoring"),
            ("slow endpoint", "slow endpoint detection"),
            ("status code", "status code analysis"),
            ("latency", "latency monitoring"),
        ],
        Category::Logs => &[
            ("error", "error detection"),
            ("anomal", "anomaly detection"),
            ("pattern", "pattern matching"),
            ("filter", "log filtering"),
            ("aggregat", "log aggregation"),
            ("correlat", "log correlation"),
        ],
        Category::Security => &[
            ("vulnerab", "vulnerability scanning"),
            ("secret", "secret detection"),
            ("hardcoded", "hardcoded credential detection"),
            ("authentication", "authentication check"),
            ("encryption", "encryption verification"),
            ("ssl", "ssl/tls verification"),
            ("tls", "ssl/tls verification"),
        ],
        Category::Performance => &[
            ("bottleneck", "bottleneck detection"),
            ("memory", "memory profiling"),
            ("cpu", "cpu profiling"),
            ("optimiz", "performance optimization"),
            ("benchmark", "benchmarking"),
            ("profil", "profiling"),
        ],
        Category::Generic => &[],
    }
}

/// Requirement used when no phrase matches.
pub(crate) const DEFAULT_REQUIREMENT: &str = "basic analysis";

/// Keywords that switch a feature on, independent of category.
pub(crate) const fn feature_keywords(feature: Feature) -> &'static [&'static str] {
    match feature {
        Feature::Visualization => &["chart", "graph", "dashboard", "visual", "plot"],
        Feature::Alerting => &["alert", "notification", "notify", "warning", "email", "slack"],
        Feature::Reporting => &["report", "summary", "summarize", "insights"],
        Feature::RealTime => &["real-time", "realtime", "real time", "live", "streaming", "instant"],
        Feature::MachineLearning => &["machine learning", "prediction", "predict", "forecast", " ml "],
        Feature::Caching => &["cache", "caching", "memcached"],
    }
}

/// Technologies recognised in free text, in reporting order.
pub(crate) const TECHNOLOGIES: &[&str] = &[
    "python",
    "javascript",
    "java",
    "go",
    "rust",
    "postgresql",
    "postgres",
    "mongodb",
    "mysql",
    "elasticsearch",
    "kafka",
    "redis",
    "rabbitmq",
    "docker",
    "kubernetes",
    "aws",
    "gcp",
    "azure",
];

/// Technology reported when none is mentioned.
pub(crate) const DEFAULT_TECHNOLOGY: &str = "python";

/// Words never used when synthesising a name.
pub(crate) const STOPWORDS: &[&str] = &[
    "i", "a", "an", "the", "for", "and", "or", "in", "on", "at", "my", "me", "to", "of", "with",
    "that", "this", "want", "need", "please", "some", "from", "into", "our", "your", "can", "should",
];

/// Token appended to every synthesised name.
pub(crate) const NAME_SUFFIX: &str = "Service";
