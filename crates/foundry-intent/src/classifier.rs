//! Keyword-scoring classifier.

use serde::Serialize;

use crate::category::{Category, Feature, FeatureFlags};
use crate::vocabulary;

/// Confidence assigned to a matched category with zero extra hits.
pub const BASE_CONFIDENCE: f64 = 0.70;
/// Confidence added per distinct keyword hit.
pub const CONFIDENCE_INCREMENT: f64 = 0.05;
/// Upper bound for matched-category confidence.
pub const MAX_CONFIDENCE: f64 = 0.95;
/// Fixed confidence for the generic fallback.
pub const GENERIC_CONFIDENCE: f64 = 0.60;

/// The outcome of classifying one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedIntent {
    /// Chosen category.
    pub category: Category,
    /// Confidence in the category, between 0 and 1.
    pub confidence: f64,
    /// Requirement labels in first-seen order, without duplicates.
    pub requirements: Vec<String>,
    /// Independently detected features.
    pub features: FeatureFlags,
    /// Technologies mentioned in the request.
    pub technologies: Vec<String>,
    /// Suggested human-readable service name.
    pub name: String,
    /// The original request text.
    pub description: String,
}

impl ClassifiedIntent {
    /// Identifier of the template that should render this intent.
    #[must_use]
    pub const fn template_name(&self) -> &'static str {
        self.category.template_name()
    }
}

/// Classifies free text into a [`ClassifiedIntent`].
///
/// Stateless; construct once and share freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    /// Create a classifier using the built-in vocabulary.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classify `text`. Total: every input yields a result.
    #[must_use]
    pub fn classify(&self, text: &str) -> ClassifiedIntent {
        let lower = text.to_lowercase();
        let tokens = tokenize(&lower);

        let (category, hits) = detect_category(&lower);
        let confidence = match category {
            Category::Generic => GENERIC_CONFIDENCE,
            _ => confidence_for(hits),
        };

        ClassifiedIntent {
            category,
            confidence,
            requirements: extract_requirements(&lower, category),
            features: detect_features(&lower),
            technologies: extract_technologies(&tokens),
            name: synthesise_name(&tokens, category),
            description: text.to_owned(),
        }
    }
}

/// Distinct keywords from `category` that occur in `text`.
fn score(text: &str, category: Category) -> usize {
    vocabulary::category_keywords(category)
        .iter()
        .filter(|keyword| text.contains(*keyword))
        .count()
}

fn detect_category(text: &str) -> (Category, usize) {
    let mut best = (Category::Generic, 0);
    for category in Category::ALL {
        let hits = score(text, category);
        // Strictly greater: earlier categories win ties.
        if hits > best.1 {
            best = (category, hits);
        }
    }
    best
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn confidence_for(hits: usize) -> f64 {
    (BASE_CONFIDENCE + hits as f64 * CONFIDENCE_INCREMENT).clamp(BASE_CONFIDENCE, MAX_CONFIDENCE)
}

fn extract_requirements(text: &str, category: Category) -> Vec<String> {
    let mut requirements: Vec<String> = Vec::new();
    for (phrase, label) in vocabulary::requirement_phrases(category) {
        if text.contains(phrase) && !requirements.iter().any(|r| r == label) {
            requirements.push((*label).to_owned());
        }
    }

    if requirements.is_empty() {
        requirements.push(vocabulary::DEFAULT_REQUIREMENT.to_owned());
    }
    requirements
}

fn detect_features(text: &str) -> FeatureFlags {
    // Padding lets short keywords such as " ml " match at the edges.
    let padded = format!(" {text} ");
    Feature::ALL
        .into_iter()
        .filter(|feature| {
            vocabulary::feature_keywords(*feature)
                .iter()
                .any(|keyword| padded.contains(keyword))
        })
        .collect()
}

fn extract_technologies(tokens: &[&str]) -> Vec<String> {
    let found: Vec<String> = vocabulary::TECHNOLOGIES
        .iter()
        .filter(|tech| tokens.contains(tech))
        .map(|tech| (*tech).to_owned())
        .collect();

    if found.is_empty() {
        vec![vocabulary::DEFAULT_TECHNOLOGY.to_owned()]
    } else {
        found
    }
}

/// Split on anything that is not a word character.
fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .collect()
}

fn synthesise_name(tokens: &[&str], category: Category) -> String {
    let words: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|token| token.chars().count() > 2 && !vocabulary::STOPWORDS.contains(token))
        .take(3)
        .collect();

    let mut name = if words.len() >= 2 {
        words
            .iter()
            .map(|word| title_case(word))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        format!("{} Analyzer", category.display_name())
    };

    if !name
        .to_lowercase()
        .contains(&vocabulary::NAME_SUFFIX.to_lowercase())
    {
        name.push(' ');
        name.push_str(vocabulary::NAME_SUFFIX);
    }
    name
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn classify(text: &str) -> ClassifiedIntent {
        IntentClassifier::new().classify(text)
    }

    #[test]
    fn postgres_optimisation_is_database() {
        let intent = classify("optimize my postgres queries for slow joins");

        assert_eq!(intent.category, Category::Database);
        assert!(intent.confidence >= 0.7);
        assert!(intent
            .requirements
            .iter()
            .any(|r| r.contains("optimization")));
        assert_eq!(intent.name, "Optimize Postgres Queries Service");
        assert_eq!(intent.technologies, vec!["postgres"]);
    }

    #[test]
    fn empty_input_is_generic() {
        let intent = classify("");

        assert_eq!(intent.category, Category::Generic);
        assert!((intent.confidence - GENERIC_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(intent.requirements, vec!["basic analysis"]);
        assert!(intent.features.is_empty());
        assert_eq!(intent.name, "Generic Analyzer Service");
        assert_eq!(intent.technologies, vec!["python"]);
    }

    #[rstest]
    #[case("scan my code for vulnerability and hardcoded password", Category::Security)]
    #[case("monitor api endpoint latency and http status", Category::Api)]
    #[case("parse application logs and trace every error event", Category::Logs)]
    #[case("find the cpu bottleneck and benchmark throughput", Category::Performance)]
    #[case("build me something nice", Category::Generic)]
    fn classifies_by_keyword_score(#[case] text: &str, #[case] expected: Category) {
        assert_eq!(classify(text).category, expected);
    }

    #[test]
    fn ties_follow_priority_order() {
        // "optimize" is a keyword for both database and performance.
        let intent = classify("optimize");
        assert_eq!(intent.category, Category::Database);
    }

    #[test]
    fn confidence_is_capped() {
        let intent = classify(
            "database query sql mongodb postgres mysql elasticsearch redis cassandra schema table index",
        );
        assert_eq!(intent.category, Category::Database);
        assert!((intent.confidence - MAX_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn requirements_are_deduplicated_in_first_seen_order() {
        let intent = classify("check ssl and tls encryption for security");
        assert_eq!(
            intent.requirements,
            vec!["encryption verification", "ssl/tls verification"]
        );
    }

    #[test]
    fn features_are_independent_of_category() {
        let intent = classify("realtime dashboard with slack alert for my postgres database");
        assert_eq!(intent.category, Category::Database);
        assert!(intent.features.is_enabled(Feature::RealTime));
        assert!(intent.features.is_enabled(Feature::Visualization));
        assert!(intent.features.is_enabled(Feature::Alerting));
        assert!(!intent.features.is_enabled(Feature::Caching));
    }

    #[test]
    fn single_token_falls_back_to_category_name() {
        let intent = classify("sql");
        assert_eq!(intent.name, "Database Analyzer Service");
    }

    #[test]
    fn suffix_is_not_duplicated() {
        let intent = classify("log ingestion service for kafka");
        assert_eq!(intent.name, "Log Ingestion Service");
    }

    proptest! {
        #[test]
        fn classify_is_total(text in ".*") {
            let intent = classify(&text);
            prop_assert!(Category::ALL.contains(&intent.category));
            prop_assert!((0.0..=1.0).contains(&intent.confidence));
            prop_assert!(!intent.requirements.is_empty());
            prop_assert!(!intent.name.is_empty());
        }
    }
}
