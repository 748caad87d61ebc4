//! Intent classification for Foundry.
//!
//! Turns a free-text request ("optimise my postgres queries") into a
//! [`ClassifiedIntent`]: a closed [`Category`], a confidence score, an
//! ordered requirement list, independent [`FeatureFlags`] and a suggested
//! service name.
//!
//! Classification is a pure function of its input. It never fails: text
//! that matches no category is classified as [`Category::Generic`] with a
//! fixed low confidence.
//!
//! ```
//! use foundry_intent::{Category, IntentClassifier};
//!
//! let intent = IntentClassifier::new().classify("optimize my postgres queries for slow joins");
//! assert_eq!(intent.category, Category::Database);
//! assert!(intent.confidence >= 0.7);
//! ```

#![forbid(unsafe_code)]

pub mod category;
pub mod classifier;
mod vocabulary;

pub use category::{Category, Feature, FeatureFlags, UnknownCategory};
pub use classifier::{ClassifiedIntent, IntentClassifier};
