// src/heuristics/mod.rs

//! Template-free readings: labelled amounts and invoice-number scoring.

pub mod amounts;
pub mod identifier;
pub mod numbers;

pub use amounts::{AmountKind, AmountSummary, KeywordOutcome, derive_tax_rate, derive_ttc};
pub use identifier::{IdentifierMatch, find_identifier};
pub use numbers::parse_amount;

use crate::model::DetectedBox;
use serde::{Deserialize, Serialize};

/// Everything the heuristics can say about a document without a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub amounts: KeywordOutcome,
    pub identifier: Option<IdentifierMatch>,
}

/// Runs the keyword-proximity extractor and a global identifier search.
pub fn preview(boxes: &[DetectedBox]) -> Preview {
    Preview {
        amounts: amounts::extract_amounts(boxes),
        identifier: find_identifier(boxes.iter().enumerate(), None),
    }
}
