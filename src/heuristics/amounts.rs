use super::numbers::{parse_amount, round_cents};
use crate::model::DetectedBox;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

/// Boxes after a label (in detection order) that may hold its value.
const LOOKAHEAD: usize = 10;
/// Maximum vertical center deviation for a value to count as on the label's row.
const ROW_TOLERANCE: f64 = 20.0;

static HT_LABELS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(?:total|montant)\s*h\.?\s?t\.?(?:\s|:|$)",
        r"(?i)^h\.?\s?t\.?(?:\s|:|$)",
        r"(?i)^(?:total\s+)?hors[\s-]+taxes?",
        r"(?i)^sous[\s-]?total",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid HT label regex"))
    .collect()
});

static TVA_LABELS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(?:total\s+|montant\s+)?t\.?\s?v\.?\s?a\.?(?:\s|:|\d|\(|$)",
        r"(?i)^taxe\s+sur\s+la\s+valeur\s+ajout[ée]e",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid TVA label regex"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountKind {
    Ht,
    Tva,
}

impl AmountKind {
    fn patterns(self) -> &'static [Regex] {
        match self {
            AmountKind::Ht => HT_LABELS.as_slice(),
            AmountKind::Tva => TVA_LABELS.as_slice(),
        }
    }
}

/// Which label family, if any, a box text belongs to.
pub fn classify_label(text: &str) -> Option<AmountKind> {
    let text = text.trim();
    [AmountKind::Ht, AmountKind::Tva]
        .into_iter()
        .find(|kind| kind.patterns().iter().any(|re| re.is_match(text)))
}

/// A label box paired with the numeric box to its right on the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledAmount {
    pub kind: AmountKind,
    pub value: f64,
    pub label_index: usize,
    pub value_index: usize,
    pub horizontal_distance: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountSummary {
    pub ht: LabelledAmount,
    pub tva: LabelledAmount,
    pub ttc: f64,
    pub tax_rate: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeywordOutcome {
    Found(AmountSummary),
    /// The listed label kinds produced no numeric match anywhere in the document.
    NotFound { missing: Vec<AmountKind> },
}

/// Nearest same-row value over every label of `kind`; the label with the
/// smallest label-to-value horizontal distance wins.
pub fn find_labelled_amount(boxes: &[DetectedBox], kind: AmountKind) -> Option<LabelledAmount> {
    let mut best: Option<LabelledAmount> = None;
    for (label_index, label) in boxes.iter().enumerate() {
        if classify_label(&label.text) != Some(kind) {
            continue;
        }
        let Some(found) = nearest_value(boxes, label_index, kind) else {
            debug!(label = %label.text, "Label has no numeric neighbour on its row");
            continue;
        };
        if best
            .as_ref()
            .is_none_or(|b| found.horizontal_distance < b.horizontal_distance)
        {
            best = Some(found);
        }
    }
    best
}

fn nearest_value(boxes: &[DetectedBox], label_index: usize, kind: AmountKind) -> Option<LabelledAmount> {
    let label = &boxes[label_index];
    let (lx, ly) = (label.center_x(), label.center_y());
    let end = (label_index + 1 + LOOKAHEAD).min(boxes.len());

    let mut best: Option<LabelledAmount> = None;
    for (value_index, candidate) in boxes.iter().enumerate().take(end).skip(label_index + 1) {
        if (candidate.center_y() - ly).abs() >= ROW_TOLERANCE {
            continue;
        }
        let dx = candidate.center_x() - lx;
        if dx <= 0.0 {
            continue;
        }
        let Some(value) = parse_amount(&candidate.text) else {
            continue;
        };
        if best.as_ref().is_none_or(|b| dx < b.horizontal_distance) {
            best = Some(LabelledAmount {
                kind,
                value,
                label_index,
                value_index,
                horizontal_distance: dx,
                confidence: candidate.confidence,
            });
        }
    }
    best
}

/// Template-free HT/TVA lookup with derived TTC and tax rate.
pub fn extract_amounts(boxes: &[DetectedBox]) -> KeywordOutcome {
    let ht = find_labelled_amount(boxes, AmountKind::Ht);
    let tva = find_labelled_amount(boxes, AmountKind::Tva);
    match (ht, tva) {
        (Some(ht), Some(tva)) => KeywordOutcome::Found(AmountSummary {
            ttc: derive_ttc(ht.value, tva.value),
            tax_rate: derive_tax_rate(ht.value, tva.value),
            ht,
            tva,
        }),
        (ht, tva) => {
            let mut missing = Vec::new();
            if ht.is_none() {
                missing.push(AmountKind::Ht);
            }
            if tva.is_none() {
                missing.push(AmountKind::Tva);
            }
            KeywordOutcome::NotFound { missing }
        }
    }
}

pub fn derive_ttc(ht: f64, tva: f64) -> f64 {
    round_cents(ht + tva)
}

/// Tax rate in whole percent. A fractional part strictly above one half
/// rounds up, anything else (including exactly .5) rounds down.
pub fn derive_tax_rate(ht: f64, tva: f64) -> i64 {
    if ht == 0.0 {
        return 0;
    }
    let raw = tva * 100.0 / ht;
    if !raw.is_finite() {
        return 0;
    }
    let floor = raw.floor();
    if raw - floor > 0.5 {
        raw.ceil() as i64
    } else {
        floor as i64
    }
}
