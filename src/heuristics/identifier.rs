use crate::model::{DetectedBox, Point};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Vertical deviation from the reference position for positional scoring.
pub const VERTICAL_WINDOW: f64 = 30.0;
const MARKER_BONUS: f64 = 2.0;

static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{4,}").expect("valid digit-run regex"));
static ALLOWED_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}0-9\s\-/°#]+$").expect("valid identifier charset regex"));
static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:n°|no|num|ref|facture)[0-9]").expect("valid invoice marker regex")
});

/// Four or more consecutive digits, and only letters, digits, whitespace and `- / ° #`.
pub fn is_valid_identifier(text: &str) -> bool {
    DIGIT_RUN.is_match(text) && ALLOWED_CHARS.is_match(text)
}

/// Digit count + longest digit run + marker bonus.
pub fn identifier_score(text: &str) -> f64 {
    let digits = text.chars().filter(char::is_ascii_digit).count();
    let longest_run = text
        .split(|c: char| !c.is_ascii_digit())
        .map(str::len)
        .max()
        .unwrap_or(0);
    let bonus = if MARKER.is_match(text) { MARKER_BONUS } else { 0.0 };
    (digits + longest_run) as f64 + bonus
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierMatch {
    pub box_index: usize,
    pub text: String,
    pub score: f64,
    pub confidence: f64,
    /// Chosen inside the vertical window of a reference position.
    pub positional: bool,
}

/// Best invoice-number candidate among `candidates`.
///
/// With a reference position, candidates within [`VERTICAL_WINDOW`] of it are
/// scored with a `1 / (1 + |dx| + |dy|)` factor; if none qualifies (or there is
/// no reference) the plain score is maximised over all valid candidates.
/// There is no acceptance threshold.
pub fn find_identifier<'a>(
    candidates: impl IntoIterator<Item = (usize, &'a DetectedBox)>,
    reference: Option<Point>,
) -> Option<IdentifierMatch> {
    let valid: Vec<(usize, &DetectedBox)> = candidates
        .into_iter()
        .filter(|(_, b)| is_valid_identifier(&b.text))
        .collect();

    if let Some(r) = reference {
        let windowed = valid.iter().filter_map(|&(index, b)| {
            let dy = (b.center_y() - r.y).abs();
            if dy > VERTICAL_WINDOW {
                return None;
            }
            let dx = (b.center_x() - r.x).abs();
            Some((index, b, identifier_score(&b.text) / (1.0 + dx + dy)))
        });
        if let Some(found) = pick_best(windowed, true) {
            return Some(found);
        }
    }

    pick_best(
        valid
            .iter()
            .map(|&(index, b)| (index, b, identifier_score(&b.text))),
        false,
    )
}

fn pick_best<'a>(
    scored: impl Iterator<Item = (usize, &'a DetectedBox, f64)>,
    positional: bool,
) -> Option<IdentifierMatch> {
    let mut best: Option<(usize, &DetectedBox, f64)> = None;
    for item in scored {
        if best.is_none_or(|(_, _, s)| item.2 > s) {
            best = Some(item);
        }
    }
    best.map(|(box_index, b, score)| IdentifierMatch {
        box_index,
        text: b.text.clone(),
        score,
        confidence: b.confidence,
        positional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bounds;

    fn boxed(text: &str, cx: f64, cy: f64) -> DetectedBox {
        DetectedBox::new(text, 0.8, Bounds::new(cx - 20.0, cy - 5.0, 40.0, 10.0)).unwrap()
    }

    #[test]
    fn validity() {
        assert!(is_valid_identifier("FA-2024-001"));
        assert!(is_valid_identifier("N°12345"));
        assert!(is_valid_identifier("#0042 17"));
        assert!(!is_valid_identifier("ABC"));
        assert!(!is_valid_identifier("12-34"));
        assert!(!is_valid_identifier("Total: 12345"));
    }

    #[test]
    fn scoring() {
        // 7 digits, longest run 4, no marker
        assert_eq!(identifier_score("FA-2024-001"), 11.0);
        // 5 digits, run 5, marker "n°" directly before a digit
        assert_eq!(identifier_score("N°12345"), 12.0);
        assert_eq!(identifier_score("Facture 12345"), 10.0);
        assert_eq!(identifier_score("facture12345"), 12.0);
    }

    #[test]
    fn reference_window_prefers_nearby_candidate() {
        let boxes = vec![
            boxed("20240001999", 500.0, 800.0),
            boxed("FA-2024-001", 105.0, 52.0),
        ];
        let found = find_identifier(
            boxes.iter().enumerate(),
            Some(Point { x: 100.0, y: 50.0 }),
        )
        .unwrap();
        assert_eq!(found.text, "FA-2024-001");
        assert!(found.positional);
        assert!((found.score - 11.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_global_search() {
        let boxes = vec![
            boxed("FA-2024-001", 105.0, 300.0),
            boxed("20240001999", 500.0, 800.0),
            boxed("Facture", 100.0, 50.0),
        ];
        let found = find_identifier(
            boxes.iter().enumerate(),
            Some(Point { x: 100.0, y: 50.0 }),
        )
        .unwrap();
        assert_eq!(found.box_index, 1);
        assert!(!found.positional);
        assert_eq!(found.score, 22.0);
    }

    #[test]
    fn nothing_valid() {
        let boxes = vec![boxed("Facture", 0.0, 0.0), boxed("12", 0.0, 0.0)];
        assert!(find_identifier(boxes.iter().enumerate(), None).is_none());
    }
}
