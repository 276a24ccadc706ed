// src/matching/mod.rs

//! Geometric field matching: scores detected boxes against template
//! reference boxes and assigns each box to at most one field per call.

pub mod distance;
pub mod multi;
pub mod optimal;
pub mod single;

pub use distance::{Scoring, distance};
pub use multi::{ResolverOutcome, resolve_across_templates};
pub use single::match_template;

use crate::model::{Bounds, DetectedBox, MatchAssignment, TemplateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A match is only accepted strictly below this distance.
pub const ACCEPT_THRESHOLD: f64 = 200.0;

/// How fields are paired with boxes inside one template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    /// Fields in ascending name order each take their best remaining box.
    /// When two fields share a best box, the smaller field name wins it.
    #[default]
    Greedy,
    /// Minimum total distance over all fields (Hungarian method).
    Optimal,
}

/// What happened to one field during matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldOutcome {
    Matched(MatchAssignment),
    /// No unclaimed, non-degenerate box was left to compare against.
    NoCandidate,
    /// The best remaining box did not get below [`ACCEPT_THRESHOLD`].
    BelowThresholdRejected { best_distance: f64 },
    /// The reference box itself has no area.
    InvalidGeometry,
}

impl FieldOutcome {
    pub fn assignment(&self) -> Option<&MatchAssignment> {
        match self {
            FieldOutcome::Matched(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Claimed,
    Excluded,
}

/// Boxes of one extraction call and which of them are already taken.
///
/// Created per call and threaded through every matching step of that call;
/// degenerate boxes are excluded up front so the distance metric never sees them.
#[derive(Debug)]
pub struct CandidatePool<'a> {
    boxes: &'a [DetectedBox],
    slots: Vec<Slot>,
}

impl<'a> CandidatePool<'a> {
    pub fn new(boxes: &'a [DetectedBox]) -> Self {
        let slots = boxes
            .iter()
            .map(|b| {
                if b.bounds.is_degenerate() {
                    Slot::Excluded
                } else {
                    Slot::Free
                }
            })
            .collect();
        Self { boxes, slots }
    }

    pub fn boxes(&self) -> &'a [DetectedBox] {
        self.boxes
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.slots.get(index) == Some(&Slot::Free)
    }

    /// Unclaimed, non-degenerate boxes with their index, in detection order.
    pub fn available(&self) -> impl Iterator<Item = (usize, &'a DetectedBox)> + '_ {
        let boxes = self.boxes;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == Slot::Free)
            .map(move |(i, _)| (i, &boxes[i]))
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| **s == Slot::Free).count()
    }

    /// Marks a box as used. Returns `false` if it was not available.
    pub fn claim(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ Slot::Free) => {
                *slot = Slot::Claimed;
                true
            }
            _ => false,
        }
    }
}

/// Lowest-distance available box for `reference`. Ties keep the earlier box.
pub(crate) fn best_available(
    reference: &Bounds,
    pool: &CandidatePool<'_>,
    scoring: Scoring,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in pool.available() {
        let d = distance(reference, candidate, scoring);
        if best.is_none_or(|(_, current)| d < current) {
            best = Some((index, d));
        }
    }
    best
}

/// Per-field outcomes of one matching pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub outcomes: BTreeMap<String, FieldOutcome>,
}

impl MatchReport {
    pub fn record(&mut self, field_name: &str, outcome: FieldOutcome) {
        self.outcomes.insert(field_name.to_string(), outcome);
    }

    pub fn assignments(&self) -> impl Iterator<Item = &MatchAssignment> {
        self.outcomes.values().filter_map(FieldOutcome::assignment)
    }

    pub fn matched_count(&self) -> usize {
        self.assignments().count()
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.assignments()
            .map(|a| (a.field_name.clone(), a.matched_text.clone()))
            .collect()
    }

    pub fn confidences(&self) -> BTreeMap<String, f64> {
        self.assignments()
            .map(|a| (a.field_name.clone(), a.confidence))
            .collect()
    }

    pub fn sources(&self) -> BTreeMap<String, Option<TemplateId>> {
        self.assignments()
            .map(|a| (a.field_name.clone(), a.source_template_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_excludes_degenerate_and_claims_once() {
        let boxes = vec![
            DetectedBox::new("a", 1.0, Bounds::new(0.0, 0.0, 10.0, 10.0)).unwrap(),
            DetectedBox::new("b", 1.0, Bounds::new(0.0, 0.0, 0.0, 10.0)).unwrap(),
            DetectedBox::new("c", 1.0, Bounds::new(5.0, 5.0, 10.0, 10.0)).unwrap(),
        ];
        let mut pool = CandidatePool::new(&boxes);
        assert_eq!(pool.available_count(), 2);
        assert!(!pool.is_available(1));
        assert!(!pool.claim(1));
        assert!(pool.claim(2));
        assert!(!pool.claim(2));
        assert_eq!(pool.available().map(|(i, _)| i).collect::<Vec<_>>(), vec![0]);
        assert!(!pool.is_available(2));
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn best_available_prefers_first_on_tie() {
        let b = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let boxes = vec![
            DetectedBox::new("first", 1.0, b).unwrap(),
            DetectedBox::new("second", 1.0, b).unwrap(),
        ];
        let pool = CandidatePool::new(&boxes);
        assert_eq!(best_available(&b, &pool, Scoring::Geometric), Some((0, 0.0)));
    }
}
