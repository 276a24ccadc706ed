use crate::model::{Bounds, DetectedBox};

const CENTER_WEIGHT: f64 = 0.7;
const AREA_WEIGHT: f64 = 100.0;
const CONFIDENCE_WEIGHT: f64 = 100.0;

/// Whether OCR confidence takes part in the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scoring {
    /// Center distance and area ratio only (single-template mode).
    Geometric,
    /// Geometric score plus `(1 - confidence) * 100` (multi-template and preview modes).
    ConfidenceWeighted,
}

/// Score of detected box `candidate` against `reference`; smaller is better.
///
/// Both boxes must be non-degenerate, callers filter them out beforehand.
pub fn distance(reference: &Bounds, candidate: &DetectedBox, scoring: Scoring) -> f64 {
    let geometric = geometric_distance(reference, &candidate.bounds);
    match scoring {
        Scoring::Geometric => geometric,
        Scoring::ConfidenceWeighted => {
            geometric + (1.0 - candidate.confidence) * CONFIDENCE_WEIGHT
        }
    }
}

pub fn geometric_distance(reference: &Bounds, candidate: &Bounds) -> f64 {
    let rc = reference.center();
    let dc = candidate.center();
    let center_distance = ((rc.x - dc.x).powi(2) + (rc.y - dc.y).powi(2)).sqrt();

    let (ra, da) = (reference.area(), candidate.area());
    let area_ratio = ra.max(da) / ra.min(da);

    CENTER_WEIGHT * center_distance + AREA_WEIGHT * (area_ratio - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected(text: &str, confidence: f64, bounds: Bounds) -> DetectedBox {
        DetectedBox::new(text, confidence, bounds).unwrap()
    }

    #[test]
    fn identical_boxes_score_zero() {
        let r = Bounds::new(10.0, 10.0, 40.0, 10.0);
        let d = detected("x", 1.0, r);
        assert_eq!(distance(&r, &d, Scoring::Geometric), 0.0);
        assert_eq!(distance(&r, &d, Scoring::ConfidenceWeighted), 0.0);
    }

    #[test]
    fn center_offset_and_area_ratio() {
        let r = Bounds::new(0.0, 0.0, 10.0, 10.0);
        // same size, centers 30/40 apart -> 50 euclidean
        let shifted = Bounds::new(30.0, 40.0, 10.0, 10.0);
        assert!((geometric_distance(&r, &shifted) - 35.0).abs() < 1e-9);

        // concentric, double area -> ratio 2
        let wide = Bounds::new(-5.0, 0.0, 20.0, 10.0);
        assert!((geometric_distance(&r, &wide) - 100.0).abs() < 1e-9);
        assert!((geometric_distance(&wide, &r) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn low_confidence_is_penalised() {
        let r = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let d = detected("x", 0.25, r);
        assert_eq!(distance(&r, &d, Scoring::Geometric), 0.0);
        assert!((distance(&r, &d, Scoring::ConfidenceWeighted) - 75.0).abs() < 1e-9);
    }
}
