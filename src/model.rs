// src/model.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Primary key of a stored template.
pub type TemplateId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Axis-aligned rectangle in document-pixel units at the OCR rendering scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width * 0.5,
            y: self.top + self.height * 0.5,
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Zero or negative area, or any non-finite coordinate.
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.left, self.top, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width <= 0.0 || self.height <= 0.0
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            left: self.left * factor,
            top: self.top * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }
}

/// A text region found by OCR on the current document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    pub text: String,
    pub confidence: f64,
    pub bounds: Bounds,
}

impl DetectedBox {
    /// Returns `None` when the trimmed text is empty.
    pub fn new(text: &str, confidence: f64, bounds: Bounds) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            bounds,
        })
    }

    pub fn center_x(&self) -> f64 {
        self.bounds.center().x
    }

    pub fn center_y(&self) -> f64 {
        self.bounds.center().y
    }
}

/// Stored expected bounding box for one field of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReference {
    pub field_name: String,
    pub bounds: Bounds,
    #[serde(default, alias = "manual")]
    pub is_manual: bool,
}

/// Snapshot of a stored template: field name -> reference box.
///
/// Fields live in a `BTreeMap`, so every iteration (and therefore greedy
/// assignment order) is ascending by field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    /// Rendering scale the reference boxes were authored at.
    pub render_scale: f64,
    pub fields: BTreeMap<String, FieldReference>,
}

impl Template {
    pub fn new(id: TemplateId, name: &str, render_scale: f64, fields: Vec<FieldReference>) -> Self {
        Self {
            id,
            name: name.to_string(),
            render_scale,
            fields: fields
                .into_iter()
                .map(|f| (f.field_name.clone(), f))
                .collect(),
        }
    }

    /// Fields resolved by box matching.
    pub fn auto_fields(&self) -> impl Iterator<Item = &FieldReference> {
        self.fields.values().filter(|f| !f.is_manual)
    }

    /// Fields read by direct re-OCR of their region.
    pub fn manual_fields(&self) -> impl Iterator<Item = &FieldReference> {
        self.fields.values().filter(|f| f.is_manual)
    }

    /// Copy of this template with reference boxes expressed at `target_scale`.
    pub fn rescaled_to(&self, target_scale: f64) -> Template {
        let valid = self.render_scale.is_finite()
            && self.render_scale > 0.0
            && target_scale.is_finite()
            && target_scale > 0.0;
        let factor = target_scale / self.render_scale;
        if !valid || (factor - 1.0).abs() < 1e-9 {
            return self.clone();
        }
        let mut scaled = self.clone();
        scaled.render_scale = target_scale;
        for field in scaled.fields.values_mut() {
            field.bounds = field.bounds.scaled(factor);
        }
        scaled
    }
}

/// An accepted field -> detected box pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAssignment {
    pub field_name: String,
    pub matched_text: String,
    pub confidence: f64,
    pub distance: f64,
    pub source_template_id: Option<TemplateId>,
    /// Index of the matched box in the document's detection list.
    pub box_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_not_a_box() {
        assert!(DetectedBox::new("   ", 0.9, Bounds::new(0.0, 0.0, 10.0, 10.0)).is_none());
        let b = DetectedBox::new("  42 ", 1.7, Bounds::new(0.0, 0.0, 10.0, 4.0)).unwrap();
        assert_eq!(b.text, "42");
        assert_eq!(b.confidence, 1.0);
        assert_eq!(b.center_x(), 5.0);
        assert_eq!(b.center_y(), 2.0);
    }

    #[test]
    fn degenerate_bounds() {
        assert!(Bounds::new(0.0, 0.0, 0.0, 10.0).is_degenerate());
        assert!(Bounds::new(0.0, 0.0, 5.0, -1.0).is_degenerate());
        assert!(Bounds::new(f64::NAN, 0.0, 5.0, 5.0).is_degenerate());
        assert!(!Bounds::new(0.0, 0.0, 5.0, 5.0).is_degenerate());
    }

    #[test]
    fn rescale_multiplies_reference_boxes() {
        let template = Template::new(
            1,
            "acme",
            1.0,
            vec![FieldReference {
                field_name: "montantHT".to_string(),
                bounds: Bounds::new(100.0, 200.0, 80.0, 20.0),
                is_manual: false,
            }],
        );
        let scaled = template.rescaled_to(2.0);
        assert_eq!(scaled.render_scale, 2.0);
        assert_eq!(
            scaled.fields["montantHT"].bounds,
            Bounds::new(200.0, 400.0, 160.0, 40.0)
        );
        assert_eq!(template.rescaled_to(1.0), template);
    }
}
