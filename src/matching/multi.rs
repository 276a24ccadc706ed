use super::{
    ACCEPT_THRESHOLD, CandidatePool, FieldOutcome, MatchReport, Scoring, best_available,
};
use crate::model::{MatchAssignment, Template, TemplateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolverOutcome {
    /// At least one field was matched; each assignment carries its source template.
    Resolved(MatchReport),
    NoTemplates,
    /// Templates exist but no field found a candidate under the threshold.
    NoMatches(MatchReport),
}

/// Resolves every field known to any template when no template was designated.
///
/// Each field is decided on its own: the best (template, box) pair over all
/// templates defining it wins, scored with the confidence penalty. There is no
/// document-level vote, so sibling fields may come from different templates.
/// Manual references and fields named in `exclude` are skipped.
pub fn resolve_across_templates(
    templates: &[Template],
    pool: &mut CandidatePool<'_>,
    exclude: &[&str],
) -> ResolverOutcome {
    if templates.is_empty() {
        return ResolverOutcome::NoTemplates;
    }

    let field_names: BTreeSet<&str> = templates
        .iter()
        .flat_map(|t| t.auto_fields().map(|f| f.field_name.as_str()))
        .filter(|name| !exclude.contains(name))
        .collect();

    let mut report = MatchReport::default();
    for name in field_names {
        let outcome = resolve_field(templates, name, pool);
        if let FieldOutcome::Matched(a) = &outcome {
            debug!(
                field = name,
                text = %a.matched_text,
                distance = a.distance,
                template = ?a.source_template_id,
                "Field resolved across templates"
            );
        }
        report.record(name, outcome);
    }

    if report.matched_count() == 0 {
        ResolverOutcome::NoMatches(report)
    } else {
        ResolverOutcome::Resolved(report)
    }
}

fn resolve_field(templates: &[Template], name: &str, pool: &mut CandidatePool<'_>) -> FieldOutcome {
    let references: Vec<_> = templates
        .iter()
        .filter_map(|t| t.fields.get(name).map(|f| (t.id, f)))
        .filter(|(_, f)| !f.is_manual && !f.bounds.is_degenerate())
        .collect();
    if references.is_empty() {
        return FieldOutcome::InvalidGeometry;
    }

    let mut best: Option<(TemplateId, usize, f64)> = None;
    for (template_id, reference) in &references {
        if let Some((index, d)) =
            best_available(&reference.bounds, pool, Scoring::ConfidenceWeighted)
        {
            if best.is_none_or(|(_, _, current)| d < current) {
                best = Some((*template_id, index, d));
            }
        }
    }

    match best {
        None => FieldOutcome::NoCandidate,
        Some((template_id, index, d)) if d < ACCEPT_THRESHOLD => {
            pool.claim(index);
            let matched = &pool.boxes()[index];
            FieldOutcome::Matched(MatchAssignment {
                field_name: name.to_string(),
                matched_text: matched.text.clone(),
                confidence: matched.confidence,
                distance: d,
                source_template_id: Some(template_id),
                box_index: index,
            })
        }
        Some((_, _, d)) => FieldOutcome::BelowThresholdRejected { best_distance: d },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bounds, DetectedBox, FieldReference};

    fn template(id: TemplateId, fields: &[(&str, f64, f64)]) -> Template {
        Template::new(
            id,
            &format!("T{id}"),
            1.0,
            fields
                .iter()
                .map(|(name, left, top)| FieldReference {
                    field_name: name.to_string(),
                    bounds: Bounds::new(*left, *top, 100.0, 20.0),
                    is_manual: false,
                })
                .collect(),
        )
    }

    fn detected(text: &str, confidence: f64, left: f64, top: f64) -> DetectedBox {
        DetectedBox::new(text, confidence, Bounds::new(left, top, 100.0, 20.0)).unwrap()
    }

    #[test]
    fn attributes_field_to_closest_template() {
        let a = template(1, &[("fournisseur", 50.0, 40.0)]);
        let b = template(2, &[("fournisseur", 900.0, 1200.0)]);
        let boxes = vec![detected("ACME SARL", 0.9, 52.0, 41.0)];
        let mut pool = CandidatePool::new(&boxes);

        let ResolverOutcome::Resolved(report) = resolve_across_templates(&[a, b], &mut pool, &[])
        else {
            panic!("expected a resolution");
        };
        let assignment = report.outcomes["fournisseur"].assignment().unwrap();
        assert_eq!(assignment.matched_text, "ACME SARL");
        assert_eq!(assignment.source_template_id, Some(1));
    }

    #[test]
    fn sibling_fields_may_come_from_different_templates() {
        let a = template(1, &[("fournisseur", 0.0, 0.0), ("total", 0.0, 500.0)]);
        let b = template(2, &[("fournisseur", 400.0, 0.0), ("total", 400.0, 900.0)]);
        let boxes = vec![detected("ACME", 1.0, 0.0, 0.0), detected("12,00", 1.0, 400.0, 900.0)];
        let mut pool = CandidatePool::new(&boxes);

        let ResolverOutcome::Resolved(report) = resolve_across_templates(&[a, b], &mut pool, &[])
        else {
            panic!("expected a resolution");
        };
        let sources = report.sources();
        assert_eq!(sources["fournisseur"], Some(1));
        assert_eq!(sources["total"], Some(2));
    }

    #[test]
    fn confidence_penalty_breaks_geometric_ties() {
        let a = template(1, &[("numero", 0.0, 0.0)]);
        let boxes = vec![detected("blurry", 0.2, 0.0, 0.0), detected("crisp", 0.99, 0.0, 5.0)];
        let mut pool = CandidatePool::new(&boxes);
        let ResolverOutcome::Resolved(report) = resolve_across_templates(&[a], &mut pool, &[])
        else {
            panic!("expected a resolution");
        };
        assert_eq!(report.values()["numero"], "crisp");
    }

    #[test]
    fn soft_failures() {
        let boxes = vec![detected("x", 1.0, 0.0, 0.0)];
        let mut pool = CandidatePool::new(&boxes);
        assert_eq!(
            resolve_across_templates(&[], &mut pool, &[]),
            ResolverOutcome::NoTemplates
        );

        let far = template(1, &[("total", 2000.0, 2000.0)]);
        let mut pool = CandidatePool::new(&boxes);
        match resolve_across_templates(&[far], &mut pool, &[]) {
            ResolverOutcome::NoMatches(report) => assert_eq!(report.matched_count(), 0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn excluded_fields_are_left_alone() {
        let a = template(1, &[("numFacture", 0.0, 0.0), ("total", 0.0, 300.0)]);
        let boxes = vec![detected("F-2024-0001", 1.0, 0.0, 0.0), detected("10", 1.0, 0.0, 300.0)];
        let mut pool = CandidatePool::new(&boxes);
        let ResolverOutcome::Resolved(report) =
            resolve_across_templates(&[a], &mut pool, &["numFacture"])
        else {
            panic!("expected a resolution");
        };
        assert!(!report.outcomes.contains_key("numFacture"));
        assert!(pool.is_available(0));
    }
}
