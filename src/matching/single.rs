use super::optimal::min_cost_assignment;
use super::{
    ACCEPT_THRESHOLD, AssignmentStrategy, CandidatePool, FieldOutcome, MatchReport, Scoring,
    best_available, distance,
};
use crate::model::{FieldReference, MatchAssignment, Template, TemplateId};
use tracing::debug;

/// Matches every non-manual field of `template` against the pool.
pub fn match_template(
    template: &Template,
    pool: &mut CandidatePool<'_>,
    strategy: AssignmentStrategy,
    scoring: Scoring,
) -> MatchReport {
    match_fields(template.auto_fields(), Some(template.id), pool, strategy, scoring)
}

/// Matches an explicit set of field references; boxes claimed here stay
/// claimed in `pool` for the rest of the call.
pub fn match_fields<'t>(
    fields: impl IntoIterator<Item = &'t FieldReference>,
    template_id: Option<TemplateId>,
    pool: &mut CandidatePool<'_>,
    strategy: AssignmentStrategy,
    scoring: Scoring,
) -> MatchReport {
    let mut report = MatchReport::default();
    let mut valid = Vec::new();
    for field in fields {
        if field.bounds.is_degenerate() {
            debug!(field = %field.field_name, "Reference box has no area");
            report.record(&field.field_name, FieldOutcome::InvalidGeometry);
        } else {
            valid.push(field);
        }
    }

    match strategy {
        AssignmentStrategy::Greedy => greedy(&valid, template_id, pool, scoring, &mut report),
        AssignmentStrategy::Optimal => optimal(&valid, template_id, pool, scoring, &mut report),
    }
    report
}

fn greedy(
    fields: &[&FieldReference],
    template_id: Option<TemplateId>,
    pool: &mut CandidatePool<'_>,
    scoring: Scoring,
    report: &mut MatchReport,
) {
    for field in fields {
        let outcome = match best_available(&field.bounds, pool, scoring) {
            None => FieldOutcome::NoCandidate,
            Some((index, d)) if d < ACCEPT_THRESHOLD => {
                pool.claim(index);
                FieldOutcome::Matched(assignment(field, template_id, pool, index, d))
            }
            Some((_, d)) => FieldOutcome::BelowThresholdRejected { best_distance: d },
        };
        log_outcome(&field.field_name, &outcome);
        report.record(&field.field_name, outcome);
    }
}

/// Accepted pairs are maximised first, then their total distance minimised:
/// pairs at or above the threshold cost more than any feasible set of
/// accepted pairs put together.
fn optimal(
    fields: &[&FieldReference],
    template_id: Option<TemplateId>,
    pool: &mut CandidatePool<'_>,
    scoring: Scoring,
    report: &mut MatchReport,
) {
    let candidates: Vec<_> = pool.available().collect();
    if candidates.is_empty() {
        for field in fields {
            report.record(&field.field_name, FieldOutcome::NoCandidate);
        }
        return;
    }

    let distances: Vec<Vec<f64>> = fields
        .iter()
        .map(|f| {
            candidates
                .iter()
                .map(|(_, c)| distance(&f.bounds, c, scoring))
                .collect()
        })
        .collect();

    let forbidden = ACCEPT_THRESHOLD * (fields.len() as f64 + 1.0);
    let cost: Vec<Vec<f64>> = distances
        .iter()
        .map(|row| {
            row.iter()
                .map(|&d| if d < ACCEPT_THRESHOLD { d } else { forbidden })
                .collect()
        })
        .collect();
    let solution = min_cost_assignment(&cost);

    let accepted: Vec<Option<usize>> = solution
        .iter()
        .enumerate()
        .map(|(row, col)| col.filter(|&c| distances[row][c] < ACCEPT_THRESHOLD))
        .collect();
    let taken: Vec<usize> = accepted.iter().flatten().copied().collect();

    for (row, field) in fields.iter().enumerate() {
        let outcome = match accepted[row] {
            Some(col) => {
                let (index, _) = candidates[col];
                pool.claim(index);
                FieldOutcome::Matched(assignment(field, template_id, pool, index, distances[row][col]))
            }
            None => distances[row]
                .iter()
                .enumerate()
                .filter(|(col, _)| !taken.contains(col))
                .map(|(_, &d)| d)
                .reduce(f64::min)
                .map_or(FieldOutcome::NoCandidate, |best_distance| {
                    FieldOutcome::BelowThresholdRejected { best_distance }
                }),
        };
        log_outcome(&field.field_name, &outcome);
        report.record(&field.field_name, outcome);
    }
}

fn assignment(
    field: &FieldReference,
    template_id: Option<TemplateId>,
    pool: &CandidatePool<'_>,
    index: usize,
    distance: f64,
) -> MatchAssignment {
    let matched = &pool.boxes()[index];
    MatchAssignment {
        field_name: field.field_name.clone(),
        matched_text: matched.text.clone(),
        confidence: matched.confidence,
        distance,
        source_template_id: template_id,
        box_index: index,
    }
}

fn log_outcome(field: &str, outcome: &FieldOutcome) {
    match outcome {
        FieldOutcome::Matched(a) => {
            debug!(field, text = %a.matched_text, distance = a.distance, "Field matched")
        }
        FieldOutcome::BelowThresholdRejected { best_distance } => {
            debug!(field, best_distance, "Best candidate rejected by threshold")
        }
        FieldOutcome::NoCandidate => debug!(field, "No candidate box left"),
        FieldOutcome::InvalidGeometry => {}
    }
}
