// src/extract.rs

use crate::config::{Config, FieldNames};
use crate::heuristics::{
    self, AmountKind, IdentifierMatch, KeywordOutcome, derive_tax_rate, derive_ttc,
    find_identifier, parse_amount,
};
use crate::manual::{ManualFieldReader, ManualOutcome};
use crate::matching::single::match_fields;
use crate::matching::{
    AssignmentStrategy, CandidatePool, MatchReport, ResolverOutcome, Scoring,
    resolve_across_templates,
};
use crate::model::{DetectedBox, FieldReference, Template, TemplateId};
use crate::ocr::{TextRecognizer, detected_boxes};
use crate::template_db::TemplateStore;
use image::DynamicImage;
use rusqlite::Result as SqliteResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Which templates a document is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Template(TemplateId),
    AllTemplates,
    /// No templates: keyword proximity for amounts, global identifier search.
    Preview,
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub strategy: AssignmentStrategy,
    pub render_scale: f64,
    pub fields: FieldNames,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::default(),
            render_scale: 1.0,
            fields: FieldNames::default(),
        }
    }
}

impl From<&Config> for ExtractionSettings {
    fn from(config: &Config) -> Self {
        Self {
            strategy: config.matching.strategy,
            render_scale: config.matching.render_scale,
            fields: config.fields.clone(),
        }
    }
}

/// How a field value was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionMethod {
    Matched { distance: f64 },
    Manual { engine: String },
    Identifier { score: f64 },
    Keyword,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub text: String,
    pub confidence: f64,
    pub source_template: Option<TemplateId>,
    pub method: ExtractionMethod,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: BTreeMap<String, ExtractedField>,
    /// Field names this extraction tried to fill.
    pub expected: BTreeSet<String>,
    /// Manual fields that could not be read.
    #[serde(default)]
    pub unreadable: Vec<String>,
    /// Per-field outcomes of geometric matching.
    #[serde(default)]
    pub report: MatchReport,
}

impl ExtractionResult {
    fn from_report(report: MatchReport, expected: BTreeSet<String>) -> Self {
        let fields = report
            .assignments()
            .map(|a| {
                (
                    a.field_name.clone(),
                    ExtractedField {
                        text: a.matched_text.clone(),
                        confidence: a.confidence,
                        source_template: a.source_template_id,
                        method: ExtractionMethod::Matched { distance: a.distance },
                    },
                )
            })
            .collect();
        Self {
            fields,
            expected,
            unreadable: Vec::new(),
            report,
        }
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(name, f)| (name.clone(), f.text.clone()))
            .collect()
    }

    pub fn confidences(&self) -> BTreeMap<String, f64> {
        self.fields
            .iter()
            .map(|(name, f)| (name.clone(), f.confidence))
            .collect()
    }

    pub fn sources(&self) -> BTreeMap<String, Option<TemplateId>> {
        self.fields
            .iter()
            .map(|(name, f)| (name.clone(), f.source_template))
            .collect()
    }

    /// (expected fields that were filled, expected fields)
    pub fn coverage(&self) -> (usize, usize) {
        let filled = self
            .expected
            .iter()
            .filter(|name| self.fields.contains_key(*name))
            .count();
        (filled, self.expected.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Extracted(ExtractionResult),
    TemplateNotFound { template_id: TemplateId },
    NoTemplates,
    NothingMatched,
    KeywordNotFound { missing: Vec<AmountKind> },
}

impl ExtractionOutcome {
    pub fn message(&self) -> String {
        match self {
            ExtractionOutcome::Extracted(result) => {
                let (filled, total) = result.coverage();
                format!("Extracted {filled}/{total} fields")
            }
            ExtractionOutcome::TemplateNotFound { template_id } => {
                format!("Template {template_id} does not exist")
            }
            ExtractionOutcome::NoTemplates => {
                "No templates stored; create one or use preview mode".to_string()
            }
            ExtractionOutcome::NothingMatched => {
                "No field matched any stored template".to_string()
            }
            ExtractionOutcome::KeywordNotFound { missing } => {
                let labels: Vec<&str> = missing
                    .iter()
                    .map(|kind| match kind {
                        AmountKind::Ht => "HT",
                        AmountKind::Tva => "TVA",
                    })
                    .collect();
                format!("Keyword not found: no amount next to a {} label", labels.join("/"))
            }
        }
    }

    pub fn is_extracted(&self) -> bool {
        matches!(self, ExtractionOutcome::Extracted(_))
    }
}

/// Matches one template's automatic fields, then the identifier field, then
/// derives missing amounts. Manual fields are listed as unreadable; reading
/// them needs the page image.
pub fn extract_single(
    template: &Template,
    boxes: &[DetectedBox],
    settings: &ExtractionSettings,
) -> ExtractionResult {
    let template = template.rescaled_to(settings.render_scale);
    let identifier = settings.fields.identifier.as_str();
    let mut pool = CandidatePool::new(boxes);

    let report = match_fields(
        template.auto_fields().filter(|f| f.field_name != identifier),
        Some(template.id),
        &mut pool,
        settings.strategy,
        Scoring::Geometric,
    );
    let mut result = ExtractionResult::from_report(report, template.fields.keys().cloned().collect());

    if let Some(reference) = template.fields.get(identifier).filter(|f| !f.is_manual) {
        resolve_identifier(&mut result, &mut pool, identifier, &[(template.id, reference)]);
    }
    result.unreadable = template
        .manual_fields()
        .map(|f| f.field_name.clone())
        .collect();
    derive_amounts(&mut result, &settings.fields);
    result
}

/// Resolves every automatic field over all templates. Manual references are
/// ignored: there is no single authoritative region to crop. When no field
/// matches geometrically the document is not extracted at all, so the
/// identifier search never runs on its own.
pub fn extract_across(
    templates: &[Template],
    boxes: &[DetectedBox],
    settings: &ExtractionSettings,
) -> ExtractionOutcome {
    let scaled: Vec<Template> = templates
        .iter()
        .map(|t| t.rescaled_to(settings.render_scale))
        .collect();
    let identifier = settings.fields.identifier.as_str();
    let mut pool = CandidatePool::new(boxes);

    let report = match resolve_across_templates(&scaled, &mut pool, &[identifier]) {
        ResolverOutcome::NoTemplates => return ExtractionOutcome::NoTemplates,
        ResolverOutcome::NoMatches(report) => {
            debug!(fields = report.outcomes.len(), "No field matched any template");
            return ExtractionOutcome::NothingMatched;
        }
        ResolverOutcome::Resolved(report) => report,
    };

    let expected: BTreeSet<String> = scaled
        .iter()
        .flat_map(|t| t.auto_fields().map(|f| f.field_name.clone()))
        .collect();
    let mut result = ExtractionResult::from_report(report, expected);

    let references: Vec<(TemplateId, &FieldReference)> = scaled
        .iter()
        .filter_map(|t| t.fields.get(identifier).map(|f| (t.id, f)))
        .filter(|(_, f)| !f.is_manual)
        .collect();
    if !references.is_empty() {
        resolve_identifier(&mut result, &mut pool, identifier, &references);
    }
    derive_amounts(&mut result, &settings.fields);
    ExtractionOutcome::Extracted(result)
}

/// Template-free extraction of HT, TVA, TTC, tax rate and invoice number.
pub fn extract_preview(boxes: &[DetectedBox], settings: &ExtractionSettings) -> ExtractionOutcome {
    let preview = heuristics::preview(boxes);
    let summary = match preview.amounts {
        KeywordOutcome::Found(summary) => summary,
        KeywordOutcome::NotFound { missing } => {
            return ExtractionOutcome::KeywordNotFound { missing };
        }
    };

    let names = &settings.fields;
    let mut result = ExtractionResult {
        expected: [&names.ht, &names.tva, &names.ttc, &names.tax_rate, &names.identifier]
            .into_iter()
            .cloned()
            .collect(),
        ..Default::default()
    };
    let derived_confidence = summary.ht.confidence.min(summary.tva.confidence);
    for (name, text, confidence, method) in [
        (&names.ht, format!("{:.2}", summary.ht.value), summary.ht.confidence, ExtractionMethod::Keyword),
        (&names.tva, format!("{:.2}", summary.tva.value), summary.tva.confidence, ExtractionMethod::Keyword),
        (&names.ttc, format!("{:.2}", summary.ttc), derived_confidence, ExtractionMethod::Derived),
        (&names.tax_rate, summary.tax_rate.to_string(), derived_confidence, ExtractionMethod::Derived),
    ] {
        result.fields.insert(
            name.clone(),
            ExtractedField {
                text,
                confidence,
                source_template: None,
                method,
            },
        );
    }
    if let Some(found) = preview.identifier {
        result.fields.insert(names.identifier.clone(), identifier_field(found, None));
    }
    ExtractionOutcome::Extracted(result)
}

fn identifier_field(found: IdentifierMatch, source_template: Option<TemplateId>) -> ExtractedField {
    ExtractedField {
        text: found.text,
        confidence: found.confidence,
        source_template,
        method: ExtractionMethod::Identifier { score: found.score },
    }
}

/// Scores unclaimed boxes against each template's identifier reference.
/// A candidate inside a reference window beats a global fallback; otherwise
/// the higher score wins. The chosen box is claimed.
fn resolve_identifier(
    result: &mut ExtractionResult,
    pool: &mut CandidatePool<'_>,
    name: &str,
    references: &[(TemplateId, &FieldReference)],
) {
    let mut best: Option<(IdentifierMatch, Option<TemplateId>)> = None;
    for (template_id, reference) in references {
        let position = (!reference.bounds.is_degenerate()).then(|| reference.bounds.center());
        let Some(found) = find_identifier(pool.available(), position) else {
            continue;
        };
        let better = best
            .as_ref()
            .is_none_or(|(b, _)| (found.positional, found.score) > (b.positional, b.score));
        if better {
            let source = found.positional.then_some(*template_id);
            best = Some((found, source));
        }
    }

    match best {
        Some((found, source)) => {
            debug!(field = name, text = %found.text, score = found.score, "Identifier chosen");
            pool.claim(found.box_index);
            result.fields.insert(name.to_string(), identifier_field(found, source));
        }
        None => debug!(field = name, "No identifier-like text left"),
    }
}

/// Fills a missing TTC and tax rate when HT and TVA both parse as amounts.
pub fn derive_amounts(result: &mut ExtractionResult, names: &FieldNames) {
    let (Some(ht), Some(tva)) = (result.fields.get(&names.ht), result.fields.get(&names.tva)) else {
        return;
    };
    let (Some(ht_value), Some(tva_value)) = (parse_amount(&ht.text), parse_amount(&tva.text)) else {
        return;
    };
    let confidence = ht.confidence.min(tva.confidence);

    if !result.fields.contains_key(&names.ttc) {
        let ttc = derive_ttc(ht_value, tva_value);
        result.fields.insert(
            names.ttc.clone(),
            ExtractedField {
                text: format!("{ttc:.2}"),
                confidence,
                source_template: None,
                method: ExtractionMethod::Derived,
            },
        );
    }
    if !result.fields.contains_key(&names.tax_rate) {
        result.fields.insert(
            names.tax_rate.clone(),
            ExtractedField {
                text: derive_tax_rate(ht_value, tva_value).to_string(),
                confidence,
                source_template: None,
                method: ExtractionMethod::Derived,
            },
        );
    }
}

/// Loads the templates `mode` needs and runs the synchronous core. For a
/// single-template run, also returns the template rescaled to the current
/// render scale so manual fields can be cropped.
fn run_mode(
    store: &TemplateStore,
    boxes: &[DetectedBox],
    mode: ExtractionMode,
    settings: &ExtractionSettings,
) -> SqliteResult<(ExtractionOutcome, Option<Template>)> {
    match mode {
        ExtractionMode::Template(id) => {
            let Some(template) = store.get_template(id)? else {
                return Ok((ExtractionOutcome::TemplateNotFound { template_id: id }, None));
            };
            let result = extract_single(&template, boxes, settings);
            Ok((
                ExtractionOutcome::Extracted(result),
                Some(template.rescaled_to(settings.render_scale)),
            ))
        }
        ExtractionMode::AllTemplates => {
            let templates = store.list_templates()?;
            Ok((extract_across(&templates, boxes, settings), None))
        }
        ExtractionMode::Preview => Ok((extract_preview(boxes, settings), None)),
    }
}

/// Extraction over already-detected boxes, with no page image. Manual
/// fields stay unreadable.
pub fn extract_offline(
    store: &TemplateStore,
    boxes: &[DetectedBox],
    mode: ExtractionMode,
    settings: &ExtractionSettings,
) -> SqliteResult<ExtractionOutcome> {
    run_mode(store, boxes, mode, settings).map(|(outcome, _)| outcome)
}

async fn read_manual_fields(
    result: &mut ExtractionResult,
    template: &Template,
    page: &DynamicImage,
    reader: &ManualFieldReader<'_>,
) {
    for field in template.manual_fields() {
        match reader.read(page, field).await {
            ManualOutcome::Read(reading) => {
                info!(field = %field.field_name, engine = %reading.engine, "Manual field read");
                result.unreadable.retain(|name| name != &field.field_name);
                result.fields.insert(
                    field.field_name.clone(),
                    ExtractedField {
                        text: reading.text,
                        confidence: reading.confidence,
                        source_template: Some(template.id),
                        method: ExtractionMethod::Manual {
                            engine: reading.engine,
                        },
                    },
                );
            }
            ManualOutcome::Unreadable => {
                warn!(field = %field.field_name, "Manual field unreadable")
            }
            ManualOutcome::InvalidGeometry => {
                warn!(field = %field.field_name, "Manual field has unusable geometry")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub extracted: usize,
    pub soft_failures: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub path: String,
    pub message: String,
    pub outcome: Option<ExtractionOutcome>,
    pub error: Option<String>,
}

/// OCR + matching over page images, backed by the template store.
pub struct Extractor<'a> {
    store: &'a TemplateStore,
    recognizer: &'a dyn TextRecognizer,
    fallback: Option<&'a dyn TextRecognizer>,
    settings: ExtractionSettings,
    cache_detections: bool,
}

impl<'a> Extractor<'a> {
    pub fn new(
        store: &'a TemplateStore,
        recognizer: &'a dyn TextRecognizer,
        fallback: Option<&'a dyn TextRecognizer>,
        settings: ExtractionSettings,
        cache_detections: bool,
    ) -> Self {
        Self {
            store,
            recognizer,
            fallback,
            settings,
            cache_detections,
        }
    }

    /// Detected boxes for a page, from the cache when the same bytes were seen before.
    pub async fn detect(
        &self,
        bytes: &[u8],
        page: &DynamicImage,
    ) -> Result<Vec<DetectedBox>, Box<dyn Error>> {
        let fingerprint = TemplateStore::fingerprint(bytes);
        if self.cache_detections {
            if let Some(lines) = self.store.cached_detections(&fingerprint)? {
                debug!(fingerprint = %fingerprint, lines = lines.len(), "Using cached detections");
                return Ok(detected_boxes(&lines));
            }
        }

        let lines = self.recognizer.recognize(page).await?;
        info!(engine = %self.recognizer.name(), lines = lines.len(), "OCR complete");
        if self.cache_detections {
            self.store.store_detections(&fingerprint, &lines)?;
        }
        Ok(detected_boxes(&lines))
    }

    pub async fn extract_bytes(
        &self,
        bytes: &[u8],
        mode: ExtractionMode,
    ) -> Result<ExtractionOutcome, Box<dyn Error>> {
        let page = image::load_from_memory(bytes)?;
        let boxes = self.detect(bytes, &page).await?;
        let (mut outcome, template) = run_mode(self.store, &boxes, mode, &self.settings)?;

        if let (ExtractionOutcome::Extracted(result), Some(template)) = (&mut outcome, template) {
            let reader = ManualFieldReader::new(self.recognizer, self.fallback);
            read_manual_fields(result, &template, &page, &reader).await;
            derive_amounts(result, &self.settings.fields);
        }
        Ok(outcome)
    }

    pub async fn extract_path(
        &self,
        path: &Path,
        mode: ExtractionMode,
    ) -> Result<ExtractionOutcome, Box<dyn Error>> {
        let bytes = tokio::fs::read(path).await?;
        self.extract_bytes(&bytes, mode).await
    }

    /// Processes every document; a failing document is logged and counted.
    pub async fn extract_batch(
        &self,
        paths: &[PathBuf],
        mode: ExtractionMode,
    ) -> (Vec<DocumentReport>, BatchSummary) {
        let mut summary = BatchSummary::default();
        let mut reports = Vec::with_capacity(paths.len());

        for path in paths {
            let span = info_span!("document", path = %path.display());
            let result = self.extract_path(path, mode).instrument(span.clone()).await;
            let _guard = span.enter();
            summary.processed += 1;

            let report = match result {
                Ok(outcome) => {
                    if outcome.is_extracted() {
                        summary.extracted += 1;
                        info!(message = %outcome.message(), "Document extracted");
                    } else {
                        summary.soft_failures += 1;
                        warn!(message = %outcome.message(), "Document not extracted");
                    }
                    DocumentReport {
                        path: path.display().to_string(),
                        message: outcome.message(),
                        outcome: Some(outcome),
                        error: None,
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    error!(error = %e, "Failed to process document");
                    DocumentReport {
                        path: path.display().to_string(),
                        message: "Processing failed".to_string(),
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        info!(
            processed = summary.processed,
            extracted = summary.extracted,
            soft_failures = summary.soft_failures,
            errors = summary.errors,
            "Batch complete"
        );
        (reports, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bounds;
    use crate::ocr::{OcrError, OcrLine, encode_png};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE_WIDTH: u32 = 640;

    fn detected(text: &str, confidence: f64, left: f64, top: f64, width: f64, height: f64) -> DetectedBox {
        DetectedBox::new(text, confidence, Bounds::new(left, top, width, height)).unwrap()
    }

    fn reference(name: &str, left: f64, top: f64, width: f64, height: f64, manual: bool) -> FieldReference {
        FieldReference {
            field_name: name.to_string(),
            bounds: Bounds::new(left, top, width, height),
            is_manual: manual,
        }
    }

    fn invoice_fields() -> Vec<FieldReference> {
        vec![
            reference("montantHT", 100.0, 200.0, 80.0, 20.0, false),
            reference("montantTVA", 100.0, 240.0, 80.0, 20.0, false),
            reference("numFacture", 300.0, 40.0, 120.0, 20.0, false),
            reference("iban", 20.0, 400.0, 100.0, 20.0, true),
        ]
    }

    fn invoice_boxes() -> Vec<DetectedBox> {
        vec![
            detected("FA-2024-0042", 0.8, 305.0, 42.0, 118.0, 20.0),
            detected("350.00", 0.95, 105.0, 202.0, 78.0, 19.0),
            detected("70.00", 0.9, 102.0, 241.0, 80.0, 20.0),
            detected("999.99", 0.99, 500.0, 440.0, 60.0, 20.0),
        ]
    }

    fn lines_of(boxes: &[DetectedBox]) -> Vec<OcrLine> {
        boxes
            .iter()
            .map(|b| OcrLine {
                points: vec![[b.bounds.left, b.bounds.top], [b.bounds.right(), b.bounds.bottom()]],
                text: b.text.clone(),
                confidence: b.confidence,
            })
            .collect()
    }

    #[test]
    fn single_template_fills_matched_identifier_and_derived_fields() {
        let template = Template::new(1, "Fournisseur A", 1.0, invoice_fields());
        let result = extract_single(&template, &invoice_boxes(), &ExtractionSettings::default());

        let values = result.values();
        assert_eq!(values["montantHT"], "350.00");
        assert_eq!(values["montantTVA"], "70.00");
        assert_eq!(values["numFacture"], "FA-2024-0042");
        assert_eq!(values["montantTTC"], "420.00");
        assert_eq!(values["tauxTVA"], "20");
        assert!(!values.values().any(|v| v == "999.99"));

        assert!(matches!(result.fields["montantHT"].method, ExtractionMethod::Matched { .. }));
        assert!(matches!(result.fields["numFacture"].method, ExtractionMethod::Identifier { .. }));
        assert_eq!(result.fields["numFacture"].source_template, Some(1));
        assert_eq!(result.fields["montantTTC"].method, ExtractionMethod::Derived);
        assert_eq!(result.unreadable, vec!["iban".to_string()]);
        assert_eq!(result.coverage(), (3, 4));
    }

    #[test]
    fn template_authored_at_another_scale_is_rescaled() {
        let halved: Vec<FieldReference> = invoice_fields()
            .into_iter()
            .map(|mut f| {
                f.bounds = f.bounds.scaled(0.5);
                f
            })
            .collect();
        let template = Template::new(1, "low-res", 0.5, halved);
        let result = extract_single(&template, &invoice_boxes(), &ExtractionSettings::default());
        assert_eq!(result.values()["montantHT"], "350.00");
    }

    #[test]
    fn matched_ttc_is_not_overwritten() {
        let mut fields = invoice_fields();
        fields.push(reference("montantTTC", 100.0, 280.0, 80.0, 20.0, false));
        let template = Template::new(1, "with ttc", 1.0, fields);
        let mut boxes = invoice_boxes();
        boxes.push(detected("421.00", 0.9, 101.0, 281.0, 80.0, 20.0));

        let result = extract_single(&template, &boxes, &ExtractionSettings::default());
        assert_eq!(result.values()["montantTTC"], "421.00");
        assert_eq!(result.fields["tauxTVA"].method, ExtractionMethod::Derived);
    }

    #[test]
    fn all_templates_mode() {
        let a = Template::new(1, "A", 1.0, invoice_fields());
        let b = Template::new(2, "B", 1.0, vec![reference("montantHT", 400.0, 50.0, 80.0, 20.0, false)]);
        let ExtractionOutcome::Extracted(result) =
            extract_across(&[a, b], &invoice_boxes(), &ExtractionSettings::default())
        else {
            panic!("expected extraction");
        };
        assert_eq!(result.sources()["montantHT"], Some(1));
        assert_eq!(result.values()["numFacture"], "FA-2024-0042");
        assert!(!result.fields.contains_key("iban"));
        assert!(!result.expected.contains("iban"));

        assert_eq!(
            extract_across(&[], &invoice_boxes(), &ExtractionSettings::default()),
            ExtractionOutcome::NoTemplates
        );
        let far = Template::new(3, "far", 1.0, vec![reference("total", 2000.0, 2000.0, 50.0, 20.0, false)]);
        assert_eq!(
            extract_across(&[far], &invoice_boxes(), &ExtractionSettings::default()),
            ExtractionOutcome::NothingMatched
        );
    }

    #[test]
    fn unmatched_document_gets_no_identifier_alone() {
        let template = Template::new(
            1,
            "A",
            1.0,
            vec![
                reference("montantHT", 100.0, 200.0, 80.0, 20.0, false),
                reference("numFacture", 300.0, 40.0, 120.0, 20.0, false),
            ],
        );
        let boxes = vec![detected("Tel 0612345678", 0.9, 1500.0, 1900.0, 140.0, 20.0)];
        assert_eq!(
            extract_across(&[template], &boxes, &ExtractionSettings::default()),
            ExtractionOutcome::NothingMatched
        );
    }

    #[test]
    fn preview_mode() {
        let boxes = vec![
            detected("Facture N°2024117", 0.9, 20.0, 20.0, 160.0, 20.0),
            detected("Total HT", 0.9, 300.0, 300.0, 80.0, 20.0),
            detected("1 000,00", 0.8, 450.0, 300.0, 80.0, 20.0),
            detected("TVA 20%", 0.9, 300.0, 330.0, 80.0, 20.0),
            detected("200,00", 0.7, 450.0, 331.0, 80.0, 20.0),
        ];
        let ExtractionOutcome::Extracted(result) = extract_preview(&boxes, &ExtractionSettings::default())
        else {
            panic!("expected extraction");
        };
        let values = result.values();
        assert_eq!(values["montantHT"], "1000.00");
        assert_eq!(values["montantTVA"], "200.00");
        assert_eq!(values["montantTTC"], "1200.00");
        assert_eq!(values["tauxTVA"], "20");
        assert_eq!(values["numFacture"], "Facture N°2024117");
        assert_eq!(result.coverage(), (5, 5));
        assert_eq!(result.confidences()["montantTTC"], 0.7);

        let outcome = extract_preview(&boxes[..3], &ExtractionSettings::default());
        assert_eq!(
            outcome,
            ExtractionOutcome::KeywordNotFound { missing: vec![AmountKind::Tva] }
        );
        assert!(outcome.message().contains("TVA"));
    }

    #[test]
    fn offline_template_lookup() {
        let store = TemplateStore::open_in_memory().unwrap();
        let settings = ExtractionSettings::default();
        let boxes = invoice_boxes();
        assert_eq!(
            extract_offline(&store, &boxes, ExtractionMode::AllTemplates, &settings).unwrap(),
            ExtractionOutcome::NoTemplates
        );
        assert_eq!(
            extract_offline(&store, &boxes, ExtractionMode::Template(7), &settings).unwrap(),
            ExtractionOutcome::TemplateNotFound { template_id: 7 }
        );

        let id = store.insert_template("A", 1.0, &invoice_fields()).unwrap();
        let outcome = extract_offline(&store, &boxes, ExtractionMode::Template(id), &settings).unwrap();
        assert_eq!(outcome.message(), "Extracted 3/4 fields");
    }

    struct FakeEngine {
        page_lines: Vec<OcrLine>,
        page_calls: AtomicUsize,
        crop_calls: AtomicUsize,
    }

    #[async_trait]
    impl TextRecognizer for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        async fn recognize(&self, image: &DynamicImage) -> Result<Vec<OcrLine>, OcrError> {
            if image.width() == PAGE_WIDTH {
                self.page_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.page_lines.clone())
            } else {
                self.crop_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![OcrLine {
                    points: vec![[0.0, 0.0], [80.0, 10.0]],
                    text: "FR76 3000 6000".to_string(),
                    confidence: 0.88,
                }])
            }
        }
    }

    #[tokio::test]
    async fn page_extraction_reads_manual_fields_and_caches_detections() {
        let store = TemplateStore::open_in_memory().unwrap();
        let id = store.insert_template("A", 1.0, &invoice_fields()).unwrap();
        let engine = FakeEngine {
            page_lines: lines_of(&invoice_boxes()),
            page_calls: AtomicUsize::new(0),
            crop_calls: AtomicUsize::new(0),
        };
        let extractor = Extractor::new(&store, &engine, None, ExtractionSettings::default(), true);
        let bytes = encode_png(&DynamicImage::new_luma8(PAGE_WIDTH, 480)).unwrap();

        let ExtractionOutcome::Extracted(result) =
            extractor.extract_bytes(&bytes, ExtractionMode::Template(id)).await.unwrap()
        else {
            panic!("expected extraction");
        };
        assert_eq!(result.values()["iban"], "FR76 3000 6000");
        assert_eq!(
            result.fields["iban"].method,
            ExtractionMethod::Manual { engine: "fake".to_string() }
        );
        assert!(result.unreadable.is_empty());
        assert_eq!(result.coverage(), (4, 4));

        extractor.extract_bytes(&bytes, ExtractionMode::Preview).await.unwrap();
        assert_eq!(engine.page_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.crop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_counts_failures_without_stopping() {
        let store = TemplateStore::open_in_memory().unwrap();
        let engine = FakeEngine {
            page_lines: lines_of(&invoice_boxes()),
            page_calls: AtomicUsize::new(0),
            crop_calls: AtomicUsize::new(0),
        };
        let extractor = Extractor::new(&store, &engine, None, ExtractionSettings::default(), false);
        let paths = vec![PathBuf::from("/nonexistent/scan.png")];
        let (reports, summary) = extractor.extract_batch(&paths, ExtractionMode::AllTemplates).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors, 1);
        assert!(reports[0].error.is_some());
    }
}
