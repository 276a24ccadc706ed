use clap::{Args, Parser, Subcommand};
use invoice_matcher::config::Config;
use invoice_matcher::extract::{ExtractionMode, ExtractionSettings, Extractor, extract_offline};
use invoice_matcher::model::{FieldReference, TemplateId};
use invoice_matcher::ocr::{HttpRecognizer, OcrLine, TextRecognizer, detected_boxes};
use invoice_matcher::template_db::TemplateStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "invoice_matcher")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Match OCR text boxes on scanned invoices against stored templates", long_about = None)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, default_value = ".config/matcher.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModeArgs {
    /// Match against a single template
    #[arg(long, conflicts_with = "preview")]
    template: Option<TemplateId>,

    /// Template-free extraction of amounts and invoice number
    #[arg(long)]
    preview: bool,
}

impl ModeArgs {
    fn mode(&self) -> ExtractionMode {
        match (self.template, self.preview) {
            (Some(id), _) => ExtractionMode::Template(id),
            (None, true) => ExtractionMode::Preview,
            (None, false) => ExtractionMode::AllTemplates,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// OCR page images and extract their fields
    Extract {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Extract fields from a saved OCR output (JSON list of lines)
    MatchBoxes {
        detections: PathBuf,

        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Manage stored templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Store a template from a JSON definition
    Add { definition: PathBuf },
    List,
    Show { id: TemplateId },
    Remove { id: TemplateId },
}

/// JSON form accepted by `template add`.
#[derive(Deserialize)]
struct TemplateDefinition {
    name: String,
    #[serde(default = "default_scale")]
    render_scale: f64,
    fields: Vec<FieldReference>,
}

fn default_scale() -> f64 {
    1.0
}

fn open_store(db_path: &str) -> Result<TemplateStore, Box<dyn std::error::Error>> {
    if let Some(parent) = Path::new(db_path).parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(TemplateStore::new(db_path)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let loaded = Config::load(&cli.config)?;
    let found = loaded.is_some();
    let cfg = loaded.unwrap_or_default();

    // init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    if !found {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let store = open_store(&cfg.db_path)?;
    let settings = ExtractionSettings::from(&cfg);

    match cli.command {
        Commands::Extract { images, mode } => {
            let timeout = Duration::from_secs(cfg.ocr.timeout_secs);
            let primary = HttpRecognizer::new("primary", &cfg.ocr.endpoint, timeout);
            let fallback = cfg
                .ocr
                .fallback
                .as_ref()
                .map(|f| HttpRecognizer::new("fallback", &f.endpoint, timeout));
            let extractor = Extractor::new(
                &store,
                &primary,
                fallback.as_ref().map(|f| f as &dyn TextRecognizer),
                settings,
                cfg.ocr.cache_detections,
            );

            let (documents, summary) = extractor.extract_batch(&images, mode.mode()).await;
            let output = serde_json::json!({ "documents": documents, "summary": summary });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::MatchBoxes { detections, mode } => {
            let lines: Vec<OcrLine> = serde_json::from_str(&fs::read_to_string(&detections)?)?;
            let boxes = detected_boxes(&lines);
            info!(lines = lines.len(), boxes = boxes.len(), "Loaded detections");

            let outcome = extract_offline(&store, &boxes, mode.mode(), &settings)?;
            if outcome.is_extracted() {
                info!(message = %outcome.message(), "Extraction finished");
            } else {
                warn!(message = %outcome.message(), "Extraction soft failure");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Template { action } => match action {
            TemplateAction::Add { definition } => {
                let def: TemplateDefinition = serde_json::from_str(&fs::read_to_string(&definition)?)?;
                let id = store.insert_template(&def.name, def.render_scale, &def.fields)?;
                println!("{id}");
            }
            TemplateAction::List => {
                let templates = store.list_templates()?;
                info!(count = templates.len(), "Stored templates");
                println!("{}", serde_json::to_string_pretty(&templates)?);
            }
            TemplateAction::Show { id } => {
                let template = store
                    .get_template(id)?
                    .ok_or_else(|| format!("No template found with id {id}"))?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateAction::Remove { id } => {
                if !store.delete_template(id)? {
                    return Err(format!("No template found with id {id}").into());
                }
            }
        },
    }

    Ok(())
}
