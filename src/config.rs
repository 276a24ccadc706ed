use crate::matching::AssignmentStrategy;
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub fields: FieldNames,
    #[serde(default)]
    pub ocr: OcrConfig,
}

fn default_db_path() -> String {
    "store/templates.db".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_filter: default_log_filter(),
            matching: MatchingConfig::default(),
            fields: FieldNames::default(),
            ocr: OcrConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub strategy: AssignmentStrategy,
    /// OCR rendering scale used at extraction time.
    #[serde(default = "default_render_scale")]
    pub render_scale: f64,
}

fn default_render_scale() -> f64 {
    1.0
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::default(),
            render_scale: default_render_scale(),
        }
    }
}

/// Names of the fields the heuristics know how to fill.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    pub identifier: String,
    pub ht: String,
    pub tva: String,
    pub ttc: String,
    pub tax_rate: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            identifier: "numFacture".to_string(),
            ht: "montantHT".to_string(),
            tva: "montantTVA".to_string(),
            ttc: "montantTTC".to_string(),
            tax_rate: "tauxTVA".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_detections")]
    pub cache_detections: bool,
    /// Secondary engine for manual fields.
    #[serde(default)]
    pub fallback: Option<FallbackOcr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackOcr {
    pub endpoint: String,
}

fn default_ocr_endpoint() -> String {
    "http://127.0.0.1:8868/ocr".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_detections() -> bool {
    true
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ocr_endpoint(),
            timeout_secs: default_timeout_secs(),
            cache_detections: default_cache_detections(),
            fallback: None,
        }
    }
}

impl Config {
    /// `None` when the file does not exist. Runs before logging is set up,
    /// so the caller reports the fallback to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map(Some)
    }

    pub fn parse(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(content)?;
        if !(config.matching.render_scale.is_finite() && config.matching.render_scale > 0.0) {
            return Err(format!(
                "matching.render_scale must be positive, got {}",
                config.matching.render_scale
            )
            .into());
        }
        Ok(config)
    }
}
