//! Geometric field matching for scanned invoices: detected OCR boxes are
//! paired with the reference boxes of stored templates, with template-free
//! heuristics for amounts and invoice numbers.

pub mod config;
pub mod extract;
pub mod heuristics;
pub mod manual;
pub mod matching;
pub mod model;
pub mod ocr;
pub mod template_db;
