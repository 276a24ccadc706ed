use crate::model::{Bounds, FieldReference, Template, TemplateId};
use crate::ocr::OcrLine;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::path::Path;
use tracing::{debug, info};

pub struct TemplateStore {
    conn: Connection,
}

impl TemplateStore {
    /// Open (or create) the template store at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                render_scale REAL NOT NULL DEFAULT 1.0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS template_fields (
                template_id INTEGER NOT NULL,
                field_name TEXT NOT NULL,
                box_left REAL NOT NULL,
                box_top REAL NOT NULL,
                box_width REAL NOT NULL,
                box_height REAL NOT NULL,
                is_manual INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (template_id, field_name),
                FOREIGN KEY (template_id) REFERENCES templates(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // OCR output keyed by document fingerprint
        conn.execute(
            "CREATE TABLE IF NOT EXISTS detection_cache (
                fingerprint TEXT PRIMARY KEY,
                lines_json TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        debug!("Template store initialized");
        Ok(Self { conn })
    }

    /// Hex SHA-256 of the document bytes
    pub fn fingerprint(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Store a new template. Degenerate reference boxes and a non-positive
    /// render scale are refused.
    pub fn insert_template(
        &self,
        name: &str,
        render_scale: f64,
        fields: &[FieldReference],
    ) -> Result<TemplateId, Box<dyn Error>> {
        if !(render_scale.is_finite() && render_scale > 0.0) {
            return Err(format!("Template '{name}': render scale must be positive, got {render_scale}").into());
        }
        if let Some(bad) = fields.iter().find(|f| f.bounds.is_degenerate()) {
            return Err(format!(
                "Template '{name}': field '{}' has degenerate bounds {:?}",
                bad.field_name, bad.bounds
            )
            .into());
        }
        if let Some(bad) = fields.iter().find(|f| f.field_name.trim().is_empty()) {
            return Err(format!("Template '{name}': empty field name at {:?}", bad.bounds).into());
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO templates (name, render_scale) VALUES (?1, ?2)",
            params![name, render_scale],
        )?;
        let id = tx.last_insert_rowid();
        for field in fields {
            // Later duplicates of a field name replace earlier ones
            tx.execute(
                "INSERT OR REPLACE INTO template_fields
                    (template_id, field_name, box_left, box_top, box_width, box_height, is_manual)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    field.field_name,
                    field.bounds.left,
                    field.bounds.top,
                    field.bounds.width,
                    field.bounds.height,
                    field.is_manual,
                ],
            )?;
        }
        tx.commit()?;

        info!(template_id = id, name = %name, fields = fields.len(), "Template stored");
        Ok(id)
    }

    pub fn get_template(&self, id: TemplateId) -> SqliteResult<Option<Template>> {
        let header = self
            .conn
            .query_row(
                "SELECT id, name, render_scale FROM templates WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?)),
            )
            .optional()?;

        match header {
            Some((id, name, scale)) => Ok(Some(Template::new(id, &name, scale, self.fields_of(id)?))),
            None => Ok(None),
        }
    }

    /// All templates, ordered by id
    pub fn list_templates(&self) -> SqliteResult<Vec<Template>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, render_scale FROM templates ORDER BY id")?;
        let headers = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        headers
            .into_iter()
            .map(|(id, name, scale)| Ok(Template::new(id, &name, scale, self.fields_of(id)?)))
            .collect()
    }

    fn fields_of(&self, template_id: TemplateId) -> SqliteResult<Vec<FieldReference>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_name, box_left, box_top, box_width, box_height, is_manual
             FROM template_fields
             WHERE template_id = ?1
             ORDER BY field_name",
        )?;
        let rows = stmt.query_map(params![template_id], |row| Self::row_to_field(row))?;
        rows.collect()
    }

    /// Helper: map the 6-column field projection to `FieldReference`.
    fn row_to_field(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldReference> {
        Ok(FieldReference {
            field_name: row.get(0)?,
            bounds: Bounds::new(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
            is_manual: row.get(5)?,
        })
    }

    /// Returns whether a template was removed
    pub fn delete_template(&self, id: TemplateId) -> SqliteResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM template_fields WHERE template_id = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
        tx.commit()?;
        if removed > 0 {
            info!(template_id = id, "Template removed");
        }
        Ok(removed > 0)
    }

    pub fn template_count(&self) -> SqliteResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM templates", [], |row| row.get(0))
    }

    pub fn cached_detections(&self, fingerprint: &str) -> Result<Option<Vec<OcrLine>>, Box<dyn Error>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT lines_json FROM detection_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn store_detections(&self, fingerprint: &str, lines: &[OcrLine]) -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string(lines)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO detection_cache (fingerprint, lines_json) VALUES (?1, ?2)",
            params![fingerprint, json],
        )?;
        debug!(fingerprint = %fingerprint, lines = lines.len(), "Detections cached");
        Ok(())
    }
}
