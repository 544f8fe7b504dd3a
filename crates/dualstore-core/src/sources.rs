//! Read-only access to the two physical store kinds.
//!
//! Both readers hand back every cell as text; interpretation (normalization,
//! comparison) happens in [`crate::record_set`].

use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::warn;

use crate::error::{Result, SyncError};

const TABULAR_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
const RELATIONAL_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

/// Header plus rows, exactly as the store exposes them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub trait RecordSource {
    fn read_all(&self) -> Result<RawTable>;
    fn location(&self) -> &Path;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Spreadsheet workbook; first sheet, header row.
    Tabular,
    /// SQLite database file; one table.
    Relational { table: String },
}

impl StoreKind {
    /// Infer the kind from the file extension.
    pub fn infer(path: &Path, table: &str) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if TABULAR_EXTENSIONS.contains(&ext.as_str()) {
            Ok(StoreKind::Tabular)
        } else if RELATIONAL_EXTENSIONS.contains(&ext.as_str()) {
            Ok(StoreKind::Relational {
                table: table.to_string(),
            })
        } else {
            Err(SyncError::schema(
                path,
                format!("unrecognised store type `.{ext}`"),
            ))
        }
    }

    /// Extension used for a temporary copy of a store of this kind.
    pub fn extension_for(path: &Path) -> String {
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    pub fn open(&self, path: &Path) -> Box<dyn RecordSource> {
        match self {
            StoreKind::Tabular => Box::new(TabularSource::new(path)),
            StoreKind::Relational { table } => Box::new(RelationalStore::new(path, table)),
        }
    }
}

// ── Tabular ─────────────────────────────────────────────────────────────────

pub struct TabularSource {
    path: PathBuf,
}

impl TabularSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RecordSource for TabularSource {
    fn read_all(&self) -> Result<RawTable> {
        let mut workbook =
            open_workbook_auto(&self.path).map_err(|e| SyncError::schema(&self.path, e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| SyncError::schema(&self.path, "workbook has no sheets"))?
            .map_err(|e| SyncError::schema(&self.path, e.to_string()))?;

        let mut rows = range.rows();
        let header: Vec<String> = rows
            .next()
            .ok_or_else(|| SyncError::schema(&self.path, "first sheet has no header row"))?
            .iter()
            .map(cell_text)
            .collect();

        // The used range can extend past the header when stray cells sit to
        // the right of the table; those columns have no field name.
        let width = header
            .iter()
            .rposition(|h| !h.trim().is_empty())
            .map(|idx| idx + 1)
            .ok_or_else(|| SyncError::schema(&self.path, "header row is empty"))?;
        let columns = name_columns(&header[..width]);

        let mut ignored_cells = 0usize;
        let body = rows
            .map(|row| {
                ignored_cells += row
                    .iter()
                    .skip(width)
                    .filter(|c| !cell_text(c).trim().is_empty())
                    .count();
                row.iter().take(width).map(cell_text).collect::<Vec<_>>()
            })
            .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
            .collect();

        if ignored_cells > 0 {
            warn!(
                path = %self.path.display(),
                cells = ignored_cells,
                "ignoring cells outside the header columns"
            );
        }

        Ok(RawTable {
            columns,
            rows: body,
        })
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// Blank headers inside the table get a positional name (`Unnamed: 2`) so
/// their column can still be reported as an unmatched field.
fn name_columns(header: &[String]) -> Vec<String> {
    header
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            if h.trim().is_empty() {
                format!("Unnamed: {idx}")
            } else {
                h.clone()
            }
        })
        .collect()
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ── Relational ──────────────────────────────────────────────────────────────

pub struct RelationalStore {
    path: PathBuf,
    table: String,
}

impl RelationalStore {
    pub fn new(path: impl AsRef<Path>, table: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            table: table.to_string(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SyncError::schema(&self.path, e.to_string()))
    }

    pub fn table_exists(&self) -> Result<bool> {
        let conn = self.connect()?;
        table_exists(&conn, &self.table).map_err(|e| SyncError::schema(&self.path, e.to_string()))
    }
}

impl RecordSource for RelationalStore {
    fn read_all(&self) -> Result<RawTable> {
        let conn = self.connect()?;
        let schema_err = |e: rusqlite::Error| SyncError::schema(&self.path, e.to_string());

        if !table_exists(&conn, &self.table).map_err(schema_err)? {
            return Err(SyncError::schema(
                &self.path,
                format!("table `{}` does not exist", self.table),
            ));
        }

        let sql = format!("SELECT * FROM {}", quote_ident(&self.table));
        let mut stmt = conn.prepare(&sql).map_err(schema_err)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([]).map_err(schema_err)?;
        while let Some(row) = cursor.next().map_err(schema_err)? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(value_text(row.get_ref(idx).map_err(schema_err)?));
            }
            rows.push(cells);
        }

        Ok(RawTable { columns, rows })
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => hex::encode(b),
    }
}
