//! Table loading collaborators
//!
//! Turn a path into a [`TableStore`]. Load problems are [`DataError`]s and
//! never reach the analysis error taxonomy; sheets that cannot be read are
//! skipped and reported as warnings.

use calamine::{open_workbook_auto, Data, Reader, Sheets};
use chrono::{Duration, NaiveDate};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tabsight_duck::{Table, TableError, TableStore};
use tabsight_ir::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("Source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Unsupported source {}: expected a workbook, a .csv file or a directory of them", .0.display())]
    Unsupported(PathBuf),

    #[error("Failed to open workbook {}: {message}", .path.display())]
    Workbook { path: PathBuf, message: String },

    #[error("Failed to read CSV {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("No readable tables in {}", .0.display())]
    Empty(PathBuf),

    #[error("Loader task failed: {0}")]
    Task(String),
}

/// Tables read from one source
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub source: String,
    pub store: TableStore,
    pub warnings: Vec<String>,
}

pub trait TableLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedDataset, DataError>;
}

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table")
        .to_string()
}

/// First row as header: blanks get positional names, repeats get a suffix
fn header_names(cells: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    cells
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let base = match raw.trim() {
                "" => format!("column_{}", i + 1),
                name => name.to_string(),
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

/// Rows fitted to the header width, blank rows dropped
fn build_table(name: String, mut rows: Vec<Vec<Value>>) -> Result<Option<Table>, DataError> {
    if rows.is_empty() {
        return Ok(None);
    }
    let header: Vec<String> = rows
        .remove(0)
        .into_iter()
        .map(|v| if v.is_null() { String::new() } else { v.to_string() })
        .collect();
    let columns = header_names(header);
    if columns.is_empty() {
        return Ok(None);
    }

    let width = columns.len();
    let rows = rows
        .into_iter()
        .filter(|row| row.iter().any(|v| !v.is_null()))
        .map(|mut row| {
            row.resize(width, Value::Null);
            row
        })
        .collect();

    Ok(Some(Table::new(name, columns, rows)?))
}

/// Excel serial date to ISO text, 1900 date system
fn excel_serial_to_iso(serial: f64) -> Option<String> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    let at = epoch.checked_add_signed(Duration::try_milliseconds(millis)?)?;
    if serial.fract().abs() < 1e-9 {
        Some(at.format("%Y-%m-%d").to_string())
    } else {
        Some(at.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Float(n) if n.fract() == 0.0 && n.abs() < 1e15 => Value::Int(*n as i64),
        Data::Float(n) => Value::Float(*n),
        Data::Int(n) => Value::Int(*n),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            excel_serial_to_iso(serial).map_or(Value::Float(serial), Value::String)
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
    }
}

/// xlsx, xls, xlsb and ods workbooks; one table per sheet named `<stem>_<sheet>`
pub struct WorkbookLoader;

impl TableLoader for WorkbookLoader {
    fn load(&self, path: &Path) -> Result<LoadedDataset, DataError> {
        let mut workbook: Sheets<_> = open_workbook_auto(path).map_err(|e| DataError::Workbook {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let stem = stem_of(path);
        let mut store = TableStore::new();
        let mut warnings = Vec::new();

        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        for sheet_name in &sheet_names {
            let range = match workbook.worksheet_range(sheet_name) {
                Ok(range) => range,
                Err(e) => {
                    tracing::warn!(sheet = %sheet_name, error = %e, "Skipping unreadable sheet");
                    warnings.push(format!("Sheet '{}' could not be read: {}", sheet_name, e));
                    continue;
                }
            };

            let rows: Vec<Vec<Value>> = range
                .rows()
                .map(|row| row.iter().map(cell_value).collect())
                .collect();
            let name = format!("{}_{}", stem, sheet_name.trim().replace(char::is_whitespace, "_"));
            match build_table(name, rows)? {
                Some(table) => {
                    tracing::debug!(table = %table.name, rows = table.row_count(), "Sheet loaded");
                    store.insert(table);
                }
                None => warnings.push(format!("Sheet '{}' is empty", sheet_name)),
            }
        }

        if store.is_empty() {
            return Err(DataError::Empty(path.to_path_buf()));
        }

        Ok(LoadedDataset {
            source: path.display().to_string(),
            store,
            warnings,
        })
    }
}

/// A `.csv` file, or every `.csv` file directly inside a directory
pub struct CsvLoader;

impl CsvLoader {
    fn read_file(path: &Path) -> Result<Option<Table>, DataError> {
        let csv_error = |source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            rows.push(record.iter().map(Value::infer).collect());
        }
        build_table(stem_of(path), rows)
    }

    fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, DataError> {
        let io_error = |source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.is_file() && extension_of(&path).as_deref() == Some("csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl TableLoader for CsvLoader {
    fn load(&self, path: &Path) -> Result<LoadedDataset, DataError> {
        let files = if path.is_dir() {
            Self::csv_files(path)?
        } else {
            vec![path.to_path_buf()]
        };

        let mut store = TableStore::new();
        let mut warnings = Vec::new();
        for file in &files {
            match Self::read_file(file)? {
                Some(table) => store.insert(table),
                None => warnings.push(format!("{} has no header row", file.display())),
            }
        }

        if store.is_empty() {
            return Err(DataError::Empty(path.to_path_buf()));
        }

        Ok(LoadedDataset {
            source: path.display().to_string(),
            store,
            warnings,
        })
    }
}

/// Picks the loader from the path: directory or `.csv` to [`CsvLoader`],
/// workbook extensions to [`WorkbookLoader`]
pub struct FileLoader;

impl TableLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<LoadedDataset, DataError> {
        if !path.exists() {
            return Err(DataError::NotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            return CsvLoader.load(path);
        }

        let dataset = match extension_of(path).as_deref() {
            Some("csv") => CsvLoader.load(path)?,
            Some(ext) if WORKBOOK_EXTENSIONS.contains(&ext) => WorkbookLoader.load(path)?,
            _ => return Err(DataError::Unsupported(path.to_path_buf())),
        };

        tracing::info!(
            source = %dataset.source,
            tables = dataset.store.len(),
            warnings = dataset.warnings.len(),
            "Dataset loaded"
        );
        Ok(dataset)
    }
}
