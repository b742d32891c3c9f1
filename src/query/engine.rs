use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use log::{debug, info};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Number, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use super::expr::{quote_ident, CompiledQuery};
use super::pivot::compile_pivot;
use super::simple::{compile_lookup, compile_simple};
use super::types::{PivotRequest, QueryMetadata, QueryResponse, SimpleQueryRequest};
use super::view::{build_unified_view, LoadedTable, ViewHandle, VIEW_NAME};
use crate::error::QueryError;
use crate::metadata::Entries;
use crate::registry::{self, Registry, IDENTIFIER_FIELD};
use crate::types::{DatasetDescriptor, DownloadMetadataEntry};

/// Bookkeeping table: one row per ingested dataset.
const LOADS_TABLE: &str = "_rdw_loads";

/// Identifies the copy of a dataset a table was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStamp {
    pub downloaded_at: String,
    pub size: u64,
}

impl LoadStamp {
    /// Taken from the download metadata when there is an entry, otherwise
    /// from the file's modification time and length.
    pub fn for_file(path: &Path, entry: Option<&DownloadMetadataEntry>) -> Result<Self, QueryError> {
        if let Some(entry) = entry {
            return Ok(Self {
                downloaded_at: entry.downloaded_at.clone(),
                size: entry.size,
            });
        }
        let meta = std::fs::metadata(path).map_err(|e| QueryError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        Ok(Self {
            downloaded_at: modified,
            size: meta.len(),
        })
    }
}

/// SQLite database holding one table per dataset and the unified view
/// over them. A file-backed engine keeps its tables between runs and only
/// reloads datasets whose download changed.
pub struct Engine {
    conn: Connection,
    tables: Vec<LoadedTable>,
    stamps: HashMap<String, LoadStamp>,
    view: Option<ViewHandle>,
    result_limit: usize,
}

impl Engine {
    pub fn open(path: &Path, result_limit: usize) -> Result<Self, QueryError> {
        debug!("Opening query database {}", path.display());
        Self::init(Connection::open(path)?, result_limit)
    }

    pub fn open_in_memory(result_limit: usize) -> Result<Self, QueryError> {
        Self::init(Connection::open_in_memory()?, result_limit)
    }

    fn init(conn: Connection, result_limit: usize) -> Result<Self, QueryError> {
        register_functions(&conn)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                dataset TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                priority INTEGER NOT NULL,
                columns TEXT NOT NULL,
                downloaded_at TEXT NOT NULL,
                size INTEGER NOT NULL
            )",
            quote_ident(LOADS_TABLE)
        ))?;

        let mut tables = Vec::new();
        let mut stamps = HashMap::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT dataset, table_name, priority, columns, downloaded_at, size \
                 FROM {} ORDER BY priority, dataset",
                quote_ident(LOADS_TABLE)
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let dataset: String = row.get(0)?;
                let columns: String = row.get(3)?;
                let size: i64 = row.get(5)?;
                stamps.insert(
                    dataset.clone(),
                    LoadStamp {
                        downloaded_at: row.get(4)?,
                        size: size.max(0) as u64,
                    },
                );
                tables.push(LoadedTable {
                    dataset,
                    table: row.get(1)?,
                    priority: row.get(2)?,
                    columns: columns.split(',').map(str::to_string).collect(),
                });
            }
        }
        if !tables.is_empty() {
            debug!("Query database already holds {} datasets", tables.len());
        }

        Ok(Self {
            conn,
            tables,
            stamps,
            view: None,
            result_limit: result_limit.max(1),
        })
    }

    /// Brings the tables in line with the datasets in `data_dir`: new or
    /// re-downloaded datasets are (re)loaded, vanished ones dropped, and the
    /// view is rebuilt. Returns whether any table changed.
    pub fn refresh(
        &mut self,
        registry: &Registry,
        data_dir: &Path,
        downloads: &Entries,
    ) -> Result<bool, QueryError> {
        let primary = registry
            .primary()
            .ok_or_else(|| QueryError::NotReady("the dataset registry is empty".to_string()))?;
        let available = registry.available(data_dir);

        let mut changed = false;
        let vanished: Vec<String> = self
            .tables
            .iter()
            .filter(|t| !available.iter().any(|d| d.name == t.dataset))
            .map(|t| t.dataset.clone())
            .collect();
        for dataset in vanished {
            self.drop_view()?;
            self.drop_dataset(&dataset)?;
            changed = true;
        }

        for dataset in available {
            let path = registry::dataset_path(data_dir, dataset);
            let stamp = LoadStamp::for_file(&path, downloads.get(&dataset.name))?;
            if self.stamps.get(&dataset.name) == Some(&stamp) {
                continue;
            }
            self.drop_view()?;
            self.load_dataset(dataset, &path, stamp)?;
            changed = true;
        }

        if changed || self.view.is_none() {
            self.rebuild_view(&primary.name)?;
        }
        Ok(changed)
    }

    pub fn is_loaded(&self, dataset: &str) -> bool {
        self.tables.iter().any(|t| t.dataset == dataset)
    }

    pub fn tables(&self) -> &[LoadedTable] {
        &self.tables
    }

    pub fn stamp(&self, dataset: &str) -> Option<&LoadStamp> {
        self.stamps.get(dataset)
    }

    /// Ingests a CSV file into `ds_<name>`, replacing any earlier copy.
    pub fn load_dataset(
        &mut self,
        dataset: &DatasetDescriptor,
        path: &Path,
        stamp: LoadStamp,
    ) -> Result<(), QueryError> {
        let load_error = |message: String| QueryError::Load {
            path: path.to_path_buf(),
            message,
        };
        let start_time = Instant::now();
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| load_error(e.to_string()))?;
        let headers = reader.headers().map_err(|e| load_error(e.to_string()))?;
        let columns = normalize_headers(headers.iter());
        if columns.is_empty() {
            return Err(load_error("file has no header row".to_string()));
        }

        let table = format!("ds_{}", dataset.name);
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect();
        let placeholders = vec!["?"; columns.len()].join(", ");

        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({defs});",
            table = quote_ident(&table),
            defs = column_defs.join(", ")
        ))?;
        let mut rows = 0usize;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(&table),
                placeholders
            ))?;
            for record in reader.records() {
                let record = record.map_err(|e| load_error(e.to_string()))?;
                insert.execute(params_from_iter((0..columns.len()).map(|i| record.get(i))))?;
                rows += 1;
            }
        }
        if columns.iter().any(|c| c == IDENTIFIER_FIELD) {
            tx.execute_batch(&format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&format!("{}_{}", table, IDENTIFIER_FIELD)),
                quote_ident(&table),
                quote_ident(IDENTIFIER_FIELD)
            ))?;
        }
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} \
                 (dataset, table_name, priority, columns, downloaded_at, size) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                quote_ident(LOADS_TABLE)
            ),
            params![
                dataset.name,
                table,
                dataset.priority,
                columns.join(","),
                stamp.downloaded_at,
                stamp.size as i64
            ],
        )?;
        tx.commit()?;

        info!(
            "Loaded {} rows of {} from {} in {:.2?}",
            rows,
            dataset.name,
            path.display(),
            start_time.elapsed()
        );

        self.tables.retain(|t| t.dataset != dataset.name);
        self.tables.push(LoadedTable {
            dataset: dataset.name.clone(),
            table,
            priority: dataset.priority,
            columns,
        });
        self.tables
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.dataset.cmp(&b.dataset)));
        self.stamps.insert(dataset.name.clone(), stamp);
        Ok(())
    }

    fn drop_dataset(&mut self, dataset: &str) -> Result<(), QueryError> {
        let Some(table) = self.tables.iter().find(|t| t.dataset == dataset) else {
            return Ok(());
        };
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table.table)))?;
        tx.execute(
            &format!("DELETE FROM {} WHERE dataset = ?", quote_ident(LOADS_TABLE)),
            params![dataset],
        )?;
        tx.commit()?;
        info!("Dropped {}, its file is no longer present", dataset);

        self.tables.retain(|t| t.dataset != dataset);
        self.stamps.remove(dataset);
        Ok(())
    }

    fn drop_view(&mut self) -> Result<(), QueryError> {
        self.view = None;
        self.conn
            .execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_ident(VIEW_NAME)))?;
        Ok(())
    }

    /// Recreates the unified view from the loaded tables.
    pub fn rebuild_view(&mut self, primary: &str) -> Result<&ViewHandle, QueryError> {
        self.view = None;
        let view = build_unified_view(primary, &self.tables)?;
        self.conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS {name}; CREATE VIEW {name} AS {definition};",
            name = quote_ident(VIEW_NAME),
            definition = view.definition()
        ))?;
        debug!("Unified view joins {:?}", view.datasets());
        Ok(&*self.view.insert(view))
    }

    pub fn view(&self) -> Result<&ViewHandle, QueryError> {
        self.view.as_ref().ok_or_else(|| {
            QueryError::NotReady("the unified view has not been built yet".to_string())
        })
    }

    pub fn columns(&self) -> Result<Vec<String>, QueryError> {
        Ok(self.view()?.columns().map(str::to_string).collect())
    }

    pub fn pivot(&self, request: &PivotRequest) -> Result<QueryResponse, QueryError> {
        let compiled = compile_pivot(request, self.view()?, self.result_limit)?;
        self.execute(&compiled)
    }

    pub fn simple_query(&self, request: &SimpleQueryRequest) -> Result<QueryResponse, QueryError> {
        let compiled = compile_simple(request, self.view()?, self.result_limit)?;
        self.execute(&compiled)
    }

    /// All view columns of the first row matching the plate, if any.
    pub fn lookup(&self, identifier: &str) -> Result<Option<Map<String, Value>>, QueryError> {
        let compiled = compile_lookup(identifier, self.view()?)?;
        Ok(self.run(&compiled)?.into_iter().next())
    }

    pub fn execute(&self, compiled: &CompiledQuery) -> Result<QueryResponse, QueryError> {
        let start_time = Instant::now();
        let data = self.run(compiled)?;
        let metadata = QueryMetadata {
            execution_time_seconds: start_time.elapsed().as_secs_f64(),
            row_count: data.len(),
            compiled_query: compiled.sql.clone(),
            parameters: compiled.params.iter().map(|p| p.to_string()).collect(),
        };
        debug!(
            "Query returned {} rows in {:.3}s: {}",
            metadata.row_count, metadata.execution_time_seconds, metadata.compiled_query
        );
        Ok(QueryResponse { data, metadata })
    }

    fn run(&self, compiled: &CompiledQuery) -> Result<Vec<Map<String, Value>>, QueryError> {
        let mut stmt = self.conn.prepare(&compiled.sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(compiled.params.iter()))?;

        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            data.push(object);
        }
        Ok(data)
    }
}

fn register_functions(conn: &Connection) -> Result<(), QueryError> {
    conn.create_scalar_function(
        "try_number",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            Ok(match ctx.get_raw(0) {
                ValueRef::Integer(i) => Some(i as f64),
                ValueRef::Real(f) => Some(f),
                ValueRef::Text(t) => std::str::from_utf8(t).ok().and_then(parse_number),
                ValueRef::Null | ValueRef::Blob(_) => None,
            })
        },
    )?;
    Ok(())
}

/// Best-effort numeric coercion of a CSV cell.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

/// `Datum eerste toelating` -> `datum_eerste_toelating`; duplicates get a
/// numeric suffix and blank headers become `column_<n>`.
pub fn normalize_column_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.trim_start_matches('\u{feff}').trim().chars() {
        if c.is_alphanumeric() {
            name.extend(c.to_lowercase());
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    name.trim_matches('_').to_string()
}

fn normalize_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for (i, raw) in headers.enumerate() {
        let mut name = normalize_column_name(raw);
        if name.is_empty() {
            name = format!("column_{}", i + 1);
        }
        let base = name.clone();
        let mut n = 2;
        while !seen.insert(name.clone()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        columns.push(name);
    }
    columns
}
