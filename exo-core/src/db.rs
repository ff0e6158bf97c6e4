//! Postgres access: pool creation and the CSV-backed dataset table.
//!
//! The dataset table has no fixed schema. Its columns are inferred from the first
//! CSV imported into it and created with `CREATE TABLE IF NOT EXISTS`; later
//! uploads with a different shape are not migrated.

use std::path::Path;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row, TypeInfo};

use crate::config::DatabaseConfig;
use crate::error::ExoError;

/// Lazily connecting pool: the service starts even if Postgres is down.
pub fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let options = config.connect_options()?;
    Ok(PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect_lazy_with(options))
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Inferred SQL type of a CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Boolean,
    Text,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Real => "REAL",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Text => "TEXT",
        }
    }

    /// Integers with gaps widen to real; anything unparseable is text.
    fn infer<'a>(cells: impl Iterator<Item = &'a str>) -> Self {
        let (mut ints, mut reals, mut bools, mut blanks, mut total) = (true, true, true, false, 0);
        for cell in cells {
            total += 1;
            if cell.is_empty() {
                blanks = true;
                continue;
            }
            ints &= cell.parse::<i64>().is_ok();
            reals &= cell.parse::<f64>().is_ok();
            bools &= parse_bool(cell).is_some();
        }
        if total == 0 {
            ColumnKind::Text
        } else if bools && !ints && !blanks {
            ColumnKind::Boolean
        } else if ints && !blanks {
            ColumnKind::Integer
        } else if reals {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell {
        "True" | "true" | "TRUE" => Some(true),
        "False" | "false" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A parsed CSV ready for insertion.
#[derive(Debug)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    pub records: Vec<csv::StringRecord>,
}

impl CsvTable {
    pub fn parse(bytes: &[u8]) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        let kinds = (0..columns.len())
            .map(|i| ColumnKind::infer(records.iter().map(|r| r.get(i).unwrap_or(""))))
            .collect();
        Ok(Self {
            columns,
            kinds,
            records,
        })
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .zip(&self.kinds)
            .map(|(c, k)| format!("{} {}", quote_ident(c), k.sql_type()))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns.join(", ")
        )
    }

    pub fn insert_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let params: Vec<String> = (1..=self.columns.len()).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            params.join(", ")
        )
    }
}

/// The dataset table behind upload, export and retraining.
#[derive(Clone)]
pub struct DatasetStore {
    pool: PgPool,
    table: String,
}

impl DatasetStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Import a CSV: create the table if needed and insert every row inside one
    /// transaction. Any failing row rolls back the whole import.
    pub async fn import_csv(&self, bytes: &[u8]) -> Result<u64, ExoError> {
        let parsed = CsvTable::parse(bytes)?;
        if parsed.columns.is_empty() {
            return Err(ExoError::Other("CSV has no columns".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&parsed.create_table_sql(&self.table))
            .execute(&mut *tx)
            .await?;

        let insert = parsed.insert_sql(&self.table);
        let mut inserted = 0u64;
        for record in &parsed.records {
            let mut query = sqlx::query(&insert);
            for (i, kind) in parsed.kinds.iter().enumerate() {
                let cell = record.get(i).unwrap_or("");
                query = match kind {
                    ColumnKind::Integer => query.bind(non_empty(cell).and_then(|c| c.parse::<i64>().ok())),
                    ColumnKind::Real => query.bind(non_empty(cell).and_then(|c| c.parse::<f32>().ok())),
                    ColumnKind::Boolean => query.bind(non_empty(cell).and_then(parse_bool)),
                    ColumnKind::Text => query.bind(non_empty(cell).map(str::to_string)),
                };
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        tracing::info!(table = %self.table, rows = inserted, "Imported CSV into dataset table");
        Ok(inserted)
    }

    pub async fn row_count(&self) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*)::bigint FROM {}", quote_ident(&self.table));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Dump the whole table to `path` as CSV. Returns the number of rows written.
    ///
    /// The CSV is built in memory, written to a temporary sibling and renamed
    /// into place, so a failed export never leaves a truncated file behind.
    pub async fn export_csv(&self, path: &Path) -> Result<u64, ExoError> {
        let columns = self.columns().await?;
        if columns.is_empty() {
            return Err(ExoError::MissingTable(self.table.clone()));
        }

        let sql = export_select_sql(&self.table, &columns);
        let mut rows = sqlx::query(&sql).fetch(&self.pool);

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(columns.iter().map(|c| c.name.as_str()))?;
        let mut exported = 0u64;
        while let Some(row) = rows.try_next().await? {
            writer.write_record(render_row(&row)?)?;
            exported += 1;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ExoError::Io(e.into_error()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("csv.tmp");
        if let Err(e) = write_then_rename(&tmp, path, &bytes).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }

        tracing::info!(table = %self.table, rows = exported, path = %path.display(), "Exported dataset table");
        Ok(exported)
    }

    async fn columns(&self) -> Result<Vec<TableColumn>, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type)| TableColumn { name, data_type })
            .collect())
    }
}

/// A dataset table column as reported by `information_schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
}

impl TableColumn {
    /// Types decoded directly on export. Everything else (NUMERIC, DATE,
    /// TIMESTAMP, ...) is cast to text by Postgres.
    fn is_native(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "smallint" | "integer" | "bigint" | "real" | "double precision" | "boolean" | "text"
        )
    }
}

pub fn export_select_sql(table: &str, columns: &[TableColumn]) -> String {
    let select: Vec<String> = columns
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            if c.is_native() {
                ident
            } else {
                format!("{}::text AS {}", ident, ident)
            }
        })
        .collect();
    format!("SELECT {} FROM {}", select.join(", "), quote_ident(table))
}

async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp, bytes).await?;
    tokio::fs::rename(tmp, path).await
}

fn non_empty(cell: &str) -> Option<&str> {
    (!cell.is_empty()).then_some(cell)
}

fn render_row(row: &PgRow) -> Result<Vec<String>, ExoError> {
    (0..row.columns().len()).map(|i| render_cell(row, i)).collect()
}

/// NULL renders as an empty cell. A type without a decoder is an error rather
/// than a silently blank column.
fn render_cell(row: &PgRow, i: usize) -> Result<String, ExoError> {
    let column = &row.columns()[i];
    let cell = match column.type_info().name() {
        "INT2" => row.try_get::<Option<i16>, _>(i)?.map(|v| v.to_string()),
        "INT4" => row.try_get::<Option<i32>, _>(i)?.map(|v| v.to_string()),
        "INT8" => row.try_get::<Option<i64>, _>(i)?.map(|v| v.to_string()),
        "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.map(|v| v.to_string()),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(|v| v.to_string()),
        "BOOL" => row
            .try_get::<Option<bool>, _>(i)?
            .map(|v| if v { "True" } else { "False" }.to_string()),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(i)?,
        other => {
            return Err(ExoError::UnsupportedColumn {
                column: column.name().to_string(),
                type_name: other.to_string(),
            })
        }
    };
    Ok(cell.unwrap_or_default())
}
