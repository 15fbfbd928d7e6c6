//! Translation of change events into MySQL write statements.
//!
//! Inserts and updates become upserts (`INSERT ... ON DUPLICATE KEY UPDATE`),
//! deletes become a `DELETE` filtered on the primary key. Replaying an event
//! produces the same statement, so at-least-once delivery converges on the
//! same row state.
//!
//! Updates captured with `OLD_AND_NEW` values only carry the modified
//! columns. For those the translator reads the full row as of the commit
//! timestamp through a [`PointReader`], retrying with a fixed backoff before
//! giving up with [`TranslateError::StaleReadExhausted`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{SchemaCatalog, SourceColumnDef, TableMapping, TargetColumnDef};
use crate::coerce::ValueCoercer;
use crate::core::identifier::quote_mysql;
use crate::error::{PrimaryKeyGap, TranslateError};
use crate::model::{ChangeEvent, ModType};
use crate::sink::{PointReadRequest, PointReader, Row, SinkError};

/// Default number of retries after a failed point read.
pub const DEFAULT_READ_RETRIES: u32 = 3;

/// Default pause between point read attempts.
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(1);

/// Default deadline for a single point read attempt.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// What a statement does to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// Plain insert, used when the row consists only of key columns.
    Insert,
    /// Insert that updates the non-key columns on a key conflict.
    Upsert,
    Delete,
}

/// A generated write statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStatement {
    pub kind: StatementKind,
    /// MySQL table, unquoted.
    pub table: String,
    /// Column name (unquoted) and rendered literal, key columns first.
    pub columns: Vec<(String, String)>,
    pub sql: String,
}

impl fmt::Display for WriteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Retry behavior for point reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
    /// Deadline for each attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_READ_RETRIES,
            backoff: DEFAULT_READ_BACKOFF,
            attempt_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Converts change events into write statements.
#[derive(Clone)]
pub struct WriteTranslator {
    coercer: ValueCoercer,
    reader: Option<Arc<dyn PointReader>>,
    retry: RetryPolicy,
}

impl fmt::Debug for WriteTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTranslator")
            .field("coercer", &self.coercer)
            .field("has_point_reader", &self.reader.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

type Column<'a> = (&'a SourceColumnDef, &'a TargetColumnDef);

impl WriteTranslator {
    pub fn new(coercer: ValueCoercer) -> Self {
        Self {
            coercer,
            reader: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Use `reader` to rebuild full rows for partially captured updates.
    /// Without a reader, such updates are written from the captured values.
    pub fn with_point_reader(mut self, reader: Arc<dyn PointReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Translate one change event against `catalog`.
    pub async fn translate(
        &self,
        catalog: &SchemaCatalog,
        event: &ChangeEvent,
    ) -> Result<WriteStatement, TranslateError> {
        let table = catalog.resolve_table(&event.table_name).ok_or_else(|| {
            TranslateError::MissingSchemaMapping {
                table: event.table_name.clone(),
            }
        })?;
        if !table.has_primary_key() {
            return Err(self.missing_key(event, PrimaryKeyGap::NotDeclared));
        }

        let key_columns = self.key_literals(&table, event)?;

        let statement = match event.mod_type {
            ModType::Delete => build_delete(&event.table_name, table.source_table(), key_columns)?,
            ModType::Insert | ModType::Update => {
                let fetched = match (&self.reader, event.needs_full_row()) {
                    (Some(reader), true) => Some(self.read_full_row(reader.as_ref(), &table, event).await?),
                    _ => None,
                };
                let values = self.value_literals(&table, event, fetched.as_ref())?;
                build_upsert(&event.table_name, table.source_table(), key_columns, values)?
            }
        };

        debug!(
            "Translated {} on {} at {} into {:?} on {}",
            event.mod_type, event.table_name, event.commit_timestamp, statement.kind, statement.table
        );
        Ok(statement)
    }

    fn missing_key(&self, event: &ChangeEvent, gap: PrimaryKeyGap) -> TranslateError {
        TranslateError::MissingPrimaryKey {
            table: event.table_name.clone(),
            gap,
        }
    }

    /// Primary key literals in declared order, taken from the key columns and
    /// then the new values.
    fn key_literals(
        &self,
        table: &TableMapping,
        event: &ChangeEvent,
    ) -> Result<Vec<(String, String)>, TranslateError> {
        let mut literals = Vec::with_capacity(table.primary_keys().len());
        for (source, target) in key_columns(table, event)? {
            let value = event.lookup(&target.name).ok_or_else(|| {
                self.missing_key(
                    event,
                    PrimaryKeyGap::ValueAbsent {
                        column: target.name.clone(),
                    },
                )
            })?;
            literals.push((source.name.clone(), self.render(event, source, target, value)?));
        }
        Ok(literals)
    }

    /// Non-key literals in ascending column id order. Values from a point
    /// read take precedence over the captured values; columns present in
    /// neither are left out.
    fn value_literals(
        &self,
        table: &TableMapping,
        event: &ChangeEvent,
        fetched: Option<&Row>,
    ) -> Result<Vec<(String, String)>, TranslateError> {
        let mut literals = Vec::new();
        for (source, target) in table.non_key_columns() {
            let value = fetched
                .and_then(|row| row.get(&target.name))
                .or_else(|| event.lookup(&target.name));
            if let Some(value) = value {
                literals.push((source.name.clone(), self.render(event, source, target, value)?));
            }
        }
        Ok(literals)
    }

    fn render(
        &self,
        event: &ChangeEvent,
        source: &SourceColumnDef,
        target: &TargetColumnDef,
        value: &serde_json::Value,
    ) -> Result<String, TranslateError> {
        self.coercer
            .coerce(source, target, value)
            .map_err(|source| TranslateError::InvalidTypeConversion {
                table: event.table_name.clone(),
                source,
            })
    }

    async fn read_full_row(
        &self,
        reader: &dyn PointReader,
        table: &TableMapping,
        event: &ChangeEvent,
    ) -> Result<Row, TranslateError> {
        let mut key = serde_json::Map::new();
        for (_, target) in key_columns(table, event)? {
            let value = event.keys.get(&target.name).ok_or_else(|| {
                self.missing_key(
                    event,
                    PrimaryKeyGap::ValueAbsent {
                        column: target.name.clone(),
                    },
                )
            })?;
            key.insert(target.name.clone(), value.clone());
        }

        let request = PointReadRequest {
            table: event.table_name.clone(),
            key,
            columns: table
                .non_key_columns()
                .map(|(_, target)| target.name.clone())
                .collect(),
            read_timestamp: event.commit_timestamp,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.retry.attempt_timeout,
                reader.read_row(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(self.retry.attempt_timeout)),
            };

            match result {
                Ok(row) => return Ok(row),
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    warn!(
                        "Point read of {} at {} failed: {} - retry {}/{}",
                        request.table, request.read_timestamp, e, attempt, self.retry.max_retries
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => {
                    return Err(TranslateError::StaleReadExhausted {
                        table: request.table,
                        timestamp: request.read_timestamp.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

/// Both sides of every primary key column, in declared order.
fn key_columns<'a>(
    table: &'a TableMapping,
    event: &ChangeEvent,
) -> Result<Vec<Column<'a>>, TranslateError> {
    table
        .primary_keys()
        .iter()
        .map(|id| {
            table.resolve_column(id).ok_or_else(|| {
                let column = table
                    .source_column(id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| id.to_string());
                TranslateError::MissingPrimaryKey {
                    table: event.table_name.clone(),
                    gap: PrimaryKeyGap::UnmappedColumn { column },
                }
            })
        })
        .collect()
}

fn quote(event_table: &str, name: &str) -> Result<String, TranslateError> {
    quote_mysql(name).map_err(|e| TranslateError::InvalidIdentifier {
        table: event_table.to_string(),
        message: e.to_string(),
    })
}

fn build_upsert(
    event_table: &str,
    table: &str,
    keys: Vec<(String, String)>,
    values: Vec<(String, String)>,
) -> Result<WriteStatement, TranslateError> {
    let quoted_table = quote(event_table, table)?;
    let mut names = Vec::with_capacity(keys.len() + values.len());
    let mut literals = Vec::with_capacity(keys.len() + values.len());
    let mut updates = Vec::with_capacity(values.len());

    for (name, literal) in &keys {
        names.push(quote(event_table, name)?);
        literals.push(literal.as_str());
    }
    for (name, literal) in &values {
        let quoted = quote(event_table, name)?;
        updates.push(format!("{} = {}", quoted, literal));
        names.push(quoted);
        literals.push(literal.as_str());
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted_table,
        names.join(", "),
        literals.join(", ")
    );
    let kind = if updates.is_empty() {
        StatementKind::Insert
    } else {
        sql.push_str(" ON DUPLICATE KEY UPDATE ");
        sql.push_str(&updates.join(", "));
        StatementKind::Upsert
    };

    let mut columns = keys;
    columns.extend(values);
    Ok(WriteStatement {
        kind,
        table: table.to_string(),
        columns,
        sql,
    })
}

fn build_delete(
    event_table: &str,
    table: &str,
    keys: Vec<(String, String)>,
) -> Result<WriteStatement, TranslateError> {
    let filters = keys
        .iter()
        .map(|(name, literal)| Ok(format!("{} = {}", quote(event_table, name)?, literal)))
        .collect::<Result<Vec<_>, TranslateError>>()?;
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote(event_table, table)?,
        filters.join(" AND ")
    );
    Ok(WriteStatement {
        kind: StatementKind::Delete,
        table: table.to_string(),
        columns: keys,
        sql,
    })
}
