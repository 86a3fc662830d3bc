use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::{Arguments, MySqlPool, PgPool};
use thiserror::Error;

use super::query::{Output, QueryPlan, Statement};
use super::value::SqlValue;
use crate::dialect::{CanonicalType, Dialect};

pub type JsonRow = Map<String, Value>;

#[derive(Debug)]
pub enum IntegrityKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Exclusion,
    Other(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("integrity violation: {message}")]
    Integrity {
        kind: IntegrityKind,
        constraint: Option<String>,
        message: String,
    },
    #[error("record not found")]
    DoesNotExist,
    #[error("temporary database failure: {0}")]
    Temporary(String),
    #[error("bad value: {0}")]
    Bind(String),
    #[error("unreadable result: {0}")]
    Decode(String),
    #[error("unhandled db error: {0}")]
    Fatal(String),
}

impl DbError {
    pub const fn code(&self) -> &'static str {
        match self {
            DbError::Integrity { .. } => "integrity_violation",
            DbError::DoesNotExist => "not_found",
            DbError::Temporary(_) => "temporary_error",
            DbError::Bind(_) => "bind_error",
            DbError::Decode(_) => "decode_error",
            DbError::Fatal(_) => "fatal_error",
        }
    }
}

fn integrity_kind(code: &str) -> IntegrityKind {
    match code {
        "23505" => IntegrityKind::Unique,
        "23503" => IntegrityKind::ForeignKey,
        "23514" => IntegrityKind::Check,
        "23502" => IntegrityKind::NotNull,
        "23P01" => IntegrityKind::Exclusion,
        c => IntegrityKind::Other(c.to_string()),
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => DbError::DoesNotExist,
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                if code.starts_with("23") {
                    DbError::Integrity {
                        kind: integrity_kind(&code),
                        constraint: db.constraint().map(|s| s.to_owned()),
                        message: db.message().to_string(),
                    }
                } else if code.starts_with("22") {
                    DbError::Bind(db.message().to_string())
                } else {
                    DbError::Fatal(e.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DbError::Temporary(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => DbError::Decode(e.to_string()),
            _ => DbError::Fatal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// Result of running a [`QueryPlan`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Rows(Vec<JsonRow>),
    Row(Option<JsonRow>),
    Count(u64),
    Affected(ExecOutcome),
}

/// Runs built statements against one datasource and returns rows as JSON.
#[async_trait]
pub trait RowExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn fetch(&self, stmt: &Statement) -> Result<Vec<JsonRow>, DbError>;

    /// Runs every statement; more than one runs inside a single transaction.
    async fn execute(&self, stmts: &[Statement]) -> Result<ExecOutcome, DbError>;

    async fn run(&self, plan: &QueryPlan) -> Result<QueryResult, DbError> {
        match plan.output {
            Output::Rows => {
                let stmt = first(plan)?;
                Ok(QueryResult::Rows(self.fetch(stmt).await?))
            }
            Output::Row => {
                let stmt = first(plan)?;
                Ok(QueryResult::Row(self.fetch(stmt).await?.into_iter().next()))
            }
            Output::Count => {
                let stmt = first(plan)?;
                let rows = self.fetch(stmt).await?;
                let total = rows
                    .first()
                    .and_then(|r| r.get("total"))
                    .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                    .unwrap_or(0);
                Ok(QueryResult::Count(total))
            }
            Output::Affected => Ok(QueryResult::Affected(self.execute(&plan.statements).await?)),
        }
    }
}

fn first(plan: &QueryPlan) -> Result<&Statement, DbError> {
    plan.statements
        .first()
        .ok_or_else(|| DbError::Fatal(format!("{} plan has no statement", plan.kind)))
}

fn json_array(value: Value) -> Result<Vec<JsonRow>, DbError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(DbError::Decode(format!("expected JSON object row, got {}", other))),
            })
            .collect(),
        other => Err(DbError::Decode(format!("expected JSON array, got {}", other))),
    }
}

fn pg_arguments(params: &[SqlValue]) -> Result<PgArguments, DbError> {
    let mut args = PgArguments::default();
    for p in params {
        let res = match p {
            SqlValue::Null(kind) => match kind {
                CanonicalType::Int | CanonicalType::Long => args.add(None::<i64>),
                CanonicalType::Float => args.add(None::<f64>),
                CanonicalType::Bool => args.add(None::<bool>),
                CanonicalType::Bytes => args.add(None::<Vec<u8>>),
                _ => args.add(None::<String>),
            },
            SqlValue::Bool(b) => args.add(*b),
            SqlValue::Int(i) => args.add(*i),
            SqlValue::Float(f) => args.add(*f),
            SqlValue::Text(s) => args.add(s.clone()),
            SqlValue::Bytes(b) => args.add(b.clone()),
        };
        res.map_err(|e| DbError::Bind(e.to_string()))?;
    }
    Ok(args)
}

fn mysql_arguments(params: &[SqlValue]) -> Result<MySqlArguments, DbError> {
    let mut args = MySqlArguments::default();
    for p in params {
        let res = match p {
            SqlValue::Null(kind) => match kind {
                CanonicalType::Int | CanonicalType::Long => args.add(None::<i64>),
                CanonicalType::Float => args.add(None::<f64>),
                CanonicalType::Bool => args.add(None::<bool>),
                CanonicalType::Bytes => args.add(None::<Vec<u8>>),
                _ => args.add(None::<String>),
            },
            SqlValue::Bool(b) => args.add(*b),
            SqlValue::Int(i) => args.add(*i),
            SqlValue::Float(f) => args.add(*f),
            SqlValue::Text(s) => args.add(s.clone()),
            SqlValue::Bytes(b) => args.add(b.clone()),
        };
        res.map_err(|e| DbError::Bind(e.to_string()))?;
    }
    Ok(args)
}

/// Postgres rows come back through a `JSONB_AGG` over a CTE, so `INSERT ...
/// RETURNING` works the same way as `SELECT`.
pub fn pg_json_wrap(sql: &str) -> String {
    format!(
        "WITH jql AS ({}) SELECT COALESCE(JSONB_AGG(jql), '[]'::jsonb) FROM jql",
        sql
    )
}

/// MySQL has no row-to-json, so the object is spelled out from the known columns.
pub fn mysql_json_wrap(stmt: &Statement) -> String {
    let dialect = Dialect::MySql;
    let pairs: Vec<String> = stmt
        .columns
        .iter()
        .map(|c| format!("{}, jql.{}", dialect.quote_literal(c), dialect.quote_ident(c)))
        .collect();
    format!(
        "SELECT CAST(COALESCE(JSON_ARRAYAGG(JSON_OBJECT({})), JSON_ARRAY()) AS CHAR) FROM ({}) jql",
        pairs.join(", "),
        stmt.sql
    )
}

pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowExecutor for PgExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn fetch(&self, stmt: &Statement) -> Result<Vec<JsonRow>, DbError> {
        let args = pg_arguments(&stmt.params)?;
        let wrapped = pg_json_wrap(&stmt.sql);
        let result: Value = sqlx::query_scalar_with(&wrapped, args)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        json_array(result)
    }

    async fn execute(&self, stmts: &[Statement]) -> Result<ExecOutcome, DbError> {
        if let [stmt] = stmts {
            let args = pg_arguments(&stmt.params)?;
            let res = sqlx::query_with(&stmt.sql, args)
                .execute(&self.pool)
                .await
                .map_err(DbError::from)?;
            return Ok(ExecOutcome {
                rows_affected: res.rows_affected(),
                last_insert_id: None,
            });
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut outcome = ExecOutcome::default();
        for stmt in stmts {
            let args = pg_arguments(&stmt.params)?;
            let res = sqlx::query_with(&stmt.sql, args)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
            outcome.rows_affected += res.rows_affected();
        }
        tx.commit().await.map_err(DbError::from)?;
        Ok(outcome)
    }
}

pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowExecutor for MySqlExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn fetch(&self, stmt: &Statement) -> Result<Vec<JsonRow>, DbError> {
        let args = mysql_arguments(&stmt.params)?;
        let wrapped = mysql_json_wrap(stmt);
        let raw: Option<String> = sqlx::query_scalar_with(&wrapped, args)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        let value: Value = match raw {
            Some(text) => serde_json::from_str(&text).map_err(|e| DbError::Decode(e.to_string()))?,
            None => Value::Array(Vec::new()),
        };
        json_array(value)
    }

    async fn execute(&self, stmts: &[Statement]) -> Result<ExecOutcome, DbError> {
        if let [stmt] = stmts {
            let args = mysql_arguments(&stmt.params)?;
            let res = sqlx::query_with(&stmt.sql, args)
                .execute(&self.pool)
                .await
                .map_err(DbError::from)?;
            return Ok(ExecOutcome {
                rows_affected: res.rows_affected(),
                last_insert_id: Some(res.last_insert_id()).filter(|id| *id > 0),
            });
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut outcome = ExecOutcome::default();
        for stmt in stmts {
            let args = mysql_arguments(&stmt.params)?;
            let res = sqlx::query_with(&stmt.sql, args)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
            outcome.rows_affected += res.rows_affected();
        }
        tx.commit().await.map_err(DbError::from)?;
        Ok(outcome)
    }
}
