//! Generic statement building and execution over JSON rows.

mod executor;
mod query;
mod value;

pub use executor::{
    DbError, ExecOutcome, IntegrityKind, JsonRow, MySqlExecutor, PgExecutor, QueryResult, RowExecutor,
    mysql_json_wrap, pg_json_wrap,
};
pub use query::{
    DEFAULT_ROW_CAP, MAX_BATCH_ROWS, Operation, OperationKind, Output, QueryBuilder, QueryPlan, Record,
    SortOrder, Statement,
};
pub use value::SqlValue;
