//! Stored procedure execution against target databases.
//!
//! Procedures are set-returning PostgreSQL functions called with named-argument
//! notation:
//!
//! ```sql
//! SELECT * FROM uspGetCustomers(region => $1::text, max_rows => $2::integer)
//! ```
//!
//! Procedure and parameter names are validated as SQL identifiers before they
//! are placed in the statement; values are always bound. A leading `dbo.`
//! schema is dropped so names carried over from older clients resolve through
//! the default search path.
//!
//! # Parameter Types
//!
//! Before each call the procedure's declared argument types are read from
//! `pg_proc`. Values for declared parameters are bound as text and cast to the
//! declared type, so `"02134"` reaches a `text` parameter unchanged and `2`
//! reaches an `integer` one. Names the catalog does not declare are bound by
//! their JSON type and left for the server to reject.
//!
//! # Result Normalization
//!
//! Rows are returned as JSON objects keyed by column name. Date and time
//! columns become ISO-8601 strings (`2025-01-15T10:30:00.000Z`). Columns of
//! any other type without a native mapping (`numeric`, arrays, enums, ...) are
//! selected through `to_jsonb`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{
    Column, Executor as _, PgPool, Postgres, Row, Statement as _, Type, TypeInfo,
    postgres::{PgArguments, PgRow, PgTypeInfo},
    query::Query,
};
use uuid::Uuid;

use crate::{
    error::AppError,
    services::pool_registry::{ConnectionSpec, PoolRegistry},
};

/// A procedure invocation with its merged parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    pub procedure: String,
    pub params: Map<String, Value>,
}

#[async_trait]
pub trait ProcedureRunner: Send + Sync {
    /// Run `call` on the database described by `spec` and return its rows.
    async fn execute(
        &self,
        spec: &ConnectionSpec,
        call: &ProcedureCall,
    ) -> Result<Vec<Value>, AppError>;
}

/// [`ProcedureRunner`] for PostgreSQL targets using pooled connections.
#[derive(Debug, Clone)]
pub struct PgProcedureExecutor {
    registry: Arc<PoolRegistry>,
    timeout: Duration,
}

impl PgProcedureExecutor {
    pub fn new(registry: Arc<PoolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }
}

#[async_trait]
impl ProcedureRunner for PgProcedureExecutor {
    async fn execute(
        &self,
        spec: &ConnectionSpec,
        call: &ProcedureCall,
    ) -> Result<Vec<Value>, AppError> {
        let name = ProcedureName::parse(&call.procedure)?;
        for param in call.params.keys() {
            parameter_name(param)?;
        }

        // Released when this function returns, whichever way it returns
        let lease = self.registry.acquire(spec);

        let rows = tokio::time::timeout(self.timeout, run_procedure(&lease, name, &call.params))
            .await
            .map_err(|_| AppError::UpstreamFailure {
                message: format!(
                    "Procedure '{}' timed out after {}s",
                    call.procedure,
                    self.timeout.as_secs()
                ),
                code: None,
            })??;

        rows.iter()
            .map(|row| row_to_json(row).map(Value::Object))
            .collect::<Result<Vec<_>, _>>()
            .map_err(upstream_error)
    }
}

/// Input parameters of every visible function with the given name.
const SIGNATURE_SQL: &str = r#"
SELECT a.name, format_type(a.type_oid, NULL)
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
CROSS JOIN LATERAL unnest(
    coalesce(p.proallargtypes, p.proargtypes::oid[]),
    p.proargnames,
    coalesce(p.proargmodes, array_fill('i'::"char", ARRAY[p.pronargs::int]))
) AS a(type_oid, name, mode)
WHERE p.proname = lower($1)
  AND CASE WHEN $2::text IS NULL THEN pg_function_is_visible(p.oid)
           ELSE n.nspname = lower($2) END
  AND a.mode IN ('i', 'b', 'v')
  AND a.name <> ''
"#;

async fn run_procedure(
    pool: &PgPool,
    name: ProcedureName<'_>,
    params: &Map<String, Value>,
) -> Result<Vec<PgRow>, AppError> {
    let declared: Vec<(String, String)> = sqlx::query_as(SIGNATURE_SQL)
        .bind(name.procedure)
        .bind(name.schema)
        .fetch_all(pool)
        .await
        .map_err(upstream_error)?;

    let statement = build_statement(name, params, &Signature::from_declared(declared))?;

    // Prepared with the bind types so the cached statement matches the execution below
    let columns: Vec<(String, String)> = {
        let types: Vec<PgTypeInfo> = statement.binds.iter().map(BindValue::type_info).collect();
        let prepared = pool
            .prepare_with(&statement.sql, &types)
            .await
            .map_err(upstream_error)?;
        prepared
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.type_info().name().to_string()))
            .collect()
    };

    let sql = normalize_columns(&statement.sql, &columns).unwrap_or(statement.sql);

    let mut query = sqlx::query(&sql);
    for value in statement.binds {
        query = value.bind_to(query);
    }
    query.fetch_all(pool).await.map_err(upstream_error)
}

/// Declared input parameter types of a procedure, keyed by lowercase name.
#[derive(Debug, Default, Clone, PartialEq)]
struct Signature {
    types: HashMap<String, String>,
}

impl Signature {
    /// Build from `(name, type)` pairs across all overloads. A name that
    /// overloads declare with different types is left untyped.
    fn from_declared<I>(declared: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut types = HashMap::new();
        let mut conflicting = HashSet::new();

        for (name, type_name) in declared {
            let name = name.to_lowercase();
            match types.get(&name) {
                Some(existing) if *existing != type_name => {
                    conflicting.insert(name);
                }
                Some(_) => {}
                None => {
                    types.insert(name, type_name);
                }
            }
        }
        for name in conflicting {
            types.remove(&name);
        }

        Self { types }
    }

    fn declared(&self, name: &str) -> Option<&str> {
        self.types.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// A value ready to bind.
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl BindValue {
    /// `None` for JSON null, which is written into the statement as `NULL`.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(BindValue::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => BindValue::Int(i),
                None => BindValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Value::String(s) => Some(BindValue::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(BindValue::Json(value.clone())),
        }
    }

    /// Text form of a non-null `value` for a parameter declared as `declared`.
    fn declared_text(value: &Value, declared: &str) -> Self {
        BindValue::Text(match value {
            Value::String(s) => s.clone(),
            Value::Array(items) if declared.ends_with("[]") => array_literal(items),
            other => other.to_string(),
        })
    }

    fn type_info(&self) -> PgTypeInfo {
        match self {
            BindValue::Bool(_) => <bool as Type<Postgres>>::type_info(),
            BindValue::Int(_) => <i64 as Type<Postgres>>::type_info(),
            BindValue::Float(_) => <f64 as Type<Postgres>>::type_info(),
            BindValue::Text(_) => <String as Type<Postgres>>::type_info(),
            BindValue::Json(_) => <sqlx::types::Json<Value> as Type<Postgres>>::type_info(),
        }
    }

    fn bind_to<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            BindValue::Bool(v) => query.bind(v),
            BindValue::Int(v) => query.bind(v),
            BindValue::Float(v) => query.bind(v),
            BindValue::Text(v) => query.bind(v),
            BindValue::Json(v) => query.bind(sqlx::types::Json(v)),
        }
    }
}

/// PostgreSQL array literal for a JSON array: `["a", 1, null]` → `{"a","1",NULL}`.
fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            Value::String(s) => quote_element(s),
            other => quote_element(&other.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_element(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

#[derive(Debug, PartialEq)]
struct CallStatement {
    sql: String,
    binds: Vec<BindValue>,
}

fn build_statement(
    procedure: ProcedureName<'_>,
    params: &Map<String, Value>,
    signature: &Signature,
) -> Result<CallStatement, AppError> {
    let mut args = Vec::with_capacity(params.len());
    let mut binds = Vec::with_capacity(params.len());

    for (name, value) in params {
        let name = parameter_name(name)?;
        let declared = signature.declared(name);

        match (value, declared) {
            (Value::Null, Some(type_name)) => args.push(format!("{name} => NULL::{type_name}")),
            (Value::Null, None) => args.push(format!("{name} => NULL")),
            (value, Some(type_name)) => {
                binds.push(BindValue::declared_text(value, type_name));
                args.push(format!("{name} => ${}::{type_name}", binds.len()));
            }
            (value, None) => {
                if let Some(bind) = BindValue::from_json(value) {
                    binds.push(bind);
                    args.push(format!("{name} => ${}", binds.len()));
                }
            }
        }
    }

    Ok(CallStatement {
        sql: format!("SELECT * FROM {}({})", procedure.qualified(), args.join(", ")),
        binds,
    })
}

/// Wrap `sql` so columns without a native decoder come back as `jsonb`.
///
/// `None` when every column already decodes natively.
fn normalize_columns(sql: &str, columns: &[(String, String)]) -> Option<String> {
    if columns.iter().all(|(_, type_name)| decodes_natively(type_name)) {
        return None;
    }

    let select: Vec<String> = columns
        .iter()
        .map(|(name, type_name)| {
            let column = quote_identifier(name);
            if decodes_natively(type_name) {
                format!("r.{column}")
            } else {
                format!("to_jsonb(r.{column}) AS {column}")
            }
        })
        .collect();

    Some(format!("SELECT {} FROM ({sql}) AS r", select.join(", ")))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

/// A validated `procedure` or `schema.procedure` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcedureName<'a> {
    schema: Option<&'a str>,
    procedure: &'a str,
}

impl<'a> ProcedureName<'a> {
    /// Validate `name`, dropping a `dbo.` schema.
    fn parse(name: &'a str) -> Result<Self, AppError> {
        let invalid = || AppError::MalformedRequest(format!("Invalid procedure name '{name}'"));

        let parsed = match name.split('.').collect::<Vec<_>>().as_slice() {
            [schema, procedure] if schema.eq_ignore_ascii_case("dbo") => Self {
                schema: None,
                procedure: *procedure,
            },
            [procedure] => Self {
                schema: None,
                procedure: *procedure,
            },
            [schema, procedure] => Self {
                schema: Some(*schema),
                procedure: *procedure,
            },
            _ => return Err(invalid()),
        };

        if parsed.schema.is_none_or(is_identifier) && is_identifier(parsed.procedure) {
            Ok(parsed)
        } else {
            Err(invalid())
        }
    }

    fn qualified(&self) -> String {
        match self.schema {
            Some(schema) => format!("{schema}.{}", self.procedure),
            None => self.procedure.to_string(),
        }
    }
}

/// Validate a parameter name, accepting an optional leading `@`.
fn parameter_name(name: &str) -> Result<&str, AppError> {
    let bare = name.strip_prefix('@').unwrap_or(name);
    if is_identifier(bare) {
        Ok(bare)
    } else {
        Err(AppError::MalformedRequest(format!(
            "Invalid parameter name '{name}'"
        )))
    }
}

/// Merge query string and JSON body parameters; the body wins on collisions.
///
/// Query string values stay strings; the procedure signature decides their
/// type. Body values keep their JSON types. An empty body contributes nothing.
///
/// # Errors
///
/// `MalformedRequest` when the body is not a JSON object.
pub fn merge_params(query: Option<&str>, body: &[u8]) -> Result<Map<String, Value>, AppError> {
    let mut params = Map::new();

    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(name.into_owned(), Value::String(value.into_owned()));
        }
    }

    if body.iter().any(|b| !b.is_ascii_whitespace()) {
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedRequest(format!("Invalid JSON body: {e}")))?;
        match body {
            Value::Object(fields) => params.extend(fields),
            _ => {
                return Err(AppError::MalformedRequest(
                    "Request body must be a JSON object".to_string(),
                ));
            }
        }
    }

    Ok(params)
}

fn upstream_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) => AppError::UpstreamFailure {
            message: db.message().to_string(),
            code: db.code().map(|c| c.into_owned()),
        },
        _ => AppError::UpstreamFailure {
            message: err.to_string(),
            code: None,
        },
    }
}

pub fn iso_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_json(row: &PgRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())?;
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}

fn decodes_natively(type_name: &str) -> bool {
    matches!(
        type_name,
        "BOOL"
            | "INT2"
            | "INT4"
            | "INT8"
            | "FLOAT4"
            | "FLOAT8"
            | "TEXT"
            | "VARCHAR"
            | "BPCHAR"
            | "CHAR"
            | "NAME"
            | "UUID"
            | "JSON"
            | "JSONB"
            | "TIMESTAMPTZ"
            | "TIMESTAMP"
            | "DATE"
            | "TIME"
    )
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| Value::from(f64::from(v))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::from),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(index)?.map(Value::from)
        }
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index)?,
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| Value::from(iso_timestamp(v))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| Value::from(iso_timestamp(v.and_utc()))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|v| Value::from(iso_timestamp(v.and_time(NaiveTime::MIN).and_utc()))),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|v| Value::from(v.format("%H:%M:%S%.3f").to_string())),
        other => match row.try_get::<Option<String>, _>(index) {
            Ok(v) => v.map(Value::from),
            Err(_) => {
                tracing::warn!(column = index, type_name = other, "Unsupported column type, returning null");
                None
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}
