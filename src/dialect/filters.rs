//! Filter predicates and their per-dialect SQL strategies.
//!
//! Each dialect owns a static `operator -> strategy` table. A lookup that is
//! missing from both the dialect table and the shared table is reported as
//! [`DbError::Unsupported`].

use std::fmt;

use serde_json::Value as JsonValue;

use super::{Dialect, SqlWriter};
use crate::error::{DbError, Result};
use crate::value::Value;

/// Filter operator, named after its caller-level lookup suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Exact,
    Not,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    IsNull,
    NotIsNull,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IExact,
    Search,
    Regex,
    JsonContains,
    JsonContainedBy,
    JsonFilter,
}

const LOOKUPS: &[(Operator, &str)] = &[
    (Operator::Exact, "exact"),
    (Operator::Not, "not"),
    (Operator::Gt, "gt"),
    (Operator::Gte, "gte"),
    (Operator::Lt, "lt"),
    (Operator::Lte, "lte"),
    (Operator::In, "in"),
    (Operator::NotIn, "not_in"),
    (Operator::IsNull, "isnull"),
    (Operator::NotIsNull, "not_isnull"),
    (Operator::Contains, "contains"),
    (Operator::IContains, "icontains"),
    (Operator::StartsWith, "startswith"),
    (Operator::IStartsWith, "istartswith"),
    (Operator::EndsWith, "endswith"),
    (Operator::IEndsWith, "iendswith"),
    (Operator::IExact, "iexact"),
    (Operator::Search, "search"),
    (Operator::Regex, "regex"),
    (Operator::JsonContains, "json_contains"),
    (Operator::JsonContainedBy, "json_contained_by"),
    (Operator::JsonFilter, "json_filter"),
];

impl Operator {
    /// Caller-level lookup suffix (`icontains`, `gte`, ...).
    pub fn lookup_name(self) -> &'static str {
        LOOKUPS
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, name)| *name)
            .unwrap_or("exact")
    }

    pub fn from_lookup(name: &str) -> Option<Self> {
        LOOKUPS.iter().find(|(_, n)| *n == name).map(|(op, _)| *op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lookup_name())
    }
}

/// Right-hand side of a criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
    /// JSON key path and the value expected at that path.
    Path(Vec<String>, Value),
    None,
}

macro_rules! operand_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Operand {
            fn from(v: $t) -> Self {
                Operand::Value(v.into())
            }
        })*
    };
}

operand_from!(Value, bool, i32, i64, f64, &str, String);

/// A single filter predicate prior to SQL generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    pub operand: Operand,
}

impl Criterion {
    pub fn new(field: &str, operator: Operator, operand: impl Into<Operand>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            operand: operand.into(),
        }
    }

    /// Parse caller-level filter syntax such as `name__icontains`.
    ///
    /// A name without a recognised lookup suffix is an exact match on the
    /// whole name.
    pub fn parse(key: &str, operand: impl Into<Operand>) -> Self {
        let (field, operator) = match key.rsplit_once("__") {
            Some((field, suffix)) => match Operator::from_lookup(suffix) {
                Some(op) => (field, op),
                None => (key, Operator::Exact),
            },
            None => (key, Operator::Exact),
        };
        Self::new(field, operator, operand)
    }

    /// The filter in caller-level syntax, for diagnostics.
    pub fn describe(&self) -> String {
        match self.operator {
            Operator::Exact => self.field.clone(),
            op => format!("{}__{}", self.field, op.lookup_name()),
        }
    }

    fn value(&self) -> Result<&Value> {
        match &self.operand {
            Operand::Value(v) => Ok(v),
            _ => Err(self.bad_operand("a single value")),
        }
    }

    fn list(&self) -> Result<&[Value]> {
        match &self.operand {
            Operand::List(values) => Ok(values),
            _ => Err(self.bad_operand("a list of values")),
        }
    }

    fn path(&self) -> Result<(&[String], &Value)> {
        match &self.operand {
            Operand::Path(path, value) if !path.is_empty() => Ok((path, value)),
            _ => Err(self.bad_operand("a non-empty key path and a value")),
        }
    }

    fn flag(&self) -> Result<bool> {
        match &self.operand {
            Operand::Value(Value::Bool(b)) => Ok(*b),
            _ => Err(self.bad_operand("a boolean")),
        }
    }

    fn pattern(&self) -> Result<String> {
        match self.value()? {
            Value::Null => Err(self.bad_operand("a non-null value")),
            v => Ok(v.to_text()),
        }
    }

    fn bad_operand(&self, expected: &str) -> DbError {
        DbError::ConfigError(format!("filter {} expects {}", self.describe(), expected))
    }
}

/// Escape `\`, `%` and `_` so a value matches literally inside LIKE.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape `[`, `*` and `?` so a value matches literally inside GLOB.
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '[' => out.push_str("[[]"),
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            c => out.push(c),
        }
    }
    out
}

type FilterFn = fn(&mut SqlWriter, &Criterion) -> Result<()>;

/// Strategies every dialect shares.
static COMMON: &[(Operator, FilterFn)] = &[
    (Operator::Exact, exact),
    (Operator::Not, not),
    (Operator::Gt, gt),
    (Operator::Gte, gte),
    (Operator::Lt, lt),
    (Operator::Lte, lte),
    (Operator::In, in_list),
    (Operator::NotIn, not_in_list),
    (Operator::IsNull, is_null),
    (Operator::NotIsNull, not_is_null),
];

static POSTGRES: &[(Operator, FilterFn)] = &[
    (Operator::Contains, pg::contains),
    (Operator::IContains, pg::icontains),
    (Operator::StartsWith, pg::starts_with),
    (Operator::IStartsWith, pg::istarts_with),
    (Operator::EndsWith, pg::ends_with),
    (Operator::IEndsWith, pg::iends_with),
    (Operator::IExact, iexact),
    (Operator::Search, pg::search),
    (Operator::Regex, pg::regex),
    (Operator::JsonContains, pg::json_contains),
    (Operator::JsonContainedBy, pg::json_contained_by),
    (Operator::JsonFilter, pg::json_filter),
];

static MYSQL: &[(Operator, FilterFn)] = &[
    (Operator::Contains, mysql::contains),
    (Operator::IContains, mysql::icontains),
    (Operator::StartsWith, mysql::starts_with),
    (Operator::IStartsWith, mysql::istarts_with),
    (Operator::EndsWith, mysql::ends_with),
    (Operator::IEndsWith, mysql::iends_with),
    (Operator::IExact, iexact),
    (Operator::Search, mysql::search),
    (Operator::Regex, mysql::regex),
    (Operator::JsonContains, mysql::json_contains),
    (Operator::JsonContainedBy, mysql::json_contained_by),
    (Operator::JsonFilter, mysql::json_filter),
];

static SQLITE: &[(Operator, FilterFn)] = &[
    (Operator::Contains, sqlite::contains),
    (Operator::IContains, sqlite::icontains),
    (Operator::StartsWith, sqlite::starts_with),
    (Operator::IStartsWith, sqlite::istarts_with),
    (Operator::EndsWith, sqlite::ends_with),
    (Operator::IEndsWith, sqlite::iends_with),
    (Operator::IExact, iexact),
    (Operator::Search, sqlite::search),
    (Operator::Regex, sqlite::regex),
    (Operator::JsonFilter, sqlite::json_filter),
];

fn strategy(dialect: Dialect, operator: Operator) -> Option<FilterFn> {
    let table = match dialect {
        Dialect::Postgres => POSTGRES,
        Dialect::MySql => MYSQL,
        Dialect::Sqlite => SQLITE,
    };
    table
        .iter()
        .chain(COMMON.iter())
        .find(|(op, _)| *op == operator)
        .map(|(_, f)| *f)
}

/// Write one criterion as a predicate.
pub fn write_criterion(w: &mut SqlWriter, criterion: &Criterion) -> Result<()> {
    match strategy(w.dialect(), criterion.operator) {
        Some(f) => f(w, criterion),
        None => Err(DbError::Unsupported(format!(
            "filter {} is not supported by the {} dialect",
            criterion.describe(),
            w.dialect().name()
        ))),
    }
}

/// Write criteria joined with `AND`. Writes nothing for an empty slice.
pub fn write_filters(w: &mut SqlWriter, criteria: &[Criterion]) -> Result<()> {
    for (i, criterion) in criteria.iter().enumerate() {
        if i > 0 {
            w.push(" AND ");
        }
        write_criterion(w, criterion)?;
    }
    Ok(())
}

/// Compile criteria into a standalone predicate and its parameters.
pub fn compile_filters(dialect: Dialect, criteria: &[Criterion]) -> Result<(String, Vec<Value>)> {
    let mut w = SqlWriter::new(dialect);
    write_filters(&mut w, criteria)?;
    Ok(w.finish())
}

fn compare(w: &mut SqlWriter, c: &Criterion, op: &str) -> Result<()> {
    let value = c.value()?.clone();
    w.push_identifier(&c.field).push(" ").push(op).push(" ").bind(value);
    Ok(())
}

fn exact(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    if c.value()?.is_null() {
        w.push_identifier(&c.field).push(" IS NULL");
        return Ok(());
    }
    compare(w, c, "=")
}

fn not(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let value = c.value()?.clone();
    if value.is_null() {
        w.push_identifier(&c.field).push(" IS NOT NULL");
        return Ok(());
    }
    // NULL <> x is NULL, so NULL rows need their own arm
    w.push("(").push_identifier(&c.field).push(" <> ").bind(value);
    w.push(" OR ").push_identifier(&c.field).push(" IS NULL)");
    Ok(())
}

fn gt(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    compare(w, c, ">")
}

fn gte(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    compare(w, c, ">=")
}

fn lt(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    compare(w, c, "<")
}

fn lte(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    compare(w, c, "<=")
}

fn write_list(w: &mut SqlWriter, values: &[Value]) {
    w.push("(");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.bind(value.clone());
    }
    w.push(")");
}

fn in_list(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let values = c.list()?;
    if values.is_empty() {
        w.push("1 = 0");
        return Ok(());
    }
    w.push_identifier(&c.field).push(" IN ");
    write_list(w, values);
    Ok(())
}

fn not_in_list(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let values = c.list()?;
    if values.is_empty() {
        w.push("1 = 1");
        return Ok(());
    }
    w.push("(").push_identifier(&c.field).push(" NOT IN ");
    write_list(w, values);
    w.push(" OR ").push_identifier(&c.field).push(" IS NULL)");
    Ok(())
}

fn is_null(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let suffix = if c.flag()? { " IS NULL" } else { " IS NOT NULL" };
    w.push_identifier(&c.field).push(suffix);
    Ok(())
}

fn not_is_null(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let suffix = if c.flag()? { " IS NOT NULL" } else { " IS NULL" };
    w.push_identifier(&c.field).push(suffix);
    Ok(())
}

/// `CAST(field AS TEXT)`, or `AS CHAR` on MySQL.
fn push_text_cast(w: &mut SqlWriter, field: &str) {
    let target = match w.dialect() {
        Dialect::MySql => "CHAR",
        Dialect::Postgres | Dialect::Sqlite => "TEXT",
    };
    w.push("CAST(").push_identifier(field).push(" AS ").push(target).push(")");
}

fn upper_text(w: &mut SqlWriter, field: &str) {
    w.push("UPPER(");
    push_text_cast(w, field);
    w.push(")");
}

fn iexact(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
    let value = c.pattern()?;
    upper_text(w, &c.field);
    w.push(" = UPPER(").bind(Value::Text(value)).push(")");
    Ok(())
}

/// Where the wildcard goes around an escaped value.
#[derive(Clone, Copy)]
enum Anchor {
    Contains,
    Start,
    End,
}

fn wrap(escaped: String, anchor: Anchor, wildcard: char) -> String {
    match anchor {
        Anchor::Contains => format!("{wildcard}{escaped}{wildcard}"),
        Anchor::Start => format!("{escaped}{wildcard}"),
        Anchor::End => format!("{wildcard}{escaped}"),
    }
}

fn like_pattern(c: &Criterion, anchor: Anchor) -> Result<Value> {
    Ok(Value::Text(wrap(escape_like(&c.pattern()?), anchor, '%')))
}

/// Convert a bound value to JSON for structural comparison.
fn to_json(c: &Criterion, value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| c.bad_operand("a finite number"))?,
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Json(j) => j.clone(),
        Value::Bytes(_) => {
            return Err(DbError::Unsupported(format!(
                "filter {} cannot compare binary values as JSON",
                c.describe()
            )))
        }
    })
}

fn encoded_json(c: &Criterion) -> Result<Value> {
    Ok(Value::Text(to_json(c, c.value()?)?.to_string()))
}

/// Text form of a JSON scalar, as `->>`-style extraction returns it.
fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `$.a.b[0]` style path shared by MySQL and SQLite.
fn json_path(path: &[String]) -> String {
    let mut out = String::from("$");
    for segment in path {
        if !segment.is_empty() && segment.chars().all(|ch| ch.is_ascii_digit()) {
            out.push('[');
            out.push_str(segment);
            out.push(']');
        } else if !segment.is_empty()
            && !segment.starts_with(|ch: char| ch.is_ascii_digit())
            && segment.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            out.push('.');
            out.push_str(segment);
        } else {
            out.push_str(".\"");
            out.push_str(&segment.replace('"', "\\\""));
            out.push('"');
        }
    }
    out
}

mod pg {
    use super::*;

    fn like(w: &mut SqlWriter, c: &Criterion, anchor: Anchor, op: &str) -> Result<()> {
        let pattern = like_pattern(c, anchor)?;
        push_text_cast(w, &c.field);
        w.push(" ").push(op).push(" ").bind(pattern).push(" ESCAPE '\\'");
        Ok(())
    }

    fn upper_like(w: &mut SqlWriter, c: &Criterion, anchor: Anchor) -> Result<()> {
        let pattern = like_pattern(c, anchor)?;
        upper_text(w, &c.field);
        w.push(" LIKE UPPER(").bind(pattern).push(") ESCAPE '\\'");
        Ok(())
    }

    pub(super) fn contains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::Contains, "LIKE")
    }

    pub(super) fn icontains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::Contains, "ILIKE")
    }

    pub(super) fn starts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::Start, "LIKE")
    }

    pub(super) fn istarts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::Start)
    }

    pub(super) fn ends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::End, "LIKE")
    }

    pub(super) fn iends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::End)
    }

    pub(super) fn search(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let query = c.pattern()?;
        w.push("to_tsvector(");
        push_text_cast(w, &c.field);
        w.push(") @@ plainto_tsquery(").bind(Value::Text(query)).push(")");
        Ok(())
    }

    pub(super) fn regex(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let pattern = c.pattern()?;
        push_text_cast(w, &c.field);
        w.push(" ~ ").bind(Value::Text(pattern));
        Ok(())
    }

    pub(super) fn json_contains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let encoded = encoded_json(c)?;
        w.push_identifier(&c.field).push(" @> ").bind(encoded).push("::jsonb");
        Ok(())
    }

    pub(super) fn json_contained_by(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let encoded = encoded_json(c)?;
        w.push_identifier(&c.field).push(" <@ ").bind(encoded).push("::jsonb");
        Ok(())
    }

    /// `{"a","b"}` text[] literal.
    fn path_array(path: &[String]) -> String {
        let items: Vec<String> = path
            .iter()
            .map(|s| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", items.join(","))
    }

    pub(super) fn json_filter(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let (path, value) = c.path()?;
        let expected = to_json(c, value)?;
        w.push_identifier(&c.field)
            .push(" #>> ")
            .bind(Value::Text(path_array(path)))
            .push("::text[]");
        if expected.is_null() {
            w.push(" IS NULL");
        } else {
            w.push(" = ").bind(Value::Text(json_text(&expected)));
        }
        Ok(())
    }
}

mod mysql {
    use super::*;

    // MySQL's LIKE escapes with backslash by default
    fn like(w: &mut SqlWriter, c: &Criterion, anchor: Anchor) -> Result<()> {
        let pattern = like_pattern(c, anchor)?;
        push_text_cast(w, &c.field);
        w.push(" LIKE BINARY ").bind(pattern);
        Ok(())
    }

    fn upper_like(w: &mut SqlWriter, c: &Criterion, anchor: Anchor) -> Result<()> {
        let pattern = like_pattern(c, anchor)?;
        upper_text(w, &c.field);
        w.push(" LIKE UPPER(").bind(pattern).push(")");
        Ok(())
    }

    pub(super) fn contains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::Contains)
    }

    pub(super) fn icontains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::Contains)
    }

    pub(super) fn starts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::Start)
    }

    pub(super) fn istarts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::Start)
    }

    pub(super) fn ends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        like(w, c, Anchor::End)
    }

    pub(super) fn iends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::End)
    }

    pub(super) fn search(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let query = c.pattern()?;
        w.push("MATCH(").push_identifier(&c.field).push(") AGAINST (");
        w.bind(Value::Text(query)).push(" IN NATURAL LANGUAGE MODE)");
        Ok(())
    }

    pub(super) fn regex(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let pattern = c.pattern()?;
        push_text_cast(w, &c.field);
        w.push(" REGEXP ").bind(Value::Text(pattern));
        Ok(())
    }

    pub(super) fn json_contains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let encoded = encoded_json(c)?;
        w.push("JSON_CONTAINS(").push_identifier(&c.field).push(", ").bind(encoded).push(")");
        Ok(())
    }

    pub(super) fn json_contained_by(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let encoded = encoded_json(c)?;
        w.push("JSON_CONTAINS(").bind(encoded).push(", ").push_identifier(&c.field).push(")");
        Ok(())
    }

    pub(super) fn json_filter(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let (path, value) = c.path()?;
        let expected = to_json(c, value)?;
        let path = Value::Text(json_path(path));
        if expected.is_null() {
            w.push("JSON_EXTRACT(").push_identifier(&c.field).push(", ").bind(path);
            w.push(") IS NULL");
        } else {
            w.push("JSON_UNQUOTE(JSON_EXTRACT(").push_identifier(&c.field).push(", ");
            w.bind(path).push(")) = ").bind(Value::Text(json_text(&expected)));
        }
        Ok(())
    }
}

mod sqlite {
    use super::*;

    // LIKE is case-insensitive in SQLite, so case-sensitive lookups use GLOB
    fn glob(w: &mut SqlWriter, c: &Criterion, anchor: Anchor) -> Result<()> {
        let pattern = wrap(escape_glob(&c.pattern()?), anchor, '*');
        push_text_cast(w, &c.field);
        w.push(" GLOB ").bind(Value::Text(pattern));
        Ok(())
    }

    fn upper_like(w: &mut SqlWriter, c: &Criterion, anchor: Anchor) -> Result<()> {
        let pattern = like_pattern(c, anchor)?;
        upper_text(w, &c.field);
        w.push(" LIKE UPPER(").bind(pattern).push(") ESCAPE '\\'");
        Ok(())
    }

    pub(super) fn contains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        glob(w, c, Anchor::Contains)
    }

    pub(super) fn icontains(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::Contains)
    }

    pub(super) fn starts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        glob(w, c, Anchor::Start)
    }

    pub(super) fn istarts_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::Start)
    }

    pub(super) fn ends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        glob(w, c, Anchor::End)
    }

    pub(super) fn iends_with(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        upper_like(w, c, Anchor::End)
    }

    /// Full-text search against an FTS virtual table column.
    pub(super) fn search(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let query = c.pattern()?;
        w.push_identifier(&c.field).push(" MATCH ").bind(Value::Text(query));
        Ok(())
    }

    pub(super) fn regex(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let pattern = c.pattern()?;
        push_text_cast(w, &c.field);
        w.push(" REGEXP ").bind(Value::Text(pattern));
        Ok(())
    }

    /// The SQL value `json_extract` yields for a JSON scalar.
    fn extracted(value: &JsonValue) -> Value {
        match value {
            JsonValue::Bool(b) => Value::Int(i64::from(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Null => Value::Null,
            other => Value::Text(other.to_string()),
        }
    }

    pub(super) fn json_filter(w: &mut SqlWriter, c: &Criterion) -> Result<()> {
        let (path, value) = c.path()?;
        let expected = to_json(c, value)?;
        w.push("json_extract(").push_identifier(&c.field).push(", ");
        w.bind(Value::Text(json_path(path))).push(")");
        if expected.is_null() {
            w.push(" IS NULL");
        } else {
            w.push(" = ").bind(extracted(&expected));
        }
        Ok(())
    }
}
