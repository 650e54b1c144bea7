//! SELECT and UPDATE statement shapes.
//!
//! SELECT places ORDER BY, LIMIT and OFFSET in their usual positions. UPDATE
//! only carries ORDER BY/LIMIT when it actually targets rows: MySQL takes
//! them after SET/WHERE, while PostgreSQL and SQLite reject them on UPDATE
//! and get a primary-key subquery instead.

use super::filters::{write_filters, Criterion};
use super::{Dialect, SqlWriter};
use crate::error::{DbError, Result};
use crate::materialize::{JoinSlice, RowShape};
use crate::value::Value;

/// Separator between segments of a relation path (`author__publisher`).
pub const PATH_SEPARATOR: &str = "__";

/// Largest row count MySQL accepts, used for OFFSET without LIMIT.
const MYSQL_MAX_ROWS: &str = "18446744073709551615";

/// A built statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// Column layout of each returned row, for SELECTs.
    pub shape: Option<RowShape>,
}

/// ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }

    /// Parse `name` / `-name` ordering syntax.
    pub fn parse(term: &str) -> Self {
        match term.strip_prefix('-') {
            Some(column) => Self::desc(column),
            None => Self::asc(term),
        }
    }
}

/// An eagerly joined to-one relation.
///
/// `path` names the relation from the root (`author`, `author__publisher`)
/// and doubles as the table alias. The parent is the path minus its last
/// segment, or the root table.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub path: String,
    pub table: String,
    pub columns: Vec<String>,
    pub primary_key: Option<String>,
    /// Column on the parent side.
    pub local_key: String,
    /// Column on the joined table.
    pub remote_key: String,
}

impl Join {
    pub fn new(path: &str, table: &str, columns: &[&str], local_key: &str, remote_key: &str) -> Self {
        Self {
            path: path.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: None,
            local_key: local_key.to_string(),
            remote_key: remote_key.to_string(),
        }
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = Some(column.to_string());
        self
    }

    pub(crate) fn parent_path(&self) -> Option<&str> {
        self.path.rsplit_once(PATH_SEPARATOR).map(|(parent, _)| parent)
    }
}

/// A SELECT over one root table and its joined relations.
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub primary_key: Option<String>,
    pub joins: Vec<Join>,
    pub filters: Vec<Criterion>,
    pub order_by: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn new(table: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = Some(column.to_string());
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filters.push(criterion);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Column layout of the rows this SELECT returns.
    pub fn shape(&self) -> RowShape {
        let mut start = self.columns.len();
        let joins = self
            .joins
            .iter()
            .map(|join| {
                let slice = JoinSlice {
                    path: join.path.clone(),
                    start,
                    columns: join.columns.clone(),
                    pk: position(&join.columns, join.primary_key.as_deref()),
                };
                start += join.columns.len();
                slice
            })
            .collect();
        RowShape {
            root_columns: self.columns.clone(),
            root_pk: position(&self.columns, self.primary_key.as_deref()),
            joins,
        }
    }

    pub fn build(&self, dialect: Dialect) -> Result<BuiltQuery> {
        if self.columns.is_empty() {
            return Err(DbError::ConfigError(format!(
                "select on {} needs at least one column",
                self.table
            )));
        }
        self.check_joins()?;

        // qualify bare names once other tables are in scope
        let qualify = !self.joins.is_empty();
        let mut w = SqlWriter::new(dialect);

        w.push("SELECT ");
        let mut first = true;
        for (alias, columns) in std::iter::once((&self.table, &self.columns))
            .chain(self.joins.iter().map(|j| (&j.path, &j.columns)))
        {
            for column in columns {
                if !first {
                    w.push(", ");
                }
                first = false;
                w.push_identifier(&format!("{}.{}", alias, column));
            }
        }

        w.push(" FROM ").push_identifier(&self.table);
        for join in &self.joins {
            let parent = join.parent_path().unwrap_or(&self.table);
            w.push(" LEFT OUTER JOIN ").push_identifier(&join.table);
            w.push(" AS ").push_identifier(&join.path);
            w.push(" ON ").push_identifier(&format!("{}.{}", join.path, join.remote_key));
            w.push(" = ").push_identifier(&format!("{}.{}", parent, join.local_key));
        }

        if !self.filters.is_empty() {
            w.push(" WHERE ");
            if qualify {
                write_filters(&mut w, &qualified(&self.table, &self.filters))?;
            } else {
                write_filters(&mut w, &self.filters)?;
            }
        }

        write_order_by(&mut w, &self.order_by, qualify.then_some(self.table.as_str()));
        write_limit_offset(&mut w, self.limit, self.offset);

        let (sql, params) = w.finish();
        Ok(BuiltQuery {
            sql,
            params,
            shape: Some(self.shape()),
        })
    }

    /// Every join's parent must be the root or an earlier join.
    fn check_joins(&self) -> Result<()> {
        for (i, join) in self.joins.iter().enumerate() {
            if let Some(parent) = join.parent_path() {
                if !self.joins[..i].iter().any(|j| j.path == parent) {
                    return Err(DbError::ConfigError(format!(
                        "join {} refers to undeclared relation {}",
                        join.path, parent
                    )));
                }
            }
        }
        Ok(())
    }
}

/// An UPDATE, optionally restricted by ORDER BY/LIMIT.
#[derive(Debug, Clone)]
pub struct Update {
    pub table: String,
    pub primary_key: String,
    pub assignments: Vec<(String, Value)>,
    pub filters: Vec<Criterion>,
    pub order_by: Vec<Order>,
    pub limit: Option<u64>,
}

impl Update {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            primary_key: "id".to_string(),
            assignments: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = column.to_string();
        self
    }

    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.assignments.push((column.to_string(), value.into()));
        self
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.filters.push(criterion);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn build(&self, dialect: Dialect) -> Result<BuiltQuery> {
        if self.assignments.is_empty() {
            return Err(DbError::ConfigError(format!(
                "update on {} has no assignments",
                self.table
            )));
        }

        let mut w = SqlWriter::new(dialect);
        w.push("UPDATE ").push_identifier(&self.table).push(" SET ");
        for (i, (column, value)) in self.assignments.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push_identifier(column).push(" = ").bind(value.clone());
        }

        let restricted = !self.order_by.is_empty() || self.limit.is_some();
        match dialect {
            Dialect::Postgres | Dialect::Sqlite if restricted => {
                w.push(" WHERE ").push_identifier(&self.primary_key).push(" IN (SELECT ");
                w.push_identifier(&self.primary_key).push(" FROM ").push_identifier(&self.table);
                if !self.filters.is_empty() {
                    w.push(" WHERE ");
                    write_filters(&mut w, &self.filters)?;
                }
                write_order_by(&mut w, &self.order_by, None);
                write_limit_offset(&mut w, self.limit, None);
                w.push(")");
            }
            _ => {
                if !self.filters.is_empty() {
                    w.push(" WHERE ");
                    write_filters(&mut w, &self.filters)?;
                }
                write_order_by(&mut w, &self.order_by, None);
                write_limit_offset(&mut w, self.limit, None);
            }
        }

        let (sql, params) = w.finish();
        Ok(BuiltQuery {
            sql,
            params,
            shape: None,
        })
    }
}

fn position(columns: &[String], name: Option<&str>) -> Option<usize> {
    name.and_then(|name| columns.iter().position(|c| c == name))
}

fn qualified(table: &str, criteria: &[Criterion]) -> Vec<Criterion> {
    criteria
        .iter()
        .map(|c| {
            let mut c = c.clone();
            if !c.field.contains('.') {
                c.field = format!("{}.{}", table, c.field);
            }
            c
        })
        .collect()
}

fn write_order_by(w: &mut SqlWriter, order_by: &[Order], table: Option<&str>) {
    if order_by.is_empty() {
        return;
    }
    w.push(" ORDER BY ");
    for (i, order) in order_by.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        match table {
            Some(table) if !order.column.contains('.') => {
                w.push_identifier(&format!("{}.{}", table, order.column))
            }
            _ => w.push_identifier(&order.column),
        };
        w.push(if order.descending { " DESC" } else { " ASC" });
    }
}

fn write_limit_offset(w: &mut SqlWriter, limit: Option<u64>, offset: Option<u64>) {
    match (limit, offset) {
        (Some(n), _) => {
            w.push(&format!(" LIMIT {}", n));
        }
        // MySQL and SQLite need a LIMIT before OFFSET
        (None, Some(_)) => match w.dialect() {
            Dialect::MySql => {
                w.push(" LIMIT ").push(MYSQL_MAX_ROWS);
            }
            Dialect::Sqlite => {
                w.push(" LIMIT -1");
            }
            Dialect::Postgres => {}
        },
        (None, None) => {}
    }
    if let Some(n) = offset {
        w.push(&format!(" OFFSET {}", n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Operator;

    #[test]
    fn test_flat_select() {
        let q = Select::new("users", &["id", "name"])
            .primary_key("id")
            .filter(Criterion::parse("name__icontains", "an"))
            .order_by(Order::parse("-name"))
            .limit(10)
            .offset(20)
            .build(Dialect::Postgres)
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"users\".\"id\", \"users\".\"name\" FROM \"users\" \
             WHERE CAST(\"name\" AS TEXT) ILIKE $1 ESCAPE '\\' \
             ORDER BY \"name\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(q.params, vec![Value::Text("%an%".into())]);
        let shape = q.shape.unwrap();
        assert_eq!(shape.root_pk, Some(0));
        assert!(shape.joins.is_empty());
    }

    #[test]
    fn test_offset_without_limit() {
        let select = Select::new("t", &["a"]).offset(5);
        assert!(select.build(Dialect::Postgres).unwrap().sql.ends_with("FROM \"t\" OFFSET 5"));
        assert!(select.build(Dialect::Sqlite).unwrap().sql.ends_with(" LIMIT -1 OFFSET 5"));
        assert!(select
            .build(Dialect::MySql)
            .unwrap()
            .sql
            .ends_with(" LIMIT 18446744073709551615 OFFSET 5"));
    }

    #[test]
    fn test_select_with_nested_joins() {
        let select = Select::new("books", &["id", "title", "author_id"])
            .primary_key("id")
            .join(Join::new("author", "authors", &["id", "name", "publisher_id"], "author_id", "id").primary_key("id"))
            .join(Join::new("author__publisher", "publishers", &["id", "name"], "publisher_id", "id"))
            .filter(Criterion::new("author.name", Operator::Exact, "Le Guin"))
            .filter(Criterion::parse("title__startswith", "The"))
            .order_by(Order::asc("title"));
        let q = select.build(Dialect::Sqlite).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"books\".\"id\", \"books\".\"title\", \"books\".\"author_id\", \
             \"author\".\"id\", \"author\".\"name\", \"author\".\"publisher_id\", \
             \"author__publisher\".\"id\", \"author__publisher\".\"name\" \
             FROM \"books\" \
             LEFT OUTER JOIN \"authors\" AS \"author\" ON \"author\".\"id\" = \"books\".\"author_id\" \
             LEFT OUTER JOIN \"publishers\" AS \"author__publisher\" \
             ON \"author__publisher\".\"id\" = \"author\".\"publisher_id\" \
             WHERE \"author\".\"name\" = ?1 AND CAST(\"books\".\"title\" AS TEXT) GLOB ?2 \
             ORDER BY \"books\".\"title\" ASC"
        );

        let shape = q.shape.unwrap();
        assert_eq!(shape.joins[0].start, 3);
        assert_eq!(shape.joins[0].pk, Some(0));
        assert_eq!(shape.joins[1].start, 6);
        assert_eq!(shape.joins[1].path, "author__publisher");
    }

    #[test]
    fn test_join_requires_declared_parent() {
        let select = Select::new("books", &["id"])
            .join(Join::new("author__publisher", "publishers", &["id"], "publisher_id", "id"));
        assert!(matches!(select.build(Dialect::Postgres), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn test_select_requires_columns() {
        assert!(matches!(
            Select::new("t", &[]).build(Dialect::Sqlite),
            Err(DbError::ConfigError(_))
        ));
    }

    #[test]
    fn test_update_plain() {
        let q = Update::new("users")
            .set("active", false)
            .filter(Criterion::parse("age__lt", 18))
            .build(Dialect::Postgres)
            .unwrap();
        assert_eq!(q.sql, "UPDATE \"users\" SET \"active\" = $1 WHERE \"age\" < $2");
        assert_eq!(q.params, vec![Value::Bool(false), Value::Int(18)]);
        assert!(q.shape.is_none());
    }

    #[test]
    fn test_update_order_limit_placement() {
        let update = Update::new("jobs")
            .primary_key("job_id")
            .set("state", "claimed")
            .filter(Criterion::parse("state", "queued"))
            .order_by(Order::asc("created"))
            .limit(1);

        assert_eq!(
            update.build(Dialect::MySql).unwrap().sql,
            "UPDATE `jobs` SET `state` = ? WHERE `state` = ? ORDER BY `created` ASC LIMIT 1"
        );
        assert_eq!(
            update.build(Dialect::Postgres).unwrap().sql,
            "UPDATE \"jobs\" SET \"state\" = $1 WHERE \"job_id\" IN \
             (SELECT \"job_id\" FROM \"jobs\" WHERE \"state\" = $2 ORDER BY \"created\" ASC LIMIT 1)"
        );
        assert_eq!(
            update.build(Dialect::Sqlite).unwrap().sql,
            "UPDATE \"jobs\" SET \"state\" = ?1 WHERE \"job_id\" IN \
             (SELECT \"job_id\" FROM \"jobs\" WHERE \"state\" = ?2 ORDER BY \"created\" ASC LIMIT 1)"
        );
    }

    #[test]
    fn test_update_requires_assignments() {
        assert!(matches!(
            Update::new("t").build(Dialect::Sqlite),
            Err(DbError::ConfigError(_))
        ));
    }
}
