//! Dialect Query Builder.
//!
//! Filters are compiled per dialect through a static operator table (see
//! [`filters`]); statement shapes live in [`statement`]. Everything writes
//! through a [`SqlWriter`], which keeps placeholder numbering and the bound
//! parameter list in step.

pub mod filters;
pub mod statement;

use serde::{Deserialize, Serialize};

use crate::value::Value;

pub use filters::{compile_filters, escape_glob, escape_like, Criterion, Operand, Operator};
pub use statement::{BuiltQuery, Join, Order, Select, Update};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// MySQL dialect (uses ? placeholders)
    MySql,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite => format!("?{}", index),
            Dialect::MySql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Dotted names are quoted segment by segment, so `users.email` becomes
    /// `"users"."email"`. Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        let (quote, escaped) = match self {
            Dialect::Postgres | Dialect::Sqlite => ('"', "\"\""),
            Dialect::MySql => ('`', "``"),
        };
        name.split('.')
            .map(|part| {
                let mut out = String::with_capacity(part.len() + 2);
                out.push(quote);
                out.push_str(&part.replace(quote, escaped));
                out.push(quote);
                out
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }
}

/// Accumulates SQL text and its bound parameters.
#[derive(Debug)]
pub struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_identifier(&mut self, name: &str) -> &mut Self {
        let quoted = self.dialect.quote_identifier(name);
        self.sql.push_str(&quoted);
        self
    }

    /// Bind a parameter and write its placeholder.
    pub fn bind(&mut self, value: Value) -> &mut Self {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}
