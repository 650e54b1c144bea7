//! Result Materializer.
//!
//! Rows come back flat. A [`RowShape`] says where each joined relation's
//! columns start, and the materializer slices every row along those ranges
//! to rebuild the root record and its nested relations. Collections are
//! resolved afterwards with one follow-up query per [`Prefetch`].

use std::collections::{BTreeMap, HashMap};

use crate::dialect::statement::PATH_SEPARATOR;
use crate::dialect::{Criterion, Dialect, Operand, Operator, Select};
use crate::error::{DbError, Result};
use crate::pool::PooledConnection;
use crate::value::{Row, Value, ValueKey};

/// A materialized row: ordered column values plus attached relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
    identity: Option<Value>,
    /// `None` marks a relation whose joined columns were all empty.
    relations: BTreeMap<String, Option<Record>>,
    prefetched: BTreeMap<String, Vec<Record>>,
}

impl Record {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    fn from_slice(columns: &[String], values: &[Value], pk: Option<usize>) -> Self {
        let identity = pk.and_then(|i| values.get(i)).filter(|v| !v.is_null()).cloned();
        Self {
            fields: columns.iter().cloned().zip(values.iter().cloned()).collect(),
            identity,
            ..Default::default()
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }

    pub fn identity(&self) -> Option<&Value> {
        self.identity.as_ref()
    }

    /// The related record, if the relation was loaded and present.
    pub fn relation(&self, name: &str) -> Option<&Record> {
        self.relations.get(name).and_then(Option::as_ref)
    }

    /// Whether the relation was loaded at all (present or absent).
    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, Option<&Record>)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn prefetched(&self, name: &str) -> Option<&[Record]> {
        self.prefetched.get(name).map(Vec::as_slice)
    }
}

/// Where one joined relation sits inside a flat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSlice {
    /// Relation path from the root, segments joined by `__`.
    pub path: String,
    pub start: usize,
    pub columns: Vec<String>,
    /// Index of the primary key within `columns`.
    pub pk: Option<usize>,
}

impl JoinSlice {
    fn end(&self) -> usize {
        self.start + self.columns.len()
    }

    fn name(&self) -> &str {
        self.path
            .rsplit_once(PATH_SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or(&self.path)
    }

    fn parent(&self) -> Option<&str> {
        self.path.rsplit_once(PATH_SEPARATOR).map(|(parent, _)| parent)
    }
}

/// Column layout of a result row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowShape {
    pub root_columns: Vec<String>,
    pub root_pk: Option<usize>,
    /// Joined slices, parents before children.
    pub joins: Vec<JoinSlice>,
}

impl RowShape {
    /// A shape with no joins: every column belongs to the root.
    pub fn flat(columns: Vec<String>) -> Self {
        Self {
            root_columns: columns,
            ..Default::default()
        }
    }

    pub fn width(&self) -> usize {
        self.joins
            .iter()
            .map(JoinSlice::end)
            .max()
            .unwrap_or(0)
            .max(self.root_columns.len())
    }

    /// For each slice, the index of its parent slice (`None` for the root).
    fn parents(&self) -> Result<Vec<Option<usize>>> {
        self.joins
            .iter()
            .enumerate()
            .map(|(i, slice)| match slice.parent() {
                None => Ok(None),
                Some(parent) => self.joins[..i]
                    .iter()
                    .position(|s| s.path == parent)
                    .map(Some)
                    .ok_or_else(|| {
                        DbError::ConfigError(format!(
                            "join slice {} has no parent slice {}",
                            slice.path, parent
                        ))
                    }),
            })
            .collect()
    }
}

/// Build records from flat rows.
pub fn materialize(rows: Vec<Row>, shape: &RowShape) -> Result<Vec<Record>> {
    let parents = shape.parents()?;
    let width = shape.width();
    let root_len = shape.root_columns.len();

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < width {
            return Err(DbError::ConfigError(format!(
                "row has {} columns but the shape needs {}",
                row.len(),
                width
            )));
        }

        let mut root = Record::from_slice(&shape.root_columns, &row[..root_len], shape.root_pk);
        let mut built: Vec<Option<Record>> = shape
            .joins
            .iter()
            .map(|slice| {
                let values = &row[slice.start..slice.end()];
                if values.iter().all(Value::is_empty) {
                    None
                } else {
                    Some(Record::from_slice(&slice.columns, values, slice.pk))
                }
            })
            .collect();

        // children come after their parents, so walking backwards attaches
        // every subtree before its parent moves
        for i in (0..shape.joins.len()).rev() {
            let record = built[i].take();
            let name = shape.joins[i].name().to_string();
            match parents[i] {
                None => {
                    root.relations.insert(name, record);
                }
                Some(p) => {
                    // a missing parent drops the whole branch
                    if let Some(parent) = built[p].as_mut() {
                        parent.relations.insert(name, record);
                    }
                }
            }
        }
        records.push(root);
    }
    Ok(records)
}

/// Parent keys bound per prefetch query by default.
pub const PREFETCH_BATCH: usize = 1000;

/// A related collection loaded with follow-up `IN` queries, one per batch
/// of parent keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Prefetch {
    /// Name the children are attached under.
    pub relation: String,
    pub table: String,
    pub columns: Vec<String>,
    /// Column on the child table pointing back at the parent.
    pub foreign_key: String,
    /// Parent column the foreign key refers to; the parent identity if unset.
    pub local_key: Option<String>,
    pub primary_key: Option<String>,
    /// Parent keys per query.
    pub batch_size: usize,
}

impl Prefetch {
    pub fn new(relation: &str, table: &str, columns: &[&str], foreign_key: &str) -> Self {
        Self {
            relation: relation.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            foreign_key: foreign_key.to_string(),
            local_key: None,
            primary_key: None,
            batch_size: PREFETCH_BATCH,
        }
    }

    pub fn local_key(mut self, column: &str) -> Self {
        self.local_key = Some(column.to_string());
        self
    }

    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = Some(column.to_string());
        self
    }

    pub fn batch_size(mut self, keys: usize) -> Self {
        self.batch_size = keys.max(1);
        self
    }

    fn local_value<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        match &self.local_key {
            Some(column) => record.get(column),
            None => record.identity(),
        }
    }

    /// Distinct non-null parent keys, in first-seen order.
    fn keys(&self, records: &[Record]) -> Vec<Value> {
        let mut seen = std::collections::HashSet::new();
        records
            .iter()
            .filter_map(|r| self.local_value(r))
            .filter(|v| v.key().map(|k| seen.insert(k)).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// The child query. The foreign key is selected even if not requested.
    fn select(&self, keys: Vec<Value>) -> Select {
        let mut columns = self.columns.clone();
        if !columns.contains(&self.foreign_key) {
            columns.push(self.foreign_key.clone());
        }
        Select {
            table: self.table.clone(),
            columns,
            primary_key: self.primary_key.clone(),
            filters: vec![Criterion::new(&self.foreign_key, Operator::In, Operand::List(keys))],
            ..Default::default()
        }
    }

    /// Attach children to their parents; parents without children get an
    /// empty collection.
    fn attach(&self, records: &mut [Record], children: Vec<Record>) {
        let mut groups: HashMap<ValueKey, Vec<Record>> = HashMap::new();
        for child in children {
            if let Some(key) = child.get(&self.foreign_key).and_then(Value::key) {
                groups.entry(key).or_default().push(child);
            }
        }
        for record in records.iter_mut() {
            let matched = self
                .local_value(record)
                .and_then(Value::key)
                .and_then(|key| groups.get(&key))
                .cloned()
                .unwrap_or_default();
            record.prefetched.insert(self.relation.clone(), matched);
        }
    }
}

/// Run `prefetch` against already materialized `records`.
pub async fn prefetch(
    conn: &mut PooledConnection,
    dialect: Dialect,
    records: &mut [Record],
    prefetch: &Prefetch,
) -> Result<()> {
    let keys = prefetch.keys(records);
    if keys.is_empty() {
        prefetch.attach(records, Vec::new());
        return Ok(());
    }

    let mut children = Vec::new();
    let mut queries = 0usize;
    for batch in keys.chunks(prefetch.batch_size.max(1)) {
        let query = prefetch.select(batch.to_vec()).build(dialect)?;
        let result = conn.execute(&query.sql, &query.params).await?;
        let shape = query
            .shape
            .unwrap_or_else(|| RowShape::flat(result.columns.clone()));
        children.extend(materialize(result.rows, &shape)?);
        queries += 1;
    }
    tracing::debug!(
        relation = %prefetch.relation,
        parents = records.len(),
        children = children.len(),
        queries,
        "prefetched relation"
    );
    prefetch.attach(records, children);
    Ok(())
}

/// Execute a SELECT, materialize it, then resolve each prefetch.
pub async fn fetch(
    conn: &mut PooledConnection,
    dialect: Dialect,
    select: &Select,
    prefetches: &[Prefetch],
) -> Result<Vec<Record>> {
    let query = select.build(dialect)?;
    let result = conn.execute(&query.sql, &query.params).await?;
    let shape = query.shape.unwrap_or_else(|| select.shape());
    let mut records = materialize(result.rows, &shape)?;
    for p in prefetches {
        prefetch(conn, dialect, &mut records, p).await?;
    }
    Ok(records)
}

/// Flat records from a raw result, one field per returned column.
pub fn flat_records(columns: &[String], rows: Vec<Row>) -> Vec<Record> {
    rows.into_iter()
        .map(|row| Record::new(columns.iter().cloned().zip(row).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn shape_with(joins: Vec<JoinSlice>) -> RowShape {
        RowShape {
            root_columns: cols(&["id", "title", "author_id"]),
            root_pk: Some(0),
            joins,
        }
    }

    fn author_slice() -> JoinSlice {
        JoinSlice {
            path: "author".into(),
            start: 3,
            columns: cols(&["id", "name"]),
            pk: Some(0),
        }
    }

    #[test]
    fn test_null_join_slice_is_absent() {
        let shape = shape_with(vec![author_slice()]);
        let row: Row = smallvec![Value::Int(1), "Dune".into(), Value::Null, Value::Null, Value::Null];
        let records = materialize(vec![row], &shape).unwrap();

        let book = &records[0];
        assert_eq!(book.identity(), Some(&Value::Int(1)));
        assert!(book.has_relation("author"));
        assert!(book.relation("author").is_none());
    }

    #[test]
    fn test_partially_null_join_slice_is_present() {
        let shape = shape_with(vec![author_slice()]);
        let row: Row = smallvec![Value::Int(1), "Dune".into(), Value::Null, Value::Null, "Herbert".into()];
        let records = materialize(vec![row], &shape).unwrap();

        let author = records[0].relation("author").unwrap();
        assert_eq!(author.get("name"), Some(&Value::Text("Herbert".into())));
        assert_eq!(author.get("id"), Some(&Value::Null));
        assert_eq!(author.identity(), None);
    }

    #[test]
    fn test_empty_text_counts_as_empty() {
        let shape = shape_with(vec![author_slice()]);
        let row: Row = smallvec![Value::Int(1), "x".into(), Value::Null, Value::Null, "".into()];
        let records = materialize(vec![row], &shape).unwrap();
        assert!(records[0].relation("author").is_none());
    }

    #[test]
    fn test_nested_paths_attach_to_their_parent() {
        let shape = shape_with(vec![
            author_slice(),
            JoinSlice {
                path: "author__publisher".into(),
                start: 5,
                columns: cols(&["name"]),
                pk: None,
            },
            JoinSlice {
                path: "editor".into(),
                start: 6,
                columns: cols(&["name"]),
                pk: None,
            },
        ]);
        let rows: Vec<Row> = vec![
            smallvec![Value::Int(1), "a".into(), Value::Int(9), Value::Int(9), "Ann".into(), "Ace".into(), "Ed".into()],
            // absent author takes its publisher with it
            smallvec![Value::Int(2), "b".into(), Value::Null, Value::Null, Value::Null, "Orphan".into(), Value::Null],
        ];
        let records = materialize(rows, &shape).unwrap();

        let author = records[0].relation("author").unwrap();
        assert_eq!(
            author.relation("publisher").unwrap().get("name"),
            Some(&Value::Text("Ace".into()))
        );
        assert!(!records[0].has_relation("author__publisher"));
        assert_eq!(
            records[0].relation("editor").unwrap().get("name"),
            Some(&Value::Text("Ed".into()))
        );

        assert!(records[1].relation("author").is_none());
        assert!(records[1].has_relation("editor"));
        assert!(records[1].relation("editor").is_none());
    }

    #[test]
    fn test_short_row_is_rejected() {
        let shape = shape_with(vec![author_slice()]);
        let row: Row = smallvec![Value::Int(1), "x".into(), Value::Null];
        assert!(matches!(materialize(vec![row], &shape), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn test_orphan_slice_is_rejected() {
        let shape = shape_with(vec![JoinSlice {
            path: "author__publisher".into(),
            start: 3,
            columns: cols(&["name"]),
            pk: None,
        }]);
        let row: Row = smallvec![Value::Int(1), "x".into(), Value::Null, "p".into()];
        assert!(materialize(vec![row], &shape).is_err());
    }

    #[test]
    fn test_prefetch_query_and_attach() {
        let parents = vec![
            Record::from_slice(&cols(&["id"]), &[Value::Int(1)], Some(0)),
            Record::from_slice(&cols(&["id"]), &[Value::Int(2)], Some(0)),
            Record::from_slice(&cols(&["id"]), &[Value::Int(1)], Some(0)),
        ];
        let p = Prefetch::new("comments", "comments", &["id", "body"], "post_id");
        let keys = p.keys(&parents);
        assert_eq!(keys, vec![Value::Int(1), Value::Int(2)]);

        let q = p.select(keys).build(Dialect::Sqlite).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"comments\".\"id\", \"comments\".\"body\", \"comments\".\"post_id\" \
             FROM \"comments\" WHERE \"post_id\" IN (?1, ?2)"
        );

        let children = flat_records(
            &cols(&["id", "body", "post_id"]),
            vec![
                smallvec![Value::Int(10), "first".into(), Value::Int(1)],
                smallvec![Value::Int(11), "second".into(), Value::Int(1)],
            ],
        );
        let mut parents = parents;
        p.attach(&mut parents, children);
        assert_eq!(parents[0].prefetched("comments").unwrap().len(), 2);
        assert_eq!(parents[1].prefetched("comments").unwrap().len(), 0);
        assert_eq!(parents[2].prefetched("comments").unwrap().len(), 2);
        assert!(parents[0].prefetched("tags").is_none());
    }

    #[test]
    fn test_flat_records_keep_column_order() {
        let records = flat_records(&cols(&["b", "a"]), vec![smallvec![Value::Int(2), Value::Int(1)]]);
        let names: Vec<&str> = records[0].fields().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(records[0].identity(), None);
    }
}
