//! Operation node layer
//!
//! Typed query-tree nodes. Every identifier-bearing node (`Identifier`,
//! `TableRef`, `ColumnRef`, the DDL column definitions) runs the validator at
//! construction, which makes the invariant structural: a node that exists
//! holds a safe identifier, and the dialect adapter only renders nodes.
//!
//! Values never interpolate into SQL text; they travel as parameters.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sql::validate::validate_identifier;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// A validated SQL identifier (possibly dotted, at most three segments)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Validate and wrap a candidate name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    /// The raw (validated) text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dotted segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated table reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// Table name (optionally schema-qualified)
    pub name: Identifier,
}

impl TableRef {
    /// Validate and wrap a table name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self { name: Identifier::new(name)? })
    }
}

/// A validated column reference, optionally table-qualified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Owning table, when qualification is needed (joins)
    pub table: Option<Identifier>,
    /// Column name
    pub name: Identifier,
}

impl ColumnRef {
    /// Validate and wrap a bare column name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self { table: None, name: Identifier::new(name)? })
    }

    /// Validate and wrap a `table.column` pair.
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Ok(Self { table: Some(Identifier::new(table)?), name: Identifier::new(name)? })
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// A parameter value carried alongside rendered SQL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// 64-bit integer
    Integer(i64),
    /// Double
    Real(f64),
    /// Text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
    /// Boolean (dialects disagree on the literal; always parameterized)
    Bool(bool),
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Owned(Value::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

// ============================================================================
// PREDICATES
// ============================================================================

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `LIKE`
    Like,
}

impl CompareOp {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// A WHERE-clause predicate tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `column OP ?`
    Compare {
        /// Left-hand column
        column: ColumnRef,
        /// Operator
        op: CompareOp,
        /// Parameterized right-hand value
        value: SqlValue,
    },
    /// `column IS NULL`
    IsNull(ColumnRef),
    /// `column IS NOT NULL`
    IsNotNull(ColumnRef),
    /// `column IN (?, ?, ...)`
    InList {
        /// Column
        column: ColumnRef,
        /// Parameterized members
        values: Vec<SqlValue>,
    },
    /// All of the children
    And(Vec<Predicate>),
    /// Any of the children
    Or(Vec<Predicate>),
}

impl Predicate {
    /// `column = ?` shorthand.
    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Result<Self> {
        Ok(Predicate::Compare {
            column: ColumnRef::new(column)?,
            op: CompareOp::Eq,
            value: value.into(),
        })
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

// ============================================================================
// DML NODES
// ============================================================================

/// `SELECT` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Source table
    pub table: TableRef,
    /// Projected columns; empty means `*`
    pub columns: Vec<ColumnRef>,
    /// Optional filter
    pub predicate: Option<Predicate>,
    /// Ordering terms
    pub order_by: Vec<(ColumnRef, SortOrder)>,
    /// Row cap
    pub limit: Option<u64>,
    /// Row offset
    pub offset: Option<u64>,
}

impl SelectQuery {
    /// Start a `SELECT *` over a table.
    pub fn from(table: impl Into<String>) -> Result<Self> {
        Ok(Self {
            table: TableRef::new(table)?,
            columns: Vec::new(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        })
    }

    /// Project named columns.
    pub fn columns<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.columns.push(ColumnRef::new(name)?);
        }
        Ok(self)
    }

    /// Add a filter (replaces any previous one).
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Add an ordering term.
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Result<Self> {
        self.order_by.push((ColumnRef::new(column)?, order));
        Ok(self)
    }

    /// Cap the row count.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }
}

/// Single-row `INSERT` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertQuery {
    /// Target table
    pub table: TableRef,
    /// `(column, value)` pairs
    pub assignments: Vec<(Identifier, SqlValue)>,
}

impl InsertQuery {
    /// Start an insert into a table.
    pub fn into(table: impl Into<String>) -> Result<Self> {
        Ok(Self { table: TableRef::new(table)?, assignments: Vec::new() })
    }

    /// Add a column/value pair.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Result<Self> {
        self.assignments.push((Identifier::new(column)?, value.into()));
        Ok(self)
    }
}

/// `UPDATE` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateQuery {
    /// Target table
    pub table: TableRef,
    /// `SET` pairs
    pub assignments: Vec<(Identifier, SqlValue)>,
    /// Optional filter
    pub predicate: Option<Predicate>,
}

impl UpdateQuery {
    /// Start an update of a table.
    pub fn table(table: impl Into<String>) -> Result<Self> {
        Ok(Self { table: TableRef::new(table)?, assignments: Vec::new(), predicate: None })
    }

    /// Add a `SET column = ?` pair.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Result<Self> {
        self.assignments.push((Identifier::new(column)?, value.into()));
        Ok(self)
    }

    /// Add a filter (replaces any previous one).
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// `DELETE` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteQuery {
    /// Target table
    pub table: TableRef,
    /// Optional filter
    pub predicate: Option<Predicate>,
}

impl DeleteQuery {
    /// Start a delete from a table.
    pub fn from(table: impl Into<String>) -> Result<Self> {
        Ok(Self { table: TableRef::new(table)?, predicate: None })
    }

    /// Add a filter (replaces any previous one).
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

// ============================================================================
// DDL NODES
// ============================================================================

/// Column type in DDL nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    /// 64-bit integer
    Integer,
    /// Double
    Real,
    /// Text
    Text,
    /// Raw bytes
    Blob,
    /// Boolean (rendered per dialect)
    Boolean,
}

/// A column definition inside `CREATE TABLE` / `ADD COLUMN`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: Identifier,
    /// Column type
    pub sql_type: SqlType,
    /// NULLs permitted
    pub nullable: bool,
    /// Default value (parameter-free literal rendered per dialect)
    pub default: Option<SqlValue>,
    /// Primary key
    pub primary_key: bool,
    /// Auto-increment (implies primary key, integer)
    pub auto_increment: bool,
}

impl ColumnDef {
    /// A plain nullable column.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Result<Self> {
        Ok(Self {
            name: Identifier::new(name)?,
            sql_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
        })
    }

    /// Mark NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as the auto-increment primary key.
    pub fn auto_primary_key(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self.nullable = false;
        self
    }
}

/// `CREATE TABLE` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTable {
    /// Table name
    pub table: TableRef,
    /// Column definitions (at least one)
    pub columns: Vec<ColumnDef>,
    /// `IF NOT EXISTS`
    pub if_not_exists: bool,
}

/// `CREATE [UNIQUE] INDEX` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIndex {
    /// Index name
    pub name: Identifier,
    /// Indexed table
    pub table: TableRef,
    /// Indexed columns in order
    pub columns: Vec<Identifier>,
    /// Uniqueness
    pub unique: bool,
    /// `IF NOT EXISTS`
    pub if_not_exists: bool,
}

impl CreateIndex {
    /// Build a (non-unique) index node.
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns
            .into_iter()
            .map(|c| Identifier::new(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: Identifier::new(name)?,
            table: TableRef::new(table)?,
            columns,
            unique: false,
            if_not_exists: false,
        })
    }
}

/// `DROP INDEX` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropIndex {
    /// Index name
    pub name: Identifier,
    /// `IF EXISTS`
    pub if_exists: bool,
}

/// `DROP TABLE` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropTable {
    /// Table name
    pub table: TableRef,
    /// `IF EXISTS`
    pub if_exists: bool,
}

/// `ALTER TABLE ... DROP COLUMN` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropColumn {
    /// Target table
    pub table: TableRef,
    /// Column to drop
    pub column: Identifier,
}

/// `ALTER TABLE ... ADD COLUMN` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddColumn {
    /// Target table
    pub table: TableRef,
    /// Column to add
    pub column: ColumnDef,
}

// ============================================================================
// QUERY ENVELOPE
// ============================================================================

/// Any renderable operation node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Query {
    /// SELECT
    Select(SelectQuery),
    /// INSERT
    Insert(InsertQuery),
    /// UPDATE
    Update(UpdateQuery),
    /// DELETE
    Delete(DeleteQuery),
    /// CREATE TABLE
    CreateTable(CreateTable),
    /// CREATE [UNIQUE] INDEX
    CreateIndex(CreateIndex),
    /// DROP INDEX
    DropIndex(DropIndex),
    /// DROP TABLE
    DropTable(DropTable),
    /// ALTER TABLE ADD COLUMN
    AddColumn(AddColumn),
    /// ALTER TABLE DROP COLUMN
    DropColumn(DropColumn),
}

// ============================================================================
// TESTS
// ============================================================================
