//! Dialect adapter
//!
//! Translates an operation-node tree into dialect-specific SQL text plus an
//! ordered parameter list. Two variants exist: `Embedded` (SQLite, `?`
//! placeholders) and `Networked` (PostgreSQL wire dialect, `$N`). Identifier
//! wrapping uses double quotes with internal doubling; values never appear in
//! the SQL text except as parameter-free DEFAULT literals in DDL.

use serde::{Deserialize, Serialize};

use crate::config::Dialect;
use crate::sql::nodes::{
    AddColumn, ColumnDef, ColumnRef, CreateIndex, CreateTable, DeleteQuery, DropColumn, DropIndex,
    DropTable, Identifier, InsertQuery, Predicate, Query, SelectQuery, SortOrder, SqlType,
    SqlValue, UpdateQuery,
};

// ============================================================================
// RENDERED OUTPUT
// ============================================================================

/// SQL text plus its ordered parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedQuery {
    /// Dialect-specific SQL text
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<SqlValue>,
}

// ============================================================================
// RENDERING
// ============================================================================

impl Dialect {
    /// Render any operation node.
    pub fn render(&self, query: &Query) -> RenderedQuery {
        let mut r = Renderer::new(*self);
        match query {
            Query::Select(q) => r.select(q),
            Query::Insert(q) => r.insert(q),
            Query::Update(q) => r.update(q),
            Query::Delete(q) => r.delete(q),
            Query::CreateTable(q) => r.create_table(q),
            Query::CreateIndex(q) => r.create_index(q),
            Query::DropIndex(q) => r.drop_index(q),
            Query::DropTable(q) => r.drop_table(q),
            Query::AddColumn(q) => r.add_column(q),
            Query::DropColumn(q) => r.drop_column(q),
        }
        RenderedQuery { sql: r.sql, params: r.params }
    }

    fn type_name(&self, t: SqlType) -> &'static str {
        match (self, t) {
            (Dialect::Embedded, SqlType::Integer) => "INTEGER",
            (Dialect::Embedded, SqlType::Real) => "REAL",
            (Dialect::Embedded, SqlType::Text) => "TEXT",
            (Dialect::Embedded, SqlType::Blob) => "BLOB",
            (Dialect::Embedded, SqlType::Boolean) => "INTEGER",
            (Dialect::Networked, SqlType::Integer) => "BIGINT",
            (Dialect::Networked, SqlType::Real) => "DOUBLE PRECISION",
            (Dialect::Networked, SqlType::Text) => "TEXT",
            (Dialect::Networked, SqlType::Blob) => "BYTEA",
            (Dialect::Networked, SqlType::Boolean) => "BOOLEAN",
        }
    }
}

/// Quote one identifier path, doubling any interior quote.
///
/// Validated identifiers cannot contain quotes; the doubling is belt over
/// braces for the single raw-DDL path that re-quotes introspected names.
pub fn quote_identifier(ident: &Identifier) -> String {
    let mut out = String::with_capacity(ident.as_str().len() + 4);
    let mut first = true;
    for segment in ident.segments() {
        if !first {
            out.push('.');
        }
        first = false;
        out.push('"');
        for c in segment.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
    }
    out
}

struct Renderer {
    dialect: Dialect,
    sql: String,
    params: Vec<SqlValue>,
}

impl Renderer {
    fn new(dialect: Dialect) -> Self {
        Self { dialect, sql: String::new(), params: Vec::new() }
    }

    fn placeholder(&mut self) -> String {
        match self.dialect {
            Dialect::Embedded => "?".to_string(),
            Dialect::Networked => format!("${}", self.params.len()),
        }
    }

    fn push_param(&mut self, value: SqlValue) {
        self.params.push(value);
        let p = self.placeholder();
        self.sql.push_str(&p);
    }

    fn push_ident(&mut self, ident: &Identifier) {
        let q = quote_identifier(ident);
        self.sql.push_str(&q);
    }

    fn push_column(&mut self, column: &ColumnRef) {
        if let Some(table) = &column.table {
            self.push_ident(table);
            self.sql.push('.');
        }
        self.push_ident(&column.name);
    }

    fn predicate(&mut self, p: &Predicate) {
        match p {
            Predicate::Compare { column, op, value } => {
                self.push_column(column);
                self.sql.push(' ');
                self.sql.push_str(op.as_sql());
                self.sql.push(' ');
                self.push_param(value.clone());
            }
            Predicate::IsNull(column) => {
                self.push_column(column);
                self.sql.push_str(" IS NULL");
            }
            Predicate::IsNotNull(column) => {
                self.push_column(column);
                self.sql.push_str(" IS NOT NULL");
            }
            Predicate::InList { column, values } => {
                self.push_column(column);
                self.sql.push_str(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.push_param(v.clone());
                }
                self.sql.push(')');
            }
            Predicate::And(children) => self.junction(children, " AND "),
            Predicate::Or(children) => self.junction(children, " OR "),
        }
    }

    fn junction(&mut self, children: &[Predicate], sep: &str) {
        self.sql.push('(');
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(sep);
            }
            self.predicate(child);
        }
        self.sql.push(')');
    }

    fn where_clause(&mut self, predicate: &Option<Predicate>) {
        if let Some(p) = predicate {
            self.sql.push_str(" WHERE ");
            self.predicate(p);
        }
    }

    fn select(&mut self, q: &SelectQuery) {
        self.sql.push_str("SELECT ");
        if q.columns.is_empty() {
            self.sql.push('*');
        } else {
            for (i, c) in q.columns.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.push_column(c);
            }
        }
        self.sql.push_str(" FROM ");
        self.push_ident(&q.table.name);
        self.where_clause(&q.predicate);
        if !q.order_by.is_empty() {
            self.sql.push_str(" ORDER BY ");
            for (i, (c, order)) in q.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.push_column(c);
                if *order == SortOrder::Desc {
                    self.sql.push_str(" DESC");
                }
            }
        }
        if let Some(limit) = q.limit {
            self.sql.push_str(" LIMIT ");
            self.sql.push_str(&limit.to_string());
        }
        if let Some(offset) = q.offset {
            self.sql.push_str(" OFFSET ");
            self.sql.push_str(&offset.to_string());
        }
    }

    fn insert(&mut self, q: &InsertQuery) {
        self.sql.push_str("INSERT INTO ");
        self.push_ident(&q.table.name);
        self.sql.push_str(" (");
        for (i, (col, _)) in q.assignments.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_ident(col);
        }
        self.sql.push_str(") VALUES (");
        for (i, (_, value)) in q.assignments.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_param(value.clone());
        }
        self.sql.push(')');
    }

    fn update(&mut self, q: &UpdateQuery) {
        self.sql.push_str("UPDATE ");
        self.push_ident(&q.table.name);
        self.sql.push_str(" SET ");
        for (i, (col, value)) in q.assignments.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_ident(col);
            self.sql.push_str(" = ");
            self.push_param(value.clone());
        }
        self.where_clause(&q.predicate);
    }

    fn delete(&mut self, q: &DeleteQuery) {
        self.sql.push_str("DELETE FROM ");
        self.push_ident(&q.table.name);
        self.where_clause(&q.predicate);
    }

    fn column_def(&mut self, def: &ColumnDef) {
        self.push_ident(&def.name);
        self.sql.push(' ');
        if def.auto_increment {
            match self.dialect {
                Dialect::Embedded => self.sql.push_str("INTEGER PRIMARY KEY AUTOINCREMENT"),
                Dialect::Networked => {
                    self.sql.push_str("BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY")
                }
            }
            return;
        }
        let type_name = self.dialect.type_name(def.sql_type);
        self.sql.push_str(type_name);
        if def.primary_key {
            self.sql.push_str(" PRIMARY KEY");
        }
        if !def.nullable {
            self.sql.push_str(" NOT NULL");
        }
        if let Some(default) = &def.default {
            self.sql.push_str(" DEFAULT ");
            let lit = self.default_literal(default);
            self.sql.push_str(&lit);
        }
    }

    // DEFAULT clauses cannot be parameterized; literals are rendered with
    // single-quote doubling for text and hex notation for blobs.
    fn default_literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(r) => r.to_string(),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                match self.dialect {
                    Dialect::Embedded => format!("X'{hex}'"),
                    Dialect::Networked => format!("'\\x{hex}'"),
                }
            }
            SqlValue::Bool(b) => match self.dialect {
                Dialect::Embedded => if *b { "1" } else { "0" }.to_string(),
                Dialect::Networked => if *b { "TRUE" } else { "FALSE" }.to_string(),
            },
        }
    }

    fn create_table(&mut self, q: &CreateTable) {
        self.sql.push_str("CREATE TABLE ");
        if q.if_not_exists {
            self.sql.push_str("IF NOT EXISTS ");
        }
        self.push_ident(&q.table.name);
        self.sql.push_str(" (");
        for (i, def) in q.columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.column_def(def);
        }
        self.sql.push(')');
    }

    fn create_index(&mut self, q: &CreateIndex) {
        self.sql.push_str("CREATE ");
        if q.unique {
            self.sql.push_str("UNIQUE ");
        }
        self.sql.push_str("INDEX ");
        if q.if_not_exists {
            self.sql.push_str("IF NOT EXISTS ");
        }
        self.push_ident(&q.name);
        self.sql.push_str(" ON ");
        self.push_ident(&q.table.name);
        self.sql.push_str(" (");
        for (i, col) in q.columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_ident(col);
        }
        self.sql.push(')');
    }

    fn drop_index(&mut self, q: &DropIndex) {
        self.sql.push_str("DROP INDEX ");
        if q.if_exists {
            self.sql.push_str("IF EXISTS ");
        }
        self.push_ident(&q.name);
    }

    fn drop_table(&mut self, q: &DropTable) {
        self.sql.push_str("DROP TABLE ");
        if q.if_exists {
            self.sql.push_str("IF EXISTS ");
        }
        self.push_ident(&q.table.name);
    }

    fn add_column(&mut self, q: &AddColumn) {
        self.sql.push_str("ALTER TABLE ");
        self.push_ident(&q.table.name);
        self.sql.push_str(" ADD COLUMN ");
        self.column_def(&q.column);
    }

    fn drop_column(&mut self, q: &DropColumn) {
        self.sql.push_str("ALTER TABLE ");
        self.push_ident(&q.table.name);
        self.sql.push_str(" DROP COLUMN ");
        self.push_ident(&q.column);
    }
}

// ============================================================================
// TESTS
// ============================================================================
