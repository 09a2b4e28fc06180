//! DNA inverter
//!
//! Schema evolution with guaranteed reversibility. Autonomous DDL is limited
//! to a whitelist (`CREATE TABLE`, `CREATE [UNIQUE] INDEX`,
//! `ALTER TABLE ADD COLUMN`, `DROP INDEX`); anything else fails with
//! `DdlNotAllowed`. Candidate text is parsed in full — one statement, no
//! comments, no trailing tokens — into operation-layer nodes, and only the
//! SQL rendered back from those nodes ever reaches the engine; caller text
//! is never executed verbatim. For each allowed form an inverse statement is
//! computed before application, and snapshot -> mutation -> inverse-persist
//! happens in a single transaction: observers either see the pre-state with
//! no snapshot or the post-state with snapshot and inverse.

use std::sync::Arc;

use chrono::Utc;

use crate::config::Dialect;
use crate::error::{EngramError, Result};
use crate::sql::{
    AddColumn, ColumnDef, CreateIndex, CreateTable, DropColumn, DropIndex, DropTable, Identifier,
    Query, RenderedQuery, SqlType, SqlValue, TableRef,
};
use crate::storage::{Introspector, SchemaSnapshot, Storage};

// ============================================================================
// WHITELIST
// ============================================================================

/// A DDL statement the pilot may apply autonomously, held as the validated
/// operation node it parsed into
#[derive(Debug, Clone, PartialEq)]
pub enum AllowedDdl {
    /// `CREATE TABLE <t> (...)`
    CreateTable(CreateTable),
    /// `CREATE [UNIQUE] INDEX <i> ON <t> (...)`
    CreateIndex(CreateIndex),
    /// `ALTER TABLE <t> ADD [COLUMN] <c> ...`
    AddColumn(AddColumn),
    /// `DROP INDEX <i>`
    DropIndex(DropIndex),
}

impl AllowedDdl {
    /// The table the mutation touches, when one is named.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            AllowedDdl::CreateTable(node) => Some(node.table.name.as_str()),
            AllowedDdl::CreateIndex(node) => Some(node.table.name.as_str()),
            AllowedDdl::AddColumn(node) => Some(node.table.name.as_str()),
            AllowedDdl::DropIndex(_) => None,
        }
    }

    /// The parsed node wrapped in the renderable envelope.
    pub fn to_query(&self) -> Query {
        match self {
            AllowedDdl::CreateTable(node) => Query::CreateTable(node.clone()),
            AllowedDdl::CreateIndex(node) => Query::CreateIndex(node.clone()),
            AllowedDdl::AddColumn(node) => Query::AddColumn(node.clone()),
            AllowedDdl::DropIndex(node) => Query::DropIndex(node.clone()),
        }
    }

    /// Canonical embedded-dialect SQL for the parsed statement. This — not
    /// the caller's text — is what the engine executes.
    pub fn render(&self) -> RenderedQuery {
        Dialect::Embedded.render(&self.to_query())
    }
}

/// Classify a DDL string against the whitelist.
///
/// The whole string must be a single statement: one optional trailing `;` is
/// stripped, any further `;` or comment marker is rejected, every identifier
/// is validated at node construction, and trailing tokens after the parsed
/// form fail. `IF [NOT] EXISTS` is accepted but normalized away — a silent
/// no-op would desynchronize the stored inverse.
pub fn classify_ddl(ddl: &str) -> Result<AllowedDdl> {
    let trimmed = ddl.trim();
    let trimmed = trimmed.strip_suffix(';').map(str::trim_end).unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(EngramError::DdlNotAllowed("empty statement".to_string()));
    }
    if trimmed.contains(';') {
        return Err(EngramError::DdlNotAllowed(format!(
            "multiple statements in {}",
            clip(ddl)
        )));
    }
    if trimmed.contains("--") || trimmed.contains("/*") || trimmed.contains("*/") {
        return Err(EngramError::DdlNotAllowed(format!(
            "comment markers in {}",
            clip(ddl)
        )));
    }

    let tokens = lex(trimmed)?;
    let mut parser = Parser { tokens, pos: 0, source: ddl };
    let parsed = match (parser.keyword_at(0).as_str(), parser.keyword_at(1).as_str()) {
        ("CREATE", "TABLE") => parser.create_table()?,
        ("CREATE", "INDEX") | ("CREATE", "UNIQUE") => parser.create_index()?,
        ("ALTER", "TABLE") => parser.add_column()?,
        ("DROP", "INDEX") => parser.drop_index()?,
        _ => return Err(parser.not_allowed("statement is outside the autonomous whitelist")),
    };
    if !parser.at_end() {
        return Err(parser.not_allowed("trailing tokens after the statement"));
    }
    Ok(parsed)
}

fn clip(ddl: &str) -> String {
    let mut end = ddl.len().min(120);
    while !ddl.is_char_boundary(end) {
        end -= 1;
    }
    ddl[..end].to_string()
}

// ------------------------------------------------------------------
// Lexer
// ------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Literal(SqlValue),
    LParen,
    RParen,
    Comma,
}

fn lex(ddl: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = ddl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            ',' => tokens.push(Token::Comma),
            '"' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(inner) => name.push(inner),
                        None => {
                            return Err(EngramError::DdlNotAllowed(
                                "unterminated quoted identifier".to_string(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Quoted(name));
            }
            '\'' => {
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                text.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(inner) => text.push(inner),
                        None => {
                            return Err(EngramError::DdlNotAllowed(
                                "unterminated string literal".to_string(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Literal(SqlValue::Text(text)));
            }
            _ => {
                let mut word = String::new();
                word.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | ',' | '"' | '\'') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

// ------------------------------------------------------------------
// Parser
// ------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn not_allowed(&self, reason: &str) -> EngramError {
        EngramError::DdlNotAllowed(format!("{reason} in {}", clip(self.source)))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn keyword_at(&self, offset: usize) -> String {
        match self.tokens.get(self.pos + offset) {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => String::new(),
        }
    }

    /// Consume the next token when it is the given keyword.
    fn take_keyword(&mut self, kw: &str) -> bool {
        if self.keyword_at(0) == kw {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.take_keyword(kw) {
            Ok(())
        } else {
            Err(self.not_allowed(&format!("expected {kw}")))
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.tokens.get(self.pos) == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.not_allowed(&format!("expected {what}")))
        }
    }

    /// A bare or quoted identifier, validated at construction.
    fn identifier(&mut self) -> Result<Identifier> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Word(w)) => {
                self.pos += 1;
                Identifier::new(w)
            }
            Some(Token::Quoted(q)) => {
                self.pos += 1;
                Identifier::new(q)
            }
            _ => Err(self.not_allowed("expected an identifier")),
        }
    }

    /// Accept and discard `IF NOT EXISTS` / `IF EXISTS`.
    fn skip_existence_clause(&mut self) {
        if self.keyword_at(0) == "IF" {
            if self.keyword_at(1) == "NOT" && self.keyword_at(2) == "EXISTS" {
                self.pos += 3;
            } else if self.keyword_at(1) == "EXISTS" {
                self.pos += 2;
            }
        }
    }

    fn create_table(&mut self) -> Result<AllowedDdl> {
        self.pos += 2; // CREATE TABLE
        self.skip_existence_clause();
        let table = TableRef { name: self.identifier()? };
        self.expect(Token::LParen, "(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.column_def()?);
            if self.take_token(Token::Comma) {
                continue;
            }
            self.expect(Token::RParen, ")")?;
            break;
        }
        Ok(AllowedDdl::CreateTable(CreateTable { table, columns, if_not_exists: false }))
    }

    fn create_index(&mut self) -> Result<AllowedDdl> {
        self.pos += 1; // CREATE
        let unique = self.take_keyword("UNIQUE");
        self.expect_keyword("INDEX")?;
        self.skip_existence_clause();
        let name = self.identifier()?;
        self.expect_keyword("ON")?;
        let table = TableRef { name: self.identifier()? };
        self.expect(Token::LParen, "(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.identifier()?);
            if self.take_token(Token::Comma) {
                continue;
            }
            self.expect(Token::RParen, ")")?;
            break;
        }
        Ok(AllowedDdl::CreateIndex(CreateIndex {
            name,
            table,
            columns,
            unique,
            if_not_exists: false,
        }))
    }

    fn add_column(&mut self) -> Result<AllowedDdl> {
        self.pos += 2; // ALTER TABLE
        let table = TableRef { name: self.identifier()? };
        self.expect_keyword("ADD")?;
        self.take_keyword("COLUMN");
        let column = self.column_def()?;
        if column.primary_key {
            return Err(self.not_allowed("ADD COLUMN cannot introduce a primary key"));
        }
        Ok(AllowedDdl::AddColumn(AddColumn { table, column }))
    }

    fn drop_index(&mut self) -> Result<AllowedDdl> {
        self.pos += 2; // DROP INDEX
        self.skip_existence_clause();
        let name = self.identifier()?;
        Ok(AllowedDdl::DropIndex(DropIndex { name, if_exists: false }))
    }

    fn take_token(&mut self, token: Token) -> bool {
        if self.tokens.get(self.pos) == Some(&token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// `name type [PRIMARY KEY [AUTOINCREMENT]] [NOT NULL] [DEFAULT lit]`.
    ///
    /// Table-level constraints (FOREIGN KEY, UNIQUE(...), CHECK, CONSTRAINT)
    /// are outside the autonomous whitelist.
    fn column_def(&mut self) -> Result<ColumnDef> {
        if matches!(
            self.keyword_at(0).as_str(),
            "PRIMARY" | "FOREIGN" | "UNIQUE" | "CHECK" | "CONSTRAINT"
        ) {
            return Err(self.not_allowed("table-level constraints are not whitelisted"));
        }
        let name = self.identifier()?;
        let sql_type = self.column_type()?;
        let mut def = ColumnDef {
            name,
            sql_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
        };
        loop {
            match self.keyword_at(0).as_str() {
                "NOT" => {
                    self.pos += 1;
                    self.expect_keyword("NULL")?;
                    def.nullable = false;
                }
                "PRIMARY" => {
                    self.pos += 1;
                    self.expect_keyword("KEY")?;
                    def.primary_key = true;
                    if self.take_keyword("AUTOINCREMENT") {
                        def.auto_increment = true;
                        def.nullable = false;
                    }
                }
                "DEFAULT" => {
                    self.pos += 1;
                    def.default = Some(self.literal()?);
                }
                _ => break,
            }
        }
        match self.tokens.get(self.pos) {
            None | Some(Token::Comma) | Some(Token::RParen) => Ok(def),
            _ => Err(self.not_allowed("unsupported column constraint")),
        }
    }

    fn column_type(&mut self) -> Result<SqlType> {
        let word = self.keyword_at(0);
        let sql_type = match word.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => SqlType::Integer,
            "REAL" | "FLOAT" | "DOUBLE" => SqlType::Real,
            "TEXT" | "VARCHAR" | "CHAR" | "CLOB" => SqlType::Text,
            "BLOB" | "BYTEA" => SqlType::Blob,
            "BOOLEAN" | "BOOL" => SqlType::Boolean,
            _ => return Err(self.not_allowed("unsupported column type")),
        };
        self.pos += 1;
        if word == "DOUBLE" {
            self.take_keyword("PRECISION");
        }
        Ok(sql_type)
    }

    fn literal(&mut self) -> Result<SqlValue> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Literal(value)) => {
                self.pos += 1;
                Ok(value)
            }
            Some(Token::Word(w)) => {
                self.pos += 1;
                let upper = w.to_ascii_uppercase();
                if upper == "NULL" {
                    return Ok(SqlValue::Null);
                }
                if upper == "TRUE" {
                    return Ok(SqlValue::Bool(true));
                }
                if upper == "FALSE" {
                    return Ok(SqlValue::Bool(false));
                }
                if let Ok(i) = w.parse::<i64>() {
                    return Ok(SqlValue::Integer(i));
                }
                if let Ok(r) = w.parse::<f64>() {
                    return Ok(SqlValue::Real(r));
                }
                Err(self.not_allowed("unsupported DEFAULT literal"))
            }
            _ => Err(self.not_allowed("expected a DEFAULT literal")),
        }
    }
}

// ============================================================================
// INVERTER
// ============================================================================

/// Result of applying one whitelisted mutation
#[derive(Debug, Clone)]
pub struct AppliedMutation {
    /// Snapshot row captured immediately before the mutation
    pub snapshot_id: i64,
    /// Statement that undoes the mutation (rendered from nodes)
    pub inverse: String,
    /// Table the mutation touched, when one is named
    pub target_table: Option<String>,
}

/// Snapshot / apply / rollback engine over an open storage
pub struct DnaInverter {
    storage: Arc<Storage>,
    // Serializes snapshot+apply pairs so no two mutations capture the same
    // pre-state
    apply_lock: std::sync::Mutex<()>,
}

impl DnaInverter {
    /// Wrap an open storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage, apply_lock: std::sync::Mutex::new(()) }
    }

    /// Serialize the current schema into the snapshot store.
    pub fn snapshot(&self, name: &str) -> Result<i64> {
        let dna = Introspector::new(&self.storage).snapshot()?;
        self.persist_snapshot(name, &dna)
    }

    fn persist_snapshot(&self, name: &str, dna: &SchemaSnapshot) -> Result<i64> {
        let serialized = serde_json::to_string(dna)?;
        let now = Utc::now().to_rfc3339();
        self.storage.with_writer(|conn| {
            conn.execute(
                "INSERT INTO agent_snapshots (name, dna, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, serialized, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Load a stored snapshot by id.
    pub fn load_snapshot(&self, id: i64) -> Result<SchemaSnapshot> {
        let dna: String = self
            .storage
            .with_reader(|conn| {
                conn.query_row("SELECT dna FROM agent_snapshots WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
            })
            .map_err(|e| match e {
                EngramError::Database(rusqlite::Error::QueryReturnedNoRows) => {
                    EngramError::NotFound { entity: "snapshot", id }
                }
                other => other,
            })?;
        Ok(serde_json::from_str(&dna)?)
    }

    /// Compute the inverse of a whitelisted mutation without applying it.
    ///
    /// Inverses are rendered from operation nodes. `DROP INDEX` needs the
    /// original definition: the catalog text is itself run back through the
    /// whitelist parser, so an index outside the whitelist grammar cannot be
    /// dropped autonomously.
    pub fn invert(&self, parsed: &AllowedDdl) -> Result<String> {
        let query = match parsed {
            AllowedDdl::CreateTable(node) => {
                Query::DropTable(DropTable { table: node.table.clone(), if_exists: false })
            }
            AllowedDdl::CreateIndex(node) => {
                Query::DropIndex(DropIndex { name: node.name.clone(), if_exists: false })
            }
            AllowedDdl::AddColumn(node) => Query::DropColumn(DropColumn {
                table: node.table.clone(),
                column: node.column.name.clone(),
            }),
            AllowedDdl::DropIndex(node) => {
                let sql: Option<String> = self.storage.with_reader(|conn| {
                    conn.query_row(
                        "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
                        [node.name.as_str()],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })
                })?;
                let sql = sql.ok_or_else(|| {
                    EngramError::DdlNotAllowed(format!(
                        "cannot invert DROP INDEX {}: index does not exist",
                        node.name.as_str()
                    ))
                })?;
                let recreated = classify_ddl(&sql).map_err(|e| {
                    EngramError::DdlNotAllowed(format!(
                        "cannot invert DROP INDEX {}: {e}",
                        node.name.as_str()
                    ))
                })?;
                return Ok(recreated.render().sql);
            }
        };
        Ok(Dialect::Embedded.render(&query).sql)
    }

    /// Validate, snapshot, apply, and persist the inverse, atomically.
    ///
    /// Only the SQL rendered from the parsed nodes is executed; on any
    /// failure the transaction rolls back and the caller sees a single
    /// terminal error with the store untouched.
    pub fn apply(&self, ddl: &str, snapshot_name: &str) -> Result<AppliedMutation> {
        let _guard = self
            .apply_lock
            .lock()
            .map_err(|_| EngramError::LockPoisoned("dna apply"))?;
        let parsed = classify_ddl(ddl)?;
        let inverse = self.invert(&parsed)?;
        let rendered = parsed.render();
        let target_table = parsed.target_table().map(str::to_string);

        // Pre-state, read before the write lock does any work
        let dna = Introspector::new(&self.storage).snapshot()?;
        let serialized = serde_json::to_string(&dna)?;
        let now = Utc::now().to_rfc3339();
        let inverse_clone = inverse.clone();
        let name = snapshot_name.to_string();

        let snapshot_id = self
            .storage
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO agent_snapshots (name, dna, metadata, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        name,
                        serialized,
                        serde_json::json!({ "inverse": inverse_clone }).to_string(),
                        now
                    ],
                )?;
                let snapshot_id = tx.last_insert_rowid();
                tx.execute_batch(&rendered.sql)?;
                Ok(snapshot_id)
            })
            .map_err(|e| match e {
                err @ EngramError::DdlNotAllowed(_) => err,
                other => EngramError::MigrationFailed(format!("{other}")),
            })?;

        tracing::info!(snapshot_id, target = ?target_table, "mutation applied with stored inverse");
        Ok(AppliedMutation { snapshot_id, inverse, target_table })
    }

    /// Execute a stored inverse and verify the schema returned to snapshot
    /// fidelity. Returns `true` when the introspected schema equals the
    /// snapshot; on residual drift a reconciliation pass drops objects the
    /// snapshot does not know before re-checking.
    pub fn rollback(&self, inverse: &str, snapshot_id: i64) -> Result<bool> {
        let expected = self.load_snapshot(snapshot_id)?;
        self.storage
            .transaction(|tx| {
                tx.execute_batch(inverse)?;
                Ok(())
            })
            .map_err(|e| EngramError::MigrationFailed(format!("inverse failed: {e}")))?;

        if Introspector::new(&self.storage).snapshot()? == expected {
            return Ok(true);
        }

        // Inverse was insufficient; drop whatever the snapshot does not know
        self.reconcile_extras(&expected)?;
        let matched = Introspector::new(&self.storage).snapshot()? == expected;
        if !matched {
            tracing::warn!(snapshot_id, "schema still differs from snapshot after rollback");
        }
        Ok(matched)
    }

    fn reconcile_extras(&self, expected: &SchemaSnapshot) -> Result<()> {
        let current = Introspector::new(&self.storage).snapshot()?;
        let mut statements = Vec::new();
        for table in &current.tables {
            match expected.table(&table.name) {
                None => {
                    let node = DropTable {
                        table: TableRef { name: Identifier::new(table.name.as_str())? },
                        if_exists: false,
                    };
                    statements.push(Dialect::Embedded.render(&Query::DropTable(node)).sql);
                }
                Some(_) => {
                    for index in &table.indexes {
                        if !expected.has_index(&index.name) {
                            let node = DropIndex {
                                name: Identifier::new(index.name.as_str())?,
                                if_exists: false,
                            };
                            statements.push(Dialect::Embedded.render(&Query::DropIndex(node)).sql);
                        }
                    }
                }
            }
        }
        if statements.is_empty() {
            return Ok(());
        }
        self.storage.transaction(|tx| {
            for sql in &statements {
                tx.execute_batch(sql)?;
            }
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, OptimizationConfig};
    use crate::storage::bootstrap;

    fn inverter() -> DnaInverter {
        let storage = Arc::new(
            Storage::open(
                &ConnectionSettings::Embedded { path: None },
                &OptimizationConfig::default(),
            )
            .unwrap(),
        );
        bootstrap(&storage).unwrap();
        DnaInverter::new(storage)
    }

    #[test]
    fn whitelist_accepts_the_four_forms() {
        assert!(matches!(
            classify_ddl("CREATE TABLE scratch (id INTEGER PRIMARY KEY)").unwrap(),
            AllowedDdl::CreateTable(_)
        ));
        assert!(matches!(
            classify_ddl("CREATE UNIQUE INDEX idx_x ON agent_goals(title)").unwrap(),
            AllowedDdl::CreateIndex(CreateIndex { unique: true, .. })
        ));
        assert!(matches!(
            classify_ddl("ALTER TABLE agent_goals ADD COLUMN due_at TEXT").unwrap(),
            AllowedDdl::AddColumn(_)
        ));
        assert!(matches!(
            classify_ddl("DROP INDEX IF EXISTS idx_x;").unwrap(),
            AllowedDdl::DropIndex(_)
        ));
    }

    #[test]
    fn whitelist_rejects_everything_else() {
        for ddl in [
            "DROP TABLE agent_sessions",
            "DELETE FROM agent_sessions",
            "ALTER TABLE agent_goals DROP COLUMN title",
            "CREATE TRIGGER trg AFTER INSERT ON agent_goals BEGIN SELECT 1; END",
            "ATTACH DATABASE 'x' AS y",
            "PRAGMA journal_mode = DELETE",
        ] {
            assert!(
                matches!(classify_ddl(ddl), Err(EngramError::DdlNotAllowed(_))),
                "{ddl} should be rejected"
            );
        }
    }

    #[test]
    fn multi_statement_injection_is_rejected() {
        for ddl in [
            "CREATE INDEX ok ON agent_goals(title); DROP TABLE agent_sessions",
            "CREATE INDEX ok ON agent_goals(title); DROP TABLE agent_sessions;--",
            "CREATE INDEX ok ON agent_goals(title) -- tail",
            "CREATE INDEX ok ON agent_goals(title) /* tail */",
            ";DROP TABLE agent_sessions",
        ] {
            assert!(
                matches!(classify_ddl(ddl), Err(EngramError::DdlNotAllowed(_))),
                "{ddl} should be rejected"
            );
        }
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        for ddl in [
            "CREATE INDEX ok ON agent_goals(title) DROP TABLE agent_sessions",
            "DROP INDEX idx_x CASCADE",
            "ALTER TABLE agent_goals ADD COLUMN due_at TEXT REFERENCES agent_sessions(id)",
        ] {
            assert!(
                matches!(classify_ddl(ddl), Err(EngramError::DdlNotAllowed(_))),
                "{ddl} should be rejected"
            );
        }
    }

    #[test]
    fn whitelist_validates_identifiers() {
        // Quote-free invalid name fails identifier validation
        assert!(matches!(
            classify_ddl("CREATE INDEX 1bad ON agent_goals(title)"),
            Err(EngramError::InvalidIdentifier { .. })
        ));
        // The quoted-injection shape dies at the multi-statement check
        assert!(matches!(
            classify_ddl("CREATE INDEX \"idx; DROP TABLE x--\" ON t(c)"),
            Err(EngramError::DdlNotAllowed(_))
        ));
    }

    #[test]
    fn canonical_render_survives_reclassification() {
        let parsed = classify_ddl(
            "CREATE TABLE side (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             kind TEXT NOT NULL DEFAULT 'plain', score REAL DEFAULT 0)",
        )
        .unwrap();
        let canonical = parsed.render().sql;
        // The rendered (quoted) form parses back to the same nodes
        assert_eq!(classify_ddl(&canonical).unwrap(), parsed);
    }

    #[test]
    fn create_index_roundtrip_with_rollback() {
        let dna = inverter();
        let applied = dna
            .apply(
                "CREATE INDEX idx_kb_entity ON agent_knowledge_base(entity)",
                "pre-idx_kb_entity",
            )
            .unwrap();
        assert_eq!(applied.inverse, "DROP INDEX \"idx_kb_entity\"");
        assert_eq!(applied.target_table.as_deref(), Some("agent_knowledge_base"));

        let with_index = Introspector::new(&dna.storage).snapshot().unwrap();
        assert!(with_index.has_index("idx_kb_entity"));

        let matched = dna.rollback(&applied.inverse, applied.snapshot_id).unwrap();
        assert!(matched);
        let after = Introspector::new(&dna.storage).snapshot().unwrap();
        assert!(!after.has_index("idx_kb_entity"));
        assert_eq!(after, dna.load_snapshot(applied.snapshot_id).unwrap());
    }

    #[test]
    fn injected_tail_never_reaches_the_engine() {
        let dna = inverter();
        let err = dna.apply(
            "CREATE INDEX ok ON agent_goals(title); DROP TABLE agent_sessions;--",
            "attack",
        );
        assert!(matches!(err, Err(EngramError::DdlNotAllowed(_))));
        let snapshot = Introspector::new(&dna.storage).snapshot().unwrap();
        assert!(snapshot.table("agent_sessions").is_some(), "no table was dropped");
        assert!(!snapshot.has_index("ok"), "not even the legal head was applied");
    }

    #[test]
    fn add_column_inverse_drops_it() {
        let dna = inverter();
        let applied = dna
            .apply("ALTER TABLE agent_goals ADD COLUMN due_at TEXT", "pre-due_at")
            .unwrap();
        assert_eq!(applied.inverse, "ALTER TABLE \"agent_goals\" DROP COLUMN \"due_at\"");

        let snapshot = Introspector::new(&dna.storage).snapshot().unwrap();
        assert!(snapshot
            .table("agent_goals")
            .unwrap()
            .columns
            .iter()
            .any(|c| c.name == "due_at"));

        assert!(dna.rollback(&applied.inverse, applied.snapshot_id).unwrap());
    }

    #[test]
    fn drop_index_inverse_recreates_it() {
        let dna = inverter();
        dna.apply("CREATE INDEX idx_goal_status ON agent_goals(status)", "pre-create")
            .unwrap();
        let applied = dna.apply("DROP INDEX idx_goal_status", "pre-drop").unwrap();
        // Catalog text went back through the whitelist parser and renderer
        assert_eq!(
            applied.inverse,
            "CREATE INDEX \"idx_goal_status\" ON \"agent_goals\" (\"status\")"
        );

        assert!(dna.rollback(&applied.inverse, applied.snapshot_id).unwrap());
        let snapshot = Introspector::new(&dna.storage).snapshot().unwrap();
        assert!(snapshot.has_index("idx_goal_status"));
    }

    #[test]
    fn failed_ddl_leaves_no_snapshot() {
        let dna = inverter();
        let before: i64 = dna
            .storage
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM agent_snapshots", [], |r| r.get(0)))
            .unwrap();
        // Valid per whitelist, fails at the engine (duplicate table)
        let err = dna.apply("CREATE TABLE agent_sessions (id INTEGER PRIMARY KEY)", "dup");
        assert!(matches!(err, Err(EngramError::MigrationFailed(_))));
        let after: i64 = dna
            .storage
            .with_reader(|conn| conn.query_row("SELECT COUNT(*) FROM agent_snapshots", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn snapshot_loads_back() {
        let dna = inverter();
        let id = dna.snapshot("manual").unwrap();
        let loaded = dna.load_snapshot(id).unwrap();
        assert_eq!(loaded, Introspector::new(&dna.storage).snapshot().unwrap());
        assert!(matches!(
            dna.load_snapshot(999_999),
            Err(EngramError::NotFound { entity: "snapshot", .. })
        ));
    }
}
