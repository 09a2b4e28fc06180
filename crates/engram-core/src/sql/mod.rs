//! Query safety pipeline
//!
//! Three layers, lowest first:
//! - `validate` — pure identifier checks, called at node construction
//! - `nodes` — typed operation-tree nodes; constructing one proves safety
//! - `dialect` — node tree → `{sql, params}` for the embedded or networked engine

pub mod dialect;
pub mod nodes;
pub mod validate;

pub use dialect::{quote_identifier, RenderedQuery};
pub use nodes::{
    AddColumn, ColumnDef, ColumnRef, CompareOp, CreateIndex, CreateTable, DeleteQuery, DropColumn,
    DropIndex, DropTable, Identifier, InsertQuery, Predicate, Query, SelectQuery, SortOrder,
    SqlType, SqlValue, TableRef, UpdateQuery,
};
pub use validate::{is_valid_identifier, validate_identifier, IDENTIFIER_BLOCKLIST, MAX_IDENTIFIER_LEN};
