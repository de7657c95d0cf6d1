//! Persistence layer — libSQL-backed storage for tenants, funnel state,
//! and the conversion ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, NewTenant};
