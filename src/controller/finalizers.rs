//! Finalizer protecting VerticaDB resources
//!
//! The finalizer lets the operator drop per-database state, such as the
//! cached superuser password, before the VerticaDB goes away.

pub const VERTICADB_FINALIZER: &str = "vertica.com/finalizer";
