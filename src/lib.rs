// sqlfs keeps the authoritative filesystem namespace (directories and files)
// in a relational table and serves lookup/create/rename/delete/list against
// an in-memory mirror of that table. Content I/O lives elsewhere; the
// content_ref field is an opaque token passed through unmodified.

pub mod entry;
pub mod entry_store;
pub mod error;
pub mod namespace;
pub mod sqlfs_service;
