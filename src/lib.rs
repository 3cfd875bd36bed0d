//! Storage engine for hierarchical note documents.
//!
//! A document is a tree of rich-text nodes persisted in one of three formats
//! (SQLite `.ctb`, XML `.ctd`, or a directory per node), optionally packed into a
//! password-protected archive (`.ctx`, `.ctz`). [`control::StorageControl`] is the
//! entry point: it loads a document, tracks edits in a [`sync::SyncPending`]
//! ledger and saves only what changed, keeping rotating backups on the side.

pub mod config;
pub mod control;
pub mod document;
pub mod errors;
pub mod logging;
pub mod storage;
pub mod sync;

pub use config::StorageConfig;
pub use control::{ControlState, LoadOutcome, PasswordPrompt, StorageControl};
pub use document::{Document, NodeContent, NodeId, NodeProps};
pub use errors::StorageError;
pub use storage::{DocFormat, DocType, StorageEntity};
pub use sync::SyncPending;
