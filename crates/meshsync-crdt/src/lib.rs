//! Reference delta-state CRDTs for meshsync.
//!
//! The replication engine treats documents as opaque [`Shared`] values. This
//! crate provides a concrete one, [`AppendLog`], used by the daemon and by
//! the convergence tests.
//!
//! ```text
//! ┌──────────────┐   push(value)    ┌──────────────────────────┐
//! │  local edit  │ ───────────────▶ │ AppendLog                │
//! └──────────────┘                  │  entries (author, seq)   │
//!                                   │  clock (contiguous/auth) │
//! ┌──────────────┐  apply(record)   │                          │
//! │  replication │ ───────────────▶ │  watch: clock changed ───┼──▶ sessions
//! └──────────────┘                  └──────────────────────────┘
//! ```

pub mod append_log;

pub use append_log::{AppendLog, LogEntry, APPEND_LOG_TYPE};
pub use meshsync_proto::Shared;
