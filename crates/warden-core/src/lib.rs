//! Foundational utilities shared across Warden crates.
//!
//! Provides atomic file writes, time helpers, rotated NDJSON appends, the
//! decision ledger sink, and the two lock layers guarding durable state.

pub mod atomic_io;
pub mod ledger;
pub mod log_rotation;
pub mod state_lock;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use ledger::{
    append_ledger, append_ledger_with_policy, ledger_path_for_storage_dir, read_ledger_records,
    DecisionLedger,
};
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};
pub use state_lock::{
    DurableStateGuard, DurableStateLock, FileLock, FileLockConfig, FileLockGuard, InProcessQueue,
    InProcessTurn,
};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_stale_unix_ms};
