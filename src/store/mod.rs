//! Durability building blocks: receipt allocation, write-ahead journal, and
//! the content snapshot store that together give the apply pipeline
//! ACID-like guarantees over a plain-text workspace.

pub mod receipt;
pub mod snapshot;
pub mod wal;

pub use receipt::{Receipt, ReceiptAllocator, ReceiptId, ReceiptResult};
pub use snapshot::{SnapshotManifest, SnapshotStore};
pub use wal::{Wal, WalOp, WalRecord};
