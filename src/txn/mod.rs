// # Transactions
//
// Snapshot-isolated, optimistically committed transactions. A transaction
// reads at the timestamp it began with, buffers writes privately, and at
// commit validates its read set, journals its effects, and applies them to
// the trees as multi-version values at its commit timestamp.

pub mod manager;
pub mod mvv;
pub mod retry;
pub mod transaction;

pub use manager::TxnManager;
pub use retry::RetryPolicy;
pub use transaction::{Transaction, TxnStatus};
