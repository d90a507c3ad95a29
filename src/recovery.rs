//! Recovery-side collaborators of the storage runtime.
//!
//! - `transactions`: the active-transaction table and its recLSN bound
//! - `truncation`: when and how far the log may be truncated

pub mod transactions;
pub mod truncation;

pub use transactions::{ActiveTransactions, TransactionState};
pub use truncation::{TruncationConfig, Truncator};
