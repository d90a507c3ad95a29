pub mod recovery;
pub mod runtime;
pub mod storage;

pub use runtime::{Runtime, RuntimeConfig};
