pub mod error;
pub mod types;

pub use error::{RelayError, Result};
pub use types::{Did, RecordPath, Tid, Uid};
