pub mod utils;
pub mod verdict;

pub use verdict::{ExecutionStatus, Verdict};
