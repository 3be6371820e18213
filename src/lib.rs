pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod process;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
