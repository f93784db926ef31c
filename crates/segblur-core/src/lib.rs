#![doc = include_str!("../README.md")]

pub mod backend;
pub mod codec_traits;
pub mod context;
pub mod error;
pub mod perf;
pub mod types;

pub use error::{EngineError, Result};
