//! # ReStyle-Core
//!
//! Shared types for the ReStyle pSp encoder: the error type, the `Options`
//! configuration record read at model construction, and compute-device
//! selection.

pub mod device;
pub mod error;
pub mod options;

pub use device::*;
pub use error::{Error, Result};
pub use options::*;
