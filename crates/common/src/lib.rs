//! Common types for the account pool workspace

mod error;

pub use error::{Error, Result};
