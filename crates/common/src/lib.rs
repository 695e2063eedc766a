//! Common types shared by the OpenKMS client crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
