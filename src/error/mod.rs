//! Error handling module for AuthBridge

mod error;

pub use error::{BridgeError, Result};
