//! Shared utilities for AuthBridge

pub mod b64;
pub mod pagination;
pub mod redact;
pub mod throttle;

pub use b64::{decode_json_b64url, encode_json_b64url};
pub use pagination::{paginate_array, Page};
pub use redact::{redact_token, redact_value};
pub use throttle::{ThrottledClient, ThrottleConfig, TokenBucket};
