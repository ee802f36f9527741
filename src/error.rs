//! Shared error classification.
//!
//! Every error enum in the crate maps to a grepable `E_*` code and a
//! retryable flag so hosts can decide how loudly to surface a failure.

/// Stable, grepable classification for error enums.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
