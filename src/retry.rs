//! Classifying errors as transient or fatal.
//!
//! The retry loop around batch jobs is round-based and lives in the
//! coordinator. This module answers the narrower question asked by the
//! polling loop: is this HTTP error worth polling through, or should it
//! abort the run?

use reqwest::StatusCode;

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been
/// observed in the wild, investigated and determined to be transient. This
/// prevents us from polling forever through errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient.
            // Unfortunately, there are a lot of things that can go wrong, and
            // `reqwest` doesn't expose most of them in sufficient detail to
            // be certain which are transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}
