//! Error taxonomy for a probing run.
//!
//! Transient faults (click timeouts, identity mismatches after a DOM
//! reflow) are recovered inside the probing loop and never reach callers.
//! What surfaces here is the set of failures a caller must distinguish:
//! retry later (`CartUnavailable`), give up on this listing
//! (`ProbeStalled`), or stop entirely because a defense intervened
//! (`CaptchaDetected`).

use chrono::{DateTime, Utc};

/// Result alias used throughout the probing engine.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// All errors a probing run can surface.
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    /// An item code did not match the fixed identifier format.
    #[error("invalid item code {code:?}")]
    InvalidIdentifier { code: String },

    /// The cart page could not be opened after bounded retries.
    #[error("cart page unavailable after {attempts} attempts")]
    CartUnavailable { attempts: u32 },

    /// A listing position could not be added after bounded retries.
    #[error("probing stalled at position {position} after {attempts} attempts")]
    ProbeStalled { position: usize, attempts: u32 },

    /// A network response matched a bot-challenge signature.
    ///
    /// Fatal: quantities read before the challenge cannot be trusted, so
    /// the run aborts instead of returning a partial result. Must not be
    /// retried automatically.
    #[error("bot challenge detected from {url} (status {status}) at {at}")]
    CaptchaDetected {
        url: String,
        status: u16,
        at: DateTime<Utc>,
    },

    /// A fault in the underlying page-automation driver.
    #[error("page automation error: {0}")]
    Driver(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProbeError::InvalidIdentifier {
            code: "bogus".to_string(),
        };
        assert!(err.to_string().contains("bogus"));

        let err = ProbeError::CartUnavailable { attempts: 3 };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_captcha_error_carries_context() {
        let err = ProbeError::CaptchaDetected {
            url: "https://example.test/challenge".to_string(),
            status: 511,
            at: Utc::now(),
        };
        let msg = err.to_string();
        assert!(msg.contains("example.test"));
        assert!(msg.contains("511"));
    }
}
