//! Anomaly sentinel — bot-challenge detection over observed responses.
//!
//! The sentinel holds a table of challenge signatures (URL pattern plus
//! expected status). A response is a challenge only when its URL matches the
//! pattern AND its status equals the configured value; a matching URL with a
//! different status stays clear. Signature tables are configuration, because
//! target sites and defense vendors vary.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::SignatureEntry;
use crate::error::ProbeError;

/// Verdict for a single observed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clear,
    Challenge,
}

/// One challenge signature: URL pattern plus the exact status it pairs with.
#[derive(Debug, Clone)]
pub struct ChallengeSignature {
    pub pattern: Regex,
    pub status: u16,
}

/// Inspects responses against the configured signature table.
#[derive(Debug, Clone, Default)]
pub struct Sentinel {
    signatures: Vec<ChallengeSignature>,
}

impl Sentinel {
    pub fn new(signatures: Vec<ChallengeSignature>) -> Self {
        Self { signatures }
    }

    /// Compile a sentinel from configuration entries.
    pub fn from_table(entries: &[SignatureEntry]) -> Result<Self, regex::Error> {
        let signatures = entries
            .iter()
            .map(|e| {
                Ok(ChallengeSignature {
                    pattern: Regex::new(&e.pattern)?,
                    status: e.status,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { signatures })
    }

    /// Classify one observed response.
    pub fn inspect(&self, url: &str, status: u16) -> Outcome {
        for sig in &self.signatures {
            if sig.status == status && sig.pattern.is_match(url) {
                return Outcome::Challenge;
            }
        }
        Outcome::Clear
    }
}

/// A recorded challenge hit: which response tripped, and when.
#[derive(Debug, Clone)]
pub struct ChallengeHit {
    pub url: String,
    pub status: u16,
    pub at: DateTime<Utc>,
}

impl ChallengeHit {
    /// Convert the hit into the fatal error the probing loop propagates.
    pub fn into_error(self) -> ProbeError {
        ProbeError::CaptchaDetected {
            url: self.url,
            status: self.status,
            at: self.at,
        }
    }
}

/// Shared abort cell between the driver's response feed and the probing
/// loop. The feed records the first challenge hit; the loop polls it at
/// every interaction boundary and unwinds when tripped.
#[derive(Debug, Clone, Default)]
pub struct ChallengeMonitor {
    hit: Arc<Mutex<Option<ChallengeHit>>>,
}

impl ChallengeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a challenge. The first hit wins; later hits are ignored.
    pub fn observe(&self, url: impl Into<String>, status: u16) {
        let mut slot = self.hit.lock().expect("challenge cell poisoned");
        if slot.is_none() {
            *slot = Some(ChallengeHit {
                url: url.into(),
                status,
                at: Utc::now(),
            });
        }
    }

    /// The recorded hit, if any response has tripped a signature.
    pub fn tripped(&self) -> Option<ChallengeHit> {
        self.hit.lock().expect("challenge cell poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> Sentinel {
        Sentinel::from_table(&[SignatureEntry {
            pattern: r".*?example\.test.*".to_string(),
            status: 511,
        }])
        .expect("table compiles")
    }

    #[test]
    fn test_matching_url_and_status_is_challenge() {
        let s = sentinel();
        assert_eq!(
            s.inspect("https://example.test/challenge", 511),
            Outcome::Challenge
        );
    }

    #[test]
    fn test_matching_url_wrong_status_is_clear() {
        let s = sentinel();
        assert_eq!(s.inspect("https://example.test/challenge", 200), Outcome::Clear);
        assert_eq!(s.inspect("https://example.test/challenge", 403), Outcome::Clear);
    }

    #[test]
    fn test_non_matching_url_is_clear_for_any_status() {
        let s = sentinel();
        for status in [200, 403, 511, 503] {
            assert_eq!(s.inspect("https://shop.example.com/cart", status), Outcome::Clear);
        }
    }

    #[test]
    fn test_monitor_keeps_first_hit() {
        let monitor = ChallengeMonitor::new();
        assert!(monitor.tripped().is_none());

        monitor.observe("https://example.test/a", 511);
        monitor.observe("https://example.test/b", 429);

        let hit = monitor.tripped().expect("tripped");
        assert_eq!(hit.url, "https://example.test/a");
        assert_eq!(hit.status, 511);
    }

    #[test]
    fn test_hit_converts_to_fatal_error() {
        let monitor = ChallengeMonitor::new();
        monitor.observe("https://example.test/challenge", 511);
        let err = monitor.tripped().unwrap().into_error();
        assert!(matches!(
            err,
            ProbeError::CaptchaDetected { status: 511, .. }
        ));
    }
}
