//! Probe configuration — selectors, signature table, thresholds, timeouts.
//!
//! Everything volatile about a target site lives here: the document
//! structure of listing and cart pages (selector specs, including the
//! structural exclusion of sponsored cards), the challenge signature table,
//! the flush threshold, and every retry count and timeout. Loaded from a
//! JSON file; defaults target the site the engine was built against.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// How to locate elements on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorSpec {
    Css(String),
    XPath(String),
}

impl SelectorSpec {
    pub fn xpath(expr: impl Into<String>) -> Self {
        Self::XPath(expr.into())
    }

    pub fn css(query: impl Into<String>) -> Self {
        Self::Css(query.into())
    }
}

/// One challenge signature: URL regex plus the exact status that pairs
/// with it. Both must match for a response to count as a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub pattern: String,
    pub status: u16,
}

/// Selectors for the listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Eligible product cards. Sponsored entries are excluded structurally
    /// by this selector, not by engine logic.
    pub cards: SelectorSpec,
    /// Attribute on each card carrying its detail-page reference; the item
    /// code is parsed out of it.
    pub code_attr: String,
    /// Add-to-cart controls, in the same document order as `cards`.
    pub add_controls: SelectorSpec,
    /// Close control of the interstitial add-to-cart dialog.
    pub dialog_close: SelectorSpec,
    /// How many eligible cards a fully loaded listing is expected to show.
    pub ready_count: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            cards: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "card-item")][not(.//span[starts-with(@class, "card-v2-badge-cmp")])][.//form]"#,
            ),
            code_attr: "data-url".to_string(),
            add_controls: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "card-item")][not(.//span[starts-with(@class, "card-v2-badge-cmp")])][.//form]//form/button"#,
            ),
            dialog_close: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "modal-header")]/button[starts-with(@class, "close")]"#,
            ),
            ready_count: 60,
        }
    }
}

/// Selectors for the cart page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    /// Regular line items.
    pub lines: SelectorSpec,
    /// Detail-page links inside regular lines, one per line.
    pub line_links: SelectorSpec,
    /// Quantity ceiling controls inside regular lines, one per line.
    pub qty_ceilings: SelectorSpec,
    /// Bundle/composite offer lines (a distinct line sub-kind).
    pub bundle_lines: SelectorSpec,
    /// Detail-page links inside bundle lines.
    pub bundle_links: SelectorSpec,
    /// Quantity ceiling controls inside bundle lines.
    pub bundle_ceilings: SelectorSpec,
    /// Attribute on a ceiling control carrying the maximum quantity.
    pub ceiling_attr: String,
    /// Per-line removal controls.
    pub removal_controls: SelectorSpec,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            lines: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-line")]"#,
            ),
            line_links: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-line")]//a[contains(@href, "/pd/")]"#,
            ),
            qty_ceilings: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-line")]//div[@data-phino="Qty"]/input[@max]"#,
            ),
            bundle_lines: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-bundle")]"#,
            ),
            bundle_links: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-bundle")]//a[contains(@href, "/pd/")]"#,
            ),
            bundle_ceilings: SelectorSpec::xpath(
                r#"//div[starts-with(@class, "cart-widget cart-bundle")]//div[@data-phino="Qty"]/input[@max]"#,
            ),
            ceiling_attr: "max".to_string(),
            removal_controls: SelectorSpec::xpath(
                r#"//button[contains(@class, "remove-product")]"#,
            ),
        }
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per listing position before the run stalls out.
    pub click_attempts: u32,
    /// Base backoff between attempts; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Attempts to open the cart page before it counts as unavailable.
    pub nav_attempts: u32,
    /// Attempts per removal control before it is skipped with a warning.
    pub removal_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            click_attempts: 5,
            backoff_base_ms: 200,
            nav_attempts: 3,
            removal_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given 1-based attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << exp))
    }
}

/// All externally tunable timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub nav_ms: u64,
    pub click_ms: u64,
    pub attribute_ms: u64,
    /// Short window for one dialog-dismiss attempt.
    pub dialog_ms: u64,
    /// Pause between dialog-dismiss attempts.
    pub arbiter_interval_ms: u64,
    /// Deadline for the listing readiness scroll loop.
    pub ready_ms: u64,
    /// Deadline for the cart-clear settling pass.
    pub settle_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            nav_ms: 30_000,
            click_ms: 5_000,
            attribute_ms: 2_000,
            dialog_ms: 500,
            arbiter_interval_ms: 250,
            ready_ms: 10_000,
            settle_ms: 10_000,
        }
    }
}

impl Timeouts {
    pub fn nav(&self) -> Duration {
        Duration::from_millis(self.nav_ms)
    }
    pub fn click(&self) -> Duration {
        Duration::from_millis(self.click_ms)
    }
    pub fn attribute(&self) -> Duration {
        Duration::from_millis(self.attribute_ms)
    }
    pub fn dialog(&self) -> Duration {
        Duration::from_millis(self.dialog_ms)
    }
    pub fn arbiter_interval(&self) -> Duration {
        Duration::from_millis(self.arbiter_interval_ms)
    }
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Cart page URL.
    pub cart_url: String,
    /// Successful additions per flush. Must stay below the site's cart
    /// capacity; the default leaves a safety margin under the usual 50.
    pub flush_threshold: u32,
    pub listing: ListingConfig,
    pub cart: CartConfig,
    pub retry: RetryConfig,
    pub timeouts: Timeouts,
    /// Challenge signature table for the anomaly sentinel.
    pub signatures: Vec<SignatureEntry>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            cart_url: "https://www.emag.ro/cart/products".to_string(),
            flush_threshold: 40,
            listing: ListingConfig::default(),
            cart: CartConfig::default(),
            retry: RetryConfig::default(),
            timeouts: Timeouts::default(),
            signatures: Vec::new(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ProbeConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            anyhow::bail!("flush_threshold must be at least 1");
        }
        Url::parse(&self.cart_url)
            .with_context(|| format!("cart_url is not a valid URL: {}", self.cart_url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ProbeConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = ProbeConfig {
            flush_threshold: 0,
            ..ProbeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_cart_url_rejected() {
        let config = ProbeConfig {
            cart_url: "not a url".to_string(),
            ..ProbeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "flush_threshold": 25,
            "signatures": [{ "pattern": ".*?example\\.test.*", "status": 511 }]
        }"#;
        let config: ProbeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.flush_threshold, 25);
        assert_eq!(config.signatures.len(), 1);
        assert_eq!(config.retry.click_attempts, 5);
        assert_eq!(config.timeouts.dialog_ms, 500);
    }

    #[test]
    fn test_selector_spec_roundtrip() {
        let spec = SelectorSpec::css(".cart-line input[max]");
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("css"));
        let parsed: SelectorSpec = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, SelectorSpec::Css(q) if q == ".cart-line input[max]"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        // Capped exponent keeps the backoff bounded.
        assert_eq!(retry.backoff(40), retry.backoff(7));
    }
}
