//! Scripted in-memory site driver for tests.
//!
//! Simulates a listing page, a shared cart, and the interstitial
//! add-to-cart dialog without a browser. The simulated site enforces the
//! same awkward realities the engine is built around: an add click fails
//! while the dialog is open (so the arbiter must dismiss it), cart lines
//! can be unparsable, and the cart page can refuse to load a scripted
//! number of times. Scripted "network responses" are fed through the same
//! sentinel wiring the Chromium driver uses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{BrowserSession, PageView, WaitPolicy};
use crate::config::{
    CartConfig, ListingConfig, ProbeConfig, RetryConfig, SelectorSpec, SignatureEntry, Timeouts,
};
use crate::sentinel::{ChallengeMonitor, Outcome, Sentinel};

/// One product available on the simulated listing.
#[derive(Debug, Clone)]
pub struct SimProduct {
    pub code: String,
    pub ceiling: u32,
}

impl SimProduct {
    pub fn new(code: impl Into<String>, ceiling: u32) -> Self {
        Self {
            code: code.into(),
            ceiling,
        }
    }
}

/// One line currently in the simulated cart.
#[derive(Debug, Clone)]
pub struct SimCartLine {
    pub code: String,
    /// `None` simulates a line whose ceiling control is missing (e.g. an
    /// offer that stopped being purchasable).
    pub ceiling: Option<u32>,
    pub bundle: bool,
    /// `false` simulates a line whose detail link no longer carries an
    /// item code.
    pub parsable_link: bool,
}

/// Scripted faults and their remaining budgets.
#[derive(Debug, Default)]
struct SimScript {
    /// Emit this response through the sentinel after the n-th successful
    /// addition.
    challenge_after_adds: Option<(usize, String, u16)>,
    challenge_emitted: bool,
    /// Report the listing closed after this many successful adds.
    close_listing_after: Option<usize>,
    /// Fail this many cart navigations before letting one through.
    cart_nav_failures: usize,
    /// Return a wrong identity readback this many times at this position.
    verify_mismatches: Option<(usize, usize)>,
}

/// Shared state of the simulated site.
#[derive(Debug)]
pub struct SimSite {
    products: Vec<SimProduct>,
    cart: Vec<SimCartLine>,
    dialog_open: bool,
    successful_adds: usize,
    dialog_dismissals: usize,
    last_add: Option<usize>,
    listing_open: bool,
    script: SimScript,
}

impl SimSite {
    fn new(products: Vec<SimProduct>) -> Self {
        Self {
            products,
            cart: Vec::new(),
            dialog_open: false,
            successful_adds: 0,
            dialog_dismissals: 0,
            last_add: None,
            listing_open: true,
            script: SimScript::default(),
        }
    }

    fn detail_url(code: &str) -> String {
        format!("https://www.emag.ro/-/pd/{code}/")
    }
}

/// Test-facing handle over the simulated site.
#[derive(Clone)]
pub struct SimHandle {
    site: Arc<Mutex<SimSite>>,
}

impl SimHandle {
    pub fn cart_len(&self) -> usize {
        self.site.lock().unwrap().cart.len()
    }

    pub fn dialog_dismissals(&self) -> usize {
        self.site.lock().unwrap().dialog_dismissals
    }

    /// Inject a cart line directly (e.g. a dead bundle offer).
    pub fn push_cart_line(&self, line: SimCartLine) {
        self.site.lock().unwrap().cart.push(line);
    }

    /// Emit a scripted response through the sentinel after the n-th
    /// successful addition (1-based).
    pub fn challenge_after_adds(&self, nth: usize, url: impl Into<String>, status: u16) {
        self.site.lock().unwrap().script.challenge_after_adds = Some((nth, url.into(), status));
    }

    /// Close the listing after the n-th successful addition.
    pub fn close_listing_after(&self, adds: usize) {
        self.site.lock().unwrap().script.close_listing_after = Some(adds);
    }

    /// Make the next n cart navigations fail.
    pub fn fail_cart_navs(&self, n: usize) {
        self.site.lock().unwrap().script.cart_nav_failures = n;
    }

    /// Make the identity readback at `position` return a wrong code for
    /// the first `times` reads after a click.
    pub fn mismatch_at(&self, position: usize, times: usize) {
        self.site.lock().unwrap().script.verify_mismatches = Some((position, times));
    }
}

/// In-memory browser session over a [`SimSite`].
pub struct SimSession {
    site: Arc<Mutex<SimSite>>,
    sentinel: Arc<Sentinel>,
    monitor: ChallengeMonitor,
    cart_url: String,
}

impl SimSession {
    pub fn new(
        products: Vec<SimProduct>,
        sentinel: Arc<Sentinel>,
        monitor: ChallengeMonitor,
        cart_url: impl Into<String>,
    ) -> Self {
        Self {
            site: Arc::new(Mutex::new(SimSite::new(products))),
            sentinel,
            monitor,
            cart_url: cart_url.into(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            site: Arc::clone(&self.site),
        }
    }
}

#[async_trait]
impl BrowserSession for SimSession {
    async fn new_view(&self) -> Result<Box<dyn PageView>> {
        Ok(Box::new(SimView {
            site: Arc::clone(&self.site),
            sentinel: Arc::clone(&self.sentinel),
            monitor: self.monitor.clone(),
            cart_url: self.cart_url.clone(),
            role: Mutex::new(Role::Blank),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Blank,
    Listing,
    Cart,
}

/// A simulated page view. Its role is decided by where it navigates.
pub struct SimView {
    site: Arc<Mutex<SimSite>>,
    sentinel: Arc<Sentinel>,
    monitor: ChallengeMonitor,
    cart_url: String,
    role: Mutex<Role>,
}

impl SimView {
    fn role(&self) -> Role {
        *self.role.lock().unwrap()
    }

    fn feed_response(&self, url: &str, status: u16) {
        if self.sentinel.inspect(url, status) == Outcome::Challenge {
            self.monitor.observe(url, status);
        }
    }
}

#[async_trait]
impl PageView for SimView {
    async fn navigate(&self, url: &str, _wait: WaitPolicy, _timeout: Duration) -> Result<()> {
        if url == self.cart_url {
            let mut site = self.site.lock().unwrap();
            if site.script.cart_nav_failures > 0 {
                site.script.cart_nav_failures -= 1;
                bail!("navigation failed: connection reset");
            }
            drop(site);
            *self.role.lock().unwrap() = Role::Cart;
        } else {
            *self.role.lock().unwrap() = Role::Listing;
        }
        Ok(())
    }

    async fn count(&self, selector: &SelectorSpec) -> Result<usize> {
        let site = self.site.lock().unwrap();
        let n = match marker(selector) {
            "sim:cards" | "sim:add" => site.products.len(),
            "sim:lines" | "sim:line-links" | "sim:ceilings" => {
                site.cart.iter().filter(|l| !l.bundle).count()
            }
            "sim:bundle-lines" | "sim:bundle-links" | "sim:bundle-ceilings" => {
                site.cart.iter().filter(|l| l.bundle).count()
            }
            "sim:removal" => site.cart.len(),
            "sim:dialog-close" => usize::from(site.dialog_open),
            other => bail!("unknown selector {other:?}"),
        };
        Ok(n)
    }

    async fn attribute(
        &self,
        selector: &SelectorSpec,
        nth: usize,
        name: &str,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        let mut site = self.site.lock().unwrap();
        match marker(selector) {
            "sim:cards" if name == "data-url" => {
                let code = match site.products.get(nth) {
                    Some(p) => p.code.clone(),
                    None => bail!("no card at index {nth}"),
                };
                // Scripted reflow: wrong identity right after a click.
                if site.last_add == Some(nth) {
                    if let Some((pos, remaining)) = site.script.verify_mismatches {
                        if pos == nth && remaining > 0 {
                            site.script.verify_mismatches = Some((pos, remaining - 1));
                            return Ok(Some(SimSite::detail_url("ZZZZZZZZZ")));
                        }
                    }
                }
                Ok(Some(SimSite::detail_url(&code)))
            }
            "sim:line-links" | "sim:bundle-links" if name == "href" => {
                let want_bundle = marker(selector) == "sim:bundle-links";
                let line = site
                    .cart
                    .iter()
                    .filter(|l| l.bundle == want_bundle)
                    .nth(nth);
                match line {
                    Some(l) if l.parsable_link => Ok(Some(SimSite::detail_url(&l.code))),
                    Some(_) => Ok(Some("https://sim.shop/offer/expired".to_string())),
                    None => bail!("no cart line at index {nth}"),
                }
            }
            "sim:ceilings" | "sim:bundle-ceilings" if name == "max" => {
                let want_bundle = marker(selector) == "sim:bundle-ceilings";
                let line = site
                    .cart
                    .iter()
                    .filter(|l| l.bundle == want_bundle)
                    .nth(nth);
                match line {
                    Some(l) => Ok(l.ceiling.map(|c| c.to_string())),
                    None => bail!("no cart line at index {nth}"),
                }
            }
            other => bail!("unsupported attribute read {name:?} on {other:?}"),
        }
    }

    async fn click(&self, selector: &SelectorSpec, nth: usize, _timeout: Duration) -> Result<()> {
        let mut site = self.site.lock().unwrap();
        match marker(selector) {
            "sim:add" => {
                if !site.listing_open {
                    bail!("view closed");
                }
                if site.dialog_open {
                    bail!("element is obscured by a dialog");
                }
                let product = match site.products.get(nth) {
                    Some(p) => p.clone(),
                    None => bail!("no add control at index {nth}"),
                };
                site.cart.push(SimCartLine {
                    code: product.code.clone(),
                    ceiling: Some(product.ceiling),
                    bundle: false,
                    parsable_link: true,
                });
                site.dialog_open = true;
                site.successful_adds += 1;
                site.last_add = Some(nth);
                if let Some(limit) = site.script.close_listing_after {
                    if site.successful_adds >= limit {
                        site.listing_open = false;
                    }
                }

                // Scripted challenge response, fired through the same
                // sentinel path the real driver uses.
                if let Some((at, url, status)) = site.script.challenge_after_adds.clone() {
                    if site.successful_adds >= at && !site.script.challenge_emitted {
                        site.script.challenge_emitted = true;
                        drop(site);
                        self.feed_response(&url, status);
                    }
                }
                Ok(())
            }
            "sim:dialog-close" => {
                if site.dialog_open {
                    site.dialog_open = false;
                    site.dialog_dismissals += 1;
                    Ok(())
                } else {
                    bail!("no dialog to dismiss")
                }
            }
            "sim:removal" => {
                if nth >= site.cart.len() {
                    bail!("no removal control at index {nth}");
                }
                site.cart.remove(nth);
                Ok(())
            }
            other => bail!("unsupported click on {other:?}"),
        }
    }

    async fn scroll_by(&self, _delta_y: i64) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        match self.role() {
            Role::Listing => self.site.lock().unwrap().listing_open,
            _ => true,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.role() == Role::Listing {
            self.site.lock().unwrap().listing_open = false;
        }
        Ok(())
    }
}

fn marker(selector: &SelectorSpec) -> &str {
    match selector {
        SelectorSpec::Css(q) | SelectorSpec::XPath(q) => q.as_str(),
    }
}

/// Probe configuration wired to the simulated site's marker selectors,
/// with timeouts tightened for tests.
pub fn sim_config() -> ProbeConfig {
    ProbeConfig {
        cart_url: "https://sim.shop/cart".to_string(),
        flush_threshold: 40,
        listing: ListingConfig {
            cards: SelectorSpec::css("sim:cards"),
            code_attr: "data-url".to_string(),
            add_controls: SelectorSpec::css("sim:add"),
            dialog_close: SelectorSpec::css("sim:dialog-close"),
            ready_count: 0,
        },
        cart: CartConfig {
            lines: SelectorSpec::css("sim:lines"),
            line_links: SelectorSpec::css("sim:line-links"),
            qty_ceilings: SelectorSpec::css("sim:ceilings"),
            bundle_lines: SelectorSpec::css("sim:bundle-lines"),
            bundle_links: SelectorSpec::css("sim:bundle-links"),
            bundle_ceilings: SelectorSpec::css("sim:bundle-ceilings"),
            ceiling_attr: "max".to_string(),
            removal_controls: SelectorSpec::css("sim:removal"),
        },
        retry: RetryConfig {
            click_attempts: 12,
            backoff_base_ms: 5,
            nav_attempts: 3,
            removal_attempts: 3,
        },
        timeouts: Timeouts {
            nav_ms: 1_000,
            click_ms: 50,
            attribute_ms: 50,
            dialog_ms: 10,
            arbiter_interval_ms: 5,
            ready_ms: 100,
            settle_ms: 500,
        },
        signatures: vec![SignatureEntry {
            pattern: r".*?example\.test.*".to_string(),
            status: 511,
        }],
    }
}

/// Generate n distinct valid item codes.
pub fn codes(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("D{i:07}M")).collect()
}
