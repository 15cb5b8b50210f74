//! Page-automation abstraction.
//!
//! Defines the `BrowserSession` and `PageView` traits that the probing
//! engine consumes. The concrete engine is Chromium (see [`chromium`]); the
//! `testkit` feature adds a scripted in-memory driver for tests.

pub mod chromium;
#[cfg(any(test, feature = "testkit"))]
pub mod sim;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::SelectorSpec;

/// How long to wait after navigation before the page counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return as soon as the navigation commits.
    Commit,
    /// Wait for the load event.
    Load,
    /// Wait for the load event plus a short network settling pause.
    NetworkIdle,
}

/// A browser session owning one or more page views.
///
/// One session maps to one logical browser instance; independent sessions
/// never share carts, locks, or views.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Open a fresh page view.
    async fn new_view(&self) -> Result<Box<dyn PageView>>;

    /// Shut down the session and every view it owns.
    async fn shutdown(&self) -> Result<()>;
}

/// A single page view (tab) the engine can interact with.
///
/// Element addressing is positional: callers locate elements with a
/// selector spec and refer to the n-th match in document order. Selector
/// lists are re-queried on every call, never cached, so positions stay
/// valid across DOM mutations.
#[async_trait]
pub trait PageView: Send + Sync {
    /// Navigate to a URL.
    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()>;

    /// Number of elements currently matching the selector.
    async fn count(&self, selector: &SelectorSpec) -> Result<usize>;

    /// Read an attribute from the n-th matching element. `Ok(None)` means
    /// the element exists but lacks the attribute.
    async fn attribute(
        &self,
        selector: &SelectorSpec,
        nth: usize,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Click the n-th matching element, waiting up to `timeout` for it to
    /// appear.
    async fn click(&self, selector: &SelectorSpec, nth: usize, timeout: Duration) -> Result<()>;

    /// Scroll the view vertically by the given pixel delta.
    async fn scroll_by(&self, delta_y: i64) -> Result<()>;

    /// Whether the view is still open and usable.
    fn is_open(&self) -> bool;

    /// Close the view.
    async fn close(&self) -> Result<()>;
}
