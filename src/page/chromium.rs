//! Chromium-based page driver using chromiumoxide.
//!
//! Element interaction is JS-driven: selectors are resolved with
//! `querySelectorAll` / `document.evaluate` inside the page, so the engine
//! re-queries the live DOM on every call instead of holding element handles
//! that go stale when the page reflows. Network responses stream through a
//! listener task that feeds the anomaly sentinel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventResponseReceived;
use chromiumoxide::page::Page;
use futures::StreamExt;

use super::{BrowserSession, PageView, WaitPolicy};
use crate::config::SelectorSpec;
use crate::sentinel::{ChallengeMonitor, Outcome, Sentinel};

/// Pause between DOM re-queries while waiting for an element.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. CARTPROBE_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("CARTPROBE_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.cartprobe/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".cartprobe/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".cartprobe/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".cartprobe/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".cartprobe/chromium/chrome-linux64/chrome"),
                home.join(".cartprobe/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A Chromium browser session.
pub struct ChromiumSession {
    browser: Browser,
    sentinel: Arc<Sentinel>,
    monitor: ChallengeMonitor,
}

impl ChromiumSession {
    /// Launch a Chromium instance wired to the given sentinel.
    ///
    /// Every view opened from this session reports its network responses to
    /// the sentinel; challenge hits land in `monitor`.
    pub async fn launch(
        headed: bool,
        sentinel: Arc<Sentinel>,
        monitor: ChallengeMonitor,
    ) -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found. Set CARTPROBE_CHROMIUM_PATH or install Chrome.")?;

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !headed {
            builder = builder.arg("--headless=new");
        }
        let config = builder
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--window-size=1280,900")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        // Spawn the handler task
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            sentinel,
            monitor,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_view(&self) -> Result<Box<dyn PageView>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("failed to attach response listener")?;

        let sentinel = Arc::clone(&self.sentinel);
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            while let Some(ev) = responses.next().await {
                let url = ev.response.url.clone();
                let status = ev.response.status as u16;
                if sentinel.inspect(&url, status) == Outcome::Challenge {
                    tracing::warn!(%url, status, "response matched a challenge signature");
                    monitor.observe(url, status);
                }
            }
        });

        Ok(Box::new(ChromiumView {
            page,
            open: AtomicBool::new(true),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        // Browser is dropped when ChromiumSession is dropped
        Ok(())
    }
}

/// A single Chromium page view.
pub struct ChromiumView {
    page: Page,
    open: AtomicBool,
}

impl ChromiumView {
    async fn eval(&self, script: String) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }
}

#[async_trait]
impl PageView for ChromiumView {
    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()> {
        let result = tokio::time::timeout(timeout, self.page.goto(url)).await;

        match result {
            Ok(Ok(_response)) => {
                if wait != WaitPolicy::Commit {
                    let _ = self.page.wait_for_navigation().await;
                }
                if wait == WaitPolicy::NetworkIdle {
                    // chromiumoxide has no network-idle event; a short
                    // settling pause approximates it
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(())
            }
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {}ms", timeout.as_millis()),
        }
    }

    async fn count(&self, selector: &SelectorSpec) -> Result<usize> {
        let script = format!("(() => {{ return ({}).length; }})()", locate_js(selector));
        let value = self.eval(script).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn attribute(
        &self,
        selector: &SelectorSpec,
        nth: usize,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let script = format!(
            r#"(() => {{
                const el = ({locate})[{nth}];
                if (!el) return {{ found: false, value: null }};
                return {{ found: true, value: el.getAttribute('{name}') }};
            }})()"#,
            locate = locate_js(selector),
            nth = nth,
            name = sanitize_js_string(name),
        );

        let deadline = Instant::now() + timeout;
        loop {
            let value = self.eval(script.clone()).await?;
            let found = value
                .get("found")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if found {
                let attr = value
                    .get("value")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                return Ok(attr);
            }
            if Instant::now() >= deadline {
                bail!("no element at index {nth} for selector within timeout");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &SelectorSpec, nth: usize, timeout: Duration) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const el = ({locate})[{nth}];
                if (!el) return false;
                el.scrollIntoView({{ block: 'center' }});
                el.click();
                return true;
            }})()"#,
            locate = locate_js(selector),
            nth = nth,
        );

        let deadline = Instant::now() + timeout;
        loop {
            let value = self.eval(script.clone()).await?;
            if value.as_bool().unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("no element at index {nth} to click within timeout");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scroll_by(&self, delta_y: i64) -> Result<()> {
        self.eval(format!("window.scrollBy(0, {delta_y})")).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Relaxed);
        let _ = self.page.clone().close().await;
        Ok(())
    }
}

/// JS expression evaluating to an array of elements matching the selector.
fn locate_js(selector: &SelectorSpec) -> String {
    match selector {
        SelectorSpec::Css(query) => format!(
            "Array.from(document.querySelectorAll('{}'))",
            sanitize_js_string(query)
        ),
        SelectorSpec::XPath(expr) => format!(
            r#"(() => {{
                const out = [];
                const it = document.evaluate('{}', document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                for (let i = 0; i < it.snapshotLength; i++) out.push(it.snapshotItem(i));
                return out;
            }})()"#,
            sanitize_js_string(expr)
        ),
    }
}

/// Sanitize a string for safe injection into a JavaScript string literal.
///
/// Escapes all characters that could break out of a JS string context:
/// backslashes, quotes, backticks, newlines, and HTML script tags. Null
/// bytes are stripped.
fn sanitize_js_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '`' => result.push_str("\\`"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\0' => {}
            '<' => result.push_str("\\x3c"),
            '>' => result.push_str("\\x3e"),
            _ => result.push(ch),
        }
    }
    result
}
