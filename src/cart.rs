//! Cart readback and reset.
//!
//! The cart is the measurement instrument: after a batch of additions, each
//! line's quantity ceiling control reports how many units the site will
//! actually sell. Reading is per-line best-effort (one dead line never
//! aborts the read); clearing is best-effort too, so callers must re-check
//! before relying on an empty cart.

use std::time::Instant;

use tracing::{debug, warn};

use crate::catalog::{parse_item_code, CartSnapshot, ProbedProduct, ProductKey};
use crate::config::{ProbeConfig, SelectorSpec};
use crate::error::ProbeError;
use crate::page::{BrowserSession, PageView, WaitPolicy};

/// Open the cart page in a fresh view, retrying navigation a bounded
/// number of times. Exhausting the retries is fatal to the probing run.
pub async fn open_cart(
    session: &dyn BrowserSession,
    config: &ProbeConfig,
) -> Result<Box<dyn PageView>, ProbeError> {
    let view = session.new_view().await?;
    let attempts = config.retry.nav_attempts;

    for attempt in 1..=attempts {
        debug!(attempt, attempts, "opening cart page");
        match view
            .navigate(&config.cart_url, WaitPolicy::NetworkIdle, config.timeouts.nav())
            .await
        {
            Ok(()) => return Ok(view),
            Err(e) => warn!(attempt, error = %e, "cart navigation failed"),
        }
    }

    let _ = view.close().await;
    Err(ProbeError::CartUnavailable { attempts })
}

/// Read the quantity ceiling of every cart line.
///
/// Regular and bundle lines are enumerated separately. A line whose detail
/// link cannot be resolved to an item code is counted as unparsed; a line
/// whose ceiling cannot be read is recorded with quantity 0, never dropped.
pub async fn read_stock(
    view: &dyn PageView,
    config: &ProbeConfig,
    source: &str,
) -> Result<CartSnapshot, ProbeError> {
    let mut snapshot = CartSnapshot::default();

    read_lines(
        view,
        config,
        &config.cart.lines,
        &config.cart.line_links,
        &config.cart.qty_ceilings,
        source,
        &mut snapshot,
    )
    .await?;
    read_lines(
        view,
        config,
        &config.cart.bundle_lines,
        &config.cart.bundle_links,
        &config.cart.bundle_ceilings,
        source,
        &mut snapshot,
    )
    .await?;

    Ok(snapshot)
}

async fn read_lines(
    view: &dyn PageView,
    config: &ProbeConfig,
    lines: &SelectorSpec,
    links: &SelectorSpec,
    ceilings: &SelectorSpec,
    source: &str,
    snapshot: &mut CartSnapshot,
) -> Result<(), ProbeError> {
    let count = view.count(lines).await?;
    let attr_timeout = config.timeouts.attribute();

    for idx in 0..count {
        let href = match view.attribute(links, idx, "href", attr_timeout).await {
            Ok(Some(href)) => href,
            Ok(None) => {
                warn!(idx, "cart line link has no href");
                snapshot.unparsed_lines += 1;
                continue;
            }
            Err(e) => {
                warn!(idx, error = %e, "failed to read cart line link");
                snapshot.unparsed_lines += 1;
                continue;
            }
        };

        let key = match parse_item_code(&href).map(|code| ProductKey::new(code, source)) {
            Some(Ok(key)) => key,
            _ => {
                warn!(idx, %href, "cart line link carries no item code");
                snapshot.unparsed_lines += 1;
                continue;
            }
        };

        let ceiling = match view
            .attribute(ceilings, idx, &config.cart.ceiling_attr, attr_timeout)
            .await
        {
            Ok(Some(raw)) => match raw.parse::<u32>() {
                Ok(qty) => qty,
                Err(_) => {
                    warn!(idx, code = key.code(), %raw, "unparsable quantity ceiling");
                    0
                }
            },
            Ok(None) => {
                warn!(idx, code = key.code(), "cart line has no ceiling attribute");
                0
            }
            Err(e) => {
                warn!(idx, code = key.code(), error = %e, "failed to read quantity ceiling");
                0
            }
        };

        debug!(code = key.code(), ceiling, "cart line read");
        let mut product = ProbedProduct::new(key);
        product.set_max_qty(Some(ceiling));
        snapshot.products.add(product);
    }

    Ok(())
}

/// Empty the cart, best-effort.
///
/// Bulk pass first: repeatedly click the first non-skipped removal control,
/// re-querying the control list after every removal so positions stay valid
/// as the list shrinks. Then a settling pass polls for stragglers under a
/// deadline. Returns the number of residual lines left behind.
pub async fn clear(view: &dyn PageView, config: &ProbeConfig) -> Result<usize, ProbeError> {
    let removal = &config.cart.removal_controls;
    let click_timeout = config.timeouts.click();

    // Bulk pass. `skipped` counts controls that kept erroring and were left
    // in place; they are retried again in the settling pass.
    let mut skipped = 0usize;
    loop {
        let remaining = view.count(removal).await?;
        if remaining <= skipped {
            break;
        }
        if !remove_one(view, config, skipped, click_timeout).await {
            skipped += 1;
        }
    }

    // Settling pass: anything that re-rendered late or was skipped above.
    let deadline = Instant::now() + config.timeouts.settle();
    loop {
        let remaining = view.count(removal).await?;
        if remaining == 0 || Instant::now() >= deadline {
            break;
        }
        if !remove_one(view, config, 0, config.timeouts.dialog()).await {
            tokio::time::sleep(config.timeouts.arbiter_interval()).await;
        }
    }

    let residual = view.count(removal).await?;
    if residual > 0 {
        warn!(residual, "cart not fully cleared");
    }
    Ok(residual)
}

/// Click one removal control with bounded retries. Returns whether the
/// click eventually succeeded.
async fn remove_one(
    view: &dyn PageView,
    config: &ProbeConfig,
    idx: usize,
    timeout: std::time::Duration,
) -> bool {
    for attempt in 1..=config.retry.removal_attempts {
        match view.click(&config.cart.removal_controls, idx, timeout).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(idx, attempt, error = %e, "removal click failed");
                tokio::time::sleep(config.retry.backoff(attempt)).await;
            }
        }
    }
    warn!(idx, "removal control kept failing, skipping");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::sim::{sim_config, SimCartLine, SimProduct, SimSession};
    use crate::sentinel::{ChallengeMonitor, Sentinel};
    use std::sync::Arc;

    fn session(products: Vec<SimProduct>) -> (SimSession, ProbeConfig) {
        let config = sim_config();
        let sentinel = Arc::new(Sentinel::from_table(&config.signatures).unwrap());
        let session = SimSession::new(
            products,
            sentinel,
            ChallengeMonitor::new(),
            config.cart_url.clone(),
        );
        (session, config)
    }

    #[tokio::test]
    async fn test_read_stock_reports_ceilings() {
        let (session, config) = session(vec![]);
        let handle = session.handle();
        for (code, ceiling) in [("D6X0QBBBM", 5), ("DJ4XKKMBM", 10), ("DHTSBQYBM", 3)] {
            handle.push_cart_line(SimCartLine {
                code: code.to_string(),
                ceiling: Some(ceiling),
                bundle: false,
                parsable_link: true,
            });
        }

        let cart = open_cart(&session, &config).await.unwrap();
        let snapshot = read_stock(&*cart, &config, "listing-1").await.unwrap();

        assert_eq!(snapshot.products.len(), 3);
        assert_eq!(snapshot.unparsed_lines, 0);
        let key = ProductKey::new("DJ4XKKMBM", "listing-1").unwrap();
        assert_eq!(snapshot.products.get(&key).unwrap().max_qty(), Some(10));
    }

    #[tokio::test]
    async fn test_dead_ceiling_recorded_as_zero() {
        let (session, config) = session(vec![]);
        let handle = session.handle();
        handle.push_cart_line(SimCartLine {
            code: "D6X0QBBBM".to_string(),
            ceiling: None,
            bundle: true,
            parsable_link: true,
        });

        let cart = open_cart(&session, &config).await.unwrap();
        let snapshot = read_stock(&*cart, &config, "listing-1").await.unwrap();

        let key = ProductKey::new("D6X0QBBBM", "listing-1").unwrap();
        assert_eq!(snapshot.products.get(&key).unwrap().max_qty(), Some(0));
        assert_eq!(snapshot.unparsed_lines, 0);
    }

    #[tokio::test]
    async fn test_unparsable_link_counted_not_dropped_silently() {
        let (session, config) = session(vec![]);
        let handle = session.handle();
        handle.push_cart_line(SimCartLine {
            code: "D6X0QBBBM".to_string(),
            ceiling: Some(4),
            bundle: false,
            parsable_link: false,
        });

        let cart = open_cart(&session, &config).await.unwrap();
        let snapshot = read_stock(&*cart, &config, "listing-1").await.unwrap();

        assert_eq!(snapshot.products.len(), 0);
        assert_eq!(snapshot.unparsed_lines, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_cart() {
        let (session, config) = session(vec![]);
        let handle = session.handle();
        for i in 0..7 {
            handle.push_cart_line(SimCartLine {
                code: format!("D{i:07}M"),
                ceiling: Some(1),
                bundle: i % 3 == 0,
                parsable_link: true,
            });
        }

        let cart = open_cart(&session, &config).await.unwrap();
        let residual = clear(&*cart, &config).await.unwrap();

        assert_eq!(residual, 0);
        assert_eq!(handle.cart_len(), 0);
    }

    #[tokio::test]
    async fn test_cart_unavailable_after_bounded_retries() {
        let (session, config) = session(vec![]);
        session.handle().fail_cart_navs(10);

        let err = open_cart(&session, &config).await.err().unwrap();
        assert!(matches!(err, ProbeError::CartUnavailable { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_cart_opens_after_transient_nav_failures() {
        let (session, config) = session(vec![]);
        session.handle().fail_cart_navs(2);

        assert!(open_cart(&session, &config).await.is_ok());
    }
}
