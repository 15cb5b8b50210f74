//! End-to-end probing scenarios against the scripted in-memory site.

use std::sync::Arc;

use cartprobe::catalog::{ProductKey, ProductSet};
use cartprobe::config::ProbeConfig;
use cartprobe::error::ProbeError;
use cartprobe::events::{EventBus, ProbeEvent};
use cartprobe::page::sim::{codes, sim_config, SimHandle, SimProduct, SimSession};
use cartprobe::page::BrowserSession;
use cartprobe::probe::Prober;
use cartprobe::sentinel::{ChallengeMonitor, Sentinel};

const LISTING: &str = "https://sim.shop/toys/c";

/// Run a probe over a scripted site, collecting emitted events.
async fn run_probe(
    products: Vec<SimProduct>,
    config: ProbeConfig,
    script: impl FnOnce(&SimHandle),
) -> (
    Result<ProductSet, ProbeError>,
    SimHandle,
    Vec<ProbeEvent>,
) {
    let sentinel = Arc::new(Sentinel::from_table(&config.signatures).expect("signatures compile"));
    let monitor = ChallengeMonitor::new();

    let sim = SimSession::new(
        products,
        sentinel,
        monitor.clone(),
        config.cart_url.clone(),
    );
    let handle = sim.handle();
    script(&handle);

    let events = Arc::new(EventBus::new(1024));
    let mut rx = events.subscribe();

    let session: Arc<dyn BrowserSession> = Arc::new(sim);
    let prober = Prober::new(session, config, monitor, Arc::clone(&events));
    let result = prober.probe_url(LISTING).await;

    let mut collected = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => collected.push(ev),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    (result, handle, collected)
}

fn products(n: usize) -> Vec<SimProduct> {
    codes(n)
        .into_iter()
        .enumerate()
        .map(|(i, code)| SimProduct::new(code, (i % 13) as u32 + 1))
        .collect()
}

fn flush_count(events: &[ProbeEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ProbeEvent::FlushStarted { .. }))
        .count()
}

#[tokio::test]
async fn probes_85_controls_in_3_flushes() {
    let (result, handle, events) = run_probe(products(85), sim_config(), |_| {}).await;

    let set = result.expect("probe succeeds");
    assert_eq!(set.len(), 85);
    assert!(set.iter().all(|p| p.max_qty().is_some()));
    assert_eq!(flush_count(&events), 3);

    // Cart was flushed clean at the end.
    assert_eq!(handle.cart_len(), 0);
}

#[tokio::test]
async fn listing_below_threshold_flushes_exactly_once() {
    let listing = vec![
        SimProduct::new("D6X0QBBBM", 5),
        SimProduct::new("DJ4XKKMBM", 10),
        SimProduct::new("DHTSBQYBM", 3),
    ];
    let (result, _, events) = run_probe(listing, sim_config(), |_| {}).await;

    let set = result.expect("probe succeeds");
    assert_eq!(flush_count(&events), 1);
    assert_eq!(set.len(), 3);

    for (code, expected) in [("D6X0QBBBM", 5), ("DJ4XKKMBM", 10), ("DHTSBQYBM", 3)] {
        let key = ProductKey::new(code, LISTING).unwrap();
        assert_eq!(set.get(&key).expect(code).max_qty(), Some(expected));
    }

    // Ranks follow listing order.
    let key = ProductKey::new("DJ4XKKMBM", LISTING).unwrap();
    assert_eq!(set.get(&key).unwrap().rank().map(|r| r.get()), Some(2));
}

#[tokio::test]
async fn exact_multiple_of_threshold_needs_no_extra_flush() {
    let mut config = sim_config();
    config.flush_threshold = 20;
    let (result, _, events) = run_probe(products(40), config, |_| {}).await;

    assert_eq!(result.expect("probe succeeds").len(), 40);
    assert_eq!(flush_count(&events), 2);
}

#[tokio::test]
async fn challenge_mid_run_aborts_without_further_flushes() {
    let (result, _, events) = run_probe(products(85), sim_config(), |handle| {
        // Fires after the 45th successful addition: one flush in, mid
        // second batch.
        handle.challenge_after_adds(45, "https://example.test/challenge", 511);
    })
    .await;

    let err = result.expect_err("challenge aborts the run");
    assert!(matches!(
        err,
        ProbeError::CaptchaDetected { status: 511, .. }
    ));
    assert_eq!(flush_count(&events), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProbeEvent::ChallengeTripped { status: 511, .. })));
}

#[tokio::test]
async fn listing_closing_mid_scan_returns_partial_result() {
    let (result, _, events) = run_probe(products(30), sim_config(), |handle| {
        handle.close_listing_after(10);
    })
    .await;

    let set = result.expect("partial result is success, not an error");
    assert_eq!(set.len(), 10);
    assert_eq!(flush_count(&events), 1);

    match events.last() {
        Some(ProbeEvent::ProbeFinished {
            covered, expected, ..
        }) => {
            assert_eq!(*covered, 10);
            assert_eq!(*expected, 30);
        }
        other => panic!("expected ProbeFinished, got {other:?}"),
    }
}

#[tokio::test]
async fn identity_mismatch_is_retried_not_escalated() {
    let (result, _, _) = run_probe(products(5), sim_config(), |handle| {
        // Two reflowed readbacks at position 2, then it settles.
        handle.mismatch_at(2, 2);
    })
    .await;

    assert_eq!(result.expect("probe recovers").len(), 5);
}

#[tokio::test]
async fn persistent_mismatch_stalls_the_run() {
    let (result, _, _) = run_probe(products(5), sim_config(), |handle| {
        handle.mismatch_at(1, 1000);
    })
    .await;

    let err = result.expect_err("permanent reflow must stall");
    assert!(matches!(
        err,
        ProbeError::ProbeStalled { position: 1, .. }
    ));
}

#[tokio::test]
async fn cart_unavailable_is_fatal() {
    let (result, _, _) = run_probe(products(3), sim_config(), |handle| {
        handle.fail_cart_navs(100);
    })
    .await;

    assert!(matches!(
        result.expect_err("cart must be reachable"),
        ProbeError::CartUnavailable { .. }
    ));
}

#[tokio::test]
async fn arbiter_dismisses_interstitial_dialogs() {
    let (result, handle, _) = run_probe(products(12), sim_config(), |_| {}).await;

    assert_eq!(result.expect("probe succeeds").len(), 12);
    // Every addition opens a dialog that only the arbiter can close; the
    // scan would deadlock on the second position without it.
    assert!(handle.dialog_dismissals() >= 11);
}
