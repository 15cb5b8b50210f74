//! Probing loop — the batched add/readback/reset state machine.
//!
//! Walks a listing's add-to-cart controls in order, verifies every click
//! against the identity the position declared up front, and every
//! `flush_threshold` successes hands the shared cart to the reader/resetter
//! and merges the quantities back into the running aggregate. A background
//! dialog arbiter keeps the listing free of interstitial popups; both tasks
//! serialize their DOM interactions through one per-session lock.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cart;
use crate::catalog::{parse_item_code, ProbedProduct, ProductKey, ProductSet};
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::events::{EventBus, ProbeEvent};
use crate::page::{BrowserSession, PageView, WaitPolicy};
use crate::sentinel::ChallengeMonitor;

/// Drives probing runs over one browser session.
///
/// The session's interaction lock and challenge monitor live here; every
/// listing probed through the same `Prober` shares them, and independent
/// sessions share nothing.
pub struct Prober {
    session: Arc<dyn BrowserSession>,
    config: ProbeConfig,
    monitor: ChallengeMonitor,
    events: Arc<EventBus>,
    interaction_lock: Arc<Mutex<()>>,
}

impl Prober {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        config: ProbeConfig,
        monitor: ChallengeMonitor,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            session,
            config,
            monitor,
            events,
            interaction_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the listing URL in a fresh view and probe it.
    pub async fn probe_url(&self, url: &str) -> Result<ProductSet, ProbeError> {
        let view = self.session.new_view().await?;
        view.navigate(url, WaitPolicy::Load, self.config.timeouts.nav())
            .await?;
        let listing: Arc<dyn PageView> = Arc::from(view);
        self.probe(listing, url).await
    }

    /// Probe one listing view. Sole entry point of the engine.
    ///
    /// Returns the aggregated product set. A listing that closes mid-scan
    /// yields the partial aggregate as success; a challenge hit aborts with
    /// [`ProbeError::CaptchaDetected`] instead, because quantities read
    /// under an active defense cannot be trusted.
    pub async fn probe(
        &self,
        listing: Arc<dyn PageView>,
        source: &str,
    ) -> Result<ProductSet, ProbeError> {
        self.wait_listing_ready(&*listing, source).await?;

        let controls = listing.count(&self.config.listing.add_controls).await?;
        self.events.emit(ProbeEvent::ProbeStarted {
            source: source.to_string(),
            controls,
        });

        // Expected-order table: each position's declared identity, captured
        // before any click mutates the page.
        let mut expected: Vec<Option<ProductKey>> = Vec::with_capacity(controls);
        for pos in 0..controls {
            let key = match listing
                .attribute(
                    &self.config.listing.cards,
                    pos,
                    &self.config.listing.code_attr,
                    self.config.timeouts.attribute(),
                )
                .await
            {
                Ok(Some(raw)) => parse_item_code(&raw)
                    .and_then(|code| ProductKey::new(code, source).ok()),
                _ => None,
            };
            if key.is_none() {
                debug!(pos, "card without a parsable identity, skipping position");
            }
            expected.push(key);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let arbiter = spawn_dialog_arbiter(
            Arc::clone(&listing),
            Arc::clone(&self.interaction_lock),
            self.config.clone(),
            stop_rx,
        );

        let outcome = self.scan(&listing, source, &expected).await;

        // The arbiter is signaled and joined on every exit path.
        let _ = stop_tx.send(true);
        let _ = arbiter.await;

        outcome
    }

    /// Scroll until the listing shows enough eligible cards, or a deadline
    /// passes. Lazy-loaded listings only render cards as they come into
    /// view.
    async fn wait_listing_ready(
        &self,
        listing: &dyn PageView,
        source: &str,
    ) -> Result<(), ProbeError> {
        let wanted = self.config.listing.ready_count;
        let deadline = Instant::now() + self.config.timeouts.ready();

        loop {
            let count = listing.count(&self.config.listing.cards).await?;
            if count >= wanted || Instant::now() >= deadline {
                debug!(count, wanted, "listing ready");
                self.events.emit(ProbeEvent::ListingReady {
                    source: source.to_string(),
                    controls: count,
                });
                return Ok(());
            }
            let (delta, pause) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(500..=1000), rng.gen_range(100..=400))
            };
            let _ = listing.scroll_by(delta).await;
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    async fn scan(
        &self,
        listing: &Arc<dyn PageView>,
        source: &str,
        expected: &[Option<ProductKey>],
    ) -> Result<ProductSet, ProbeError> {
        let mut results = ProductSet::new();
        let mut pending: Vec<ProbedProduct> = Vec::new();
        let mut flushes = 0usize;
        let threshold = self.config.flush_threshold as usize;
        let eligible = expected.iter().flatten().count();

        'positions: for (pos, slot) in expected.iter().enumerate() {
            let Some(key) = slot else { continue };

            let mut attempt = 0u32;
            loop {
                if let Some(hit) = self.monitor.tripped() {
                    self.events.emit(ProbeEvent::ChallengeTripped {
                        url: hit.url.clone(),
                        status: hit.status,
                    });
                    return Err(hit.into_error());
                }
                if !listing.is_open() {
                    debug!(pos, "listing closed mid-scan, keeping partial result");
                    break 'positions;
                }

                attempt += 1;
                match self.add_once(&**listing, pos).await {
                    Ok(observed) if observed.as_deref() == Some(key.code()) => {
                        let rank =
                            NonZeroU32::new(pos as u32 + 1).expect("positions are 0-based");
                        pending.push(ProbedProduct::new(key.clone()).with_rank(rank));
                        self.events.emit(ProbeEvent::ProductAdded {
                            code: key.code().to_string(),
                            rank: rank.get(),
                        });
                        break;
                    }
                    Ok(observed) => {
                        // The DOM may have reflowed under the click.
                        debug!(
                            pos,
                            expected = key.code(),
                            observed = observed.as_deref().unwrap_or("<none>"),
                            "identity mismatch after click, retrying position"
                        );
                    }
                    Err(e) => {
                        debug!(pos, attempt, error = %e, "add click failed, retrying position");
                    }
                }

                if attempt >= self.config.retry.click_attempts {
                    if listing.is_open() {
                        return Err(ProbeError::ProbeStalled {
                            position: pos,
                            attempts: attempt,
                        });
                    }
                    break 'positions;
                }
                tokio::time::sleep(self.config.retry.backoff(attempt)).await;
            }

            if pending.len() >= threshold {
                flushes += 1;
                self.flush(flushes, &mut pending, &mut results, source).await?;
            }
        }

        if !pending.is_empty() {
            flushes += 1;
            self.flush(flushes, &mut pending, &mut results, source).await?;
        }

        info!(
            products = results.len(),
            flushes, eligible, "probing run finished"
        );
        self.events.emit(ProbeEvent::ProbeFinished {
            source: source.to_string(),
            products: results.len(),
            flushes,
            covered: results.len(),
            expected: eligible,
        });
        Ok(results)
    }

    /// One atomic add interaction: click the control and immediately read
    /// back the identity it now declares, all under the interaction lock.
    async fn add_once(
        &self,
        listing: &dyn PageView,
        pos: usize,
    ) -> anyhow::Result<Option<String>> {
        let _guard = self.interaction_lock.lock().await;
        listing
            .click(
                &self.config.listing.add_controls,
                pos,
                self.config.timeouts.click(),
            )
            .await?;
        let raw = listing
            .attribute(
                &self.config.listing.cards,
                pos,
                &self.config.listing.code_attr,
                self.config.timeouts.attribute(),
            )
            .await?;
        Ok(raw.and_then(|r| parse_item_code(&r)))
    }

    /// Flushing: read the cart, merge quantities into the aggregate keyed
    /// by the pending batch, clear the cart. Blocking and non-interruptible
    /// relative to the scan; the listing is not touched while it runs.
    async fn flush(
        &self,
        flush_index: usize,
        pending: &mut Vec<ProbedProduct>,
        results: &mut ProductSet,
        source: &str,
    ) -> Result<(), ProbeError> {
        if let Some(hit) = self.monitor.tripped() {
            self.events.emit(ProbeEvent::ChallengeTripped {
                url: hit.url.clone(),
                status: hit.status,
            });
            return Err(hit.into_error());
        }

        let started = Instant::now();
        self.events.emit(ProbeEvent::FlushStarted {
            flush_index,
            batch_size: pending.len(),
        });

        let cart_view = cart::open_cart(&*self.session, &self.config).await?;
        let snapshot = cart::read_stock(&*cart_view, &self.config, source).await?;
        let lines_read = snapshot.products.len();

        for line in snapshot.products.iter() {
            if !pending.iter().any(|p| p.key() == line.key()) {
                // Residue from an earlier partial clear; not part of this
                // batch, so it carries no verified rank.
                debug!(code = line.key().code(), "cart line outside pending batch, ignoring");
            }
        }

        for mut product in pending.drain(..) {
            if let Some(line) = snapshot.products.get(product.key()) {
                product.set_max_qty(line.max_qty());
            }
            results.add(product);
        }

        let residual = cart::clear(&*cart_view, &self.config).await?;
        if residual > 0 {
            warn!(residual, "partial cart clear, next flush may see leftovers");
            self.events.emit(ProbeEvent::PartialCartClear { residual });
        }
        cart_view.close().await?;

        self.events.emit(ProbeEvent::FlushComplete {
            flush_index,
            lines_read,
            unparsed_lines: snapshot.unparsed_lines,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }
}

/// Background task that keeps the listing free of interstitial dialogs.
///
/// Under the shared lock, attempts to dismiss one dialog with a short
/// timeout; a miss is normal. Exits when signaled or when the listing view
/// reports closed.
fn spawn_dialog_arbiter(
    listing: Arc<dyn PageView>,
    lock: Arc<Mutex<()>>,
    config: ProbeConfig,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("dialog arbiter started");
        loop {
            if *stop.borrow() || !listing.is_open() {
                break;
            }
            {
                let _guard = lock.lock().await;
                if listing
                    .click(&config.listing.dialog_close, 0, config.timeouts.dialog())
                    .await
                    .is_ok()
                {
                    debug!("dismissed interstitial dialog");
                }
            }
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(config.timeouts.arbiter_interval()) => {}
            }
        }
        debug!("dialog arbiter stopped");
    })
}
