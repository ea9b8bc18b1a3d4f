//! Market Listener (component B, spec.md §4.2).
//!
//! Maintains one persistent, framed WebSocket connection to the upstream
//! market feed, decompresses/decodes each frame, deduplicates against the
//! last-sent quote per symbol, batches writes into the quote store, and
//! publishes the updated symbol set on the dirty-user bus. Reconnection
//! reuses the teacher's [`crate::resilience::backoff`] exponential-backoff
//! primitive.

pub mod proto;

use crate::core::Quote;
use crate::dirty_bus::DirtyUserBus;
use crate::quote_store::{now_ms, QuoteStore};
use crate::redis_store::RedisStore;
use crate::resilience::backoff::{BackoffConfig, ExponentialBackoff};
use flate2::read::ZlibDecoder;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Epsilon for "changed by more than" comparisons (spec.md §4.2).
const EPSILON: f64 = 1e-5;
/// Keep-alive refresh interval: emit even if unchanged after this long.
const KEEPALIVE_MS: i64 = 5_000;
/// Batching window for pipelined writes.
const BATCH_WINDOW: Duration = Duration::from_millis(20);
/// Force reconnect if no frame arrives within this long.
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);
/// Escalate after this many consecutive connection failures.
const MAX_CONSECUTIVE_FAILURES: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
struct LastSent {
    bid: Option<f64>,
    ask: Option<f64>,
    last_emit_ms: i64,
}

pub struct MarketListener {
    ws_url: String,
    quotes: Arc<QuoteStore>,
    redis: RedisStore,
    dirty_bus: Arc<DirtyUserBus>,
    last_sent: Mutex<HashMap<String, LastSent>>,
}

impl MarketListener {
    pub fn new(
        ws_url: String,
        quotes: Arc<QuoteStore>,
        redis: RedisStore,
        dirty_bus: Arc<DirtyUserBus>,
    ) -> Self {
        Self {
            ws_url,
            quotes,
            redis,
            dirty_bus,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Runs forever, reconnecting with exponential backoff. Returns only
    /// after `MAX_CONSECUTIVE_FAILURES` consecutive connection failures
    /// (the caller's supervisor should treat that as an escalation).
    pub async fn run(self: Arc<Self>) {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: None,
            jitter_factor: 0.1,
        });
        let mut consecutive_failures = 0usize;

        loop {
            match self.connect_and_consume().await {
                Ok(()) => {
                    info!("market listener connection closed cleanly, reconnecting");
                    backoff.reset();
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, consecutive_failures, "market listener connection failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            "market listener failed {} consecutive times, escalating",
                            consecutive_failures
                        );
                        return;
                    }
                }
            }

            if let Some(delay) = backoff.next_delay() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn connect_and_consume(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.ws_url).await?;
        info!(url = %self.ws_url, "market listener connected");
        let (mut write, mut read) = ws_stream.split();

        let mut pending: HashMap<String, (Option<Decimal>, Option<Decimal>, i64)> = HashMap::new();
        let mut flush_interval = tokio::time::interval(BATCH_WINDOW);

        loop {
            tokio::select! {
                frame = tokio::time::timeout(FRAME_TIMEOUT, read.next()) => {
                    let frame = frame.map_err(|_| anyhow::anyhow!("no frame within {:?}, forcing reconnect", FRAME_TIMEOUT))?;
                    match frame {
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Err(e) = self.handle_frame(&bytes, &mut pending).await {
                                warn!(error = %e, "failed decoding market frame, ignoring");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            // Server-driven keepalive: respond, never initiate our own.
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = flush_interval.tick() => {
                    self.flush_pending(&mut pending).await;
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        bytes: &[u8],
        pending: &mut HashMap<String, (Option<Decimal>, Option<Decimal>, i64)>,
    ) -> anyhow::Result<()> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        let update: proto::MarketUpdate = prost::Message::decode(decompressed.as_slice())?;
        let Some(data) = update.data else {
            return Ok(());
        };

        let now = now_ms();
        let mut last_sent = self.last_sent.lock().await;

        for (symbol, entry) in data.prices {
            let symbol = symbol.to_uppercase();
            let ask = Decimal::from_f64(entry.buy);
            let bid = Decimal::from_f64(entry.sell);

            let slot = last_sent.entry(symbol.clone()).or_default();
            let changed = side_changed(slot.bid, entry.sell) || side_changed(slot.ask, entry.buy);
            let keepalive_due = now - slot.last_emit_ms >= KEEPALIVE_MS;

            if changed || keepalive_due {
                slot.bid = Some(entry.sell);
                slot.ask = Some(entry.buy);
                slot.last_emit_ms = now;
                pending.insert(symbol, (bid, ask, now));
            }
        }
        Ok(())
    }

    async fn flush_pending(
        &self,
        pending: &mut HashMap<String, (Option<Decimal>, Option<Decimal>, i64)>,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch: Vec<_> = pending.drain().collect();

        for (symbol, (bid, ask, ts)) in &batch {
            self.quotes.put_partial(symbol, *bid, *ask, *ts);
        }

        let redis_batch: Vec<_> = batch
            .iter()
            .map(|(s, (b, a, t))| (s.clone(), *b, *a, *t))
            .collect();
        if let Err(e) = self.redis.write_market_batch(&redis_batch).await {
            warn!(error = ?e, "failed writing market batch to redis");
        }

        let symbols: Vec<String> = batch.into_iter().map(|(s, _)| s).collect();
        debug!(count = symbols.len(), "flushed market batch");
        self.dirty_bus.publish_market_update(symbols).await;
    }
}

fn side_changed(previous: Option<f64>, incoming: f64) -> bool {
    match previous {
        None => true,
        Some(prev) => (prev - incoming).abs() > EPSILON,
    }
}

/// Reconstructs a [`Quote`] view for tests without going through the
/// network path.
#[allow(dead_code)]
fn quote_from_sides(bid: Option<Decimal>, ask: Option<Decimal>, ts_ms: i64) -> Quote {
    let mut q = Quote::empty(ts_ms);
    q.merge_partial(bid, ask, ts_ms);
    q
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_changed_detects_epsilon_crossing() {
        assert!(!side_changed(Some(1.10000), 1.100005));
        assert!(side_changed(Some(1.10000), 1.10002));
        assert!(side_changed(None, 1.10000));
    }
}
