//! Trigger Monitor (component G, spec.md §4.7).
//!
//! Two sorted sets per `(symbol, side)`, `sl_index`/`tp_index`, hold the
//! fire score for every attached stop-loss/take-profit. The query
//! direction per side/trigger pair is grounded in
//! `original_source/.../worker_triggers.py`'s own `zrangebyscore` calls
//! (the spec's prose table names the same four conditions, but the
//! exact inclusive-range side is only unambiguous in that source): BUY
//! compares against bid, SELL against ask; SL always queries the side of
//! the range that *includes* the trigger price as the market approaches
//! it from the safe side, TP the opposite.

use crate::core::{Side, Trigger};
use crate::execution::{CloseReason, OrderCloser};
use crate::quote_store::QuoteStore;
use crate::redis_store::{keys, RedisStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SCAN_TICK: Duration = Duration::from_millis(150);
const BATCH: isize = 100;
const PROCESSING_TTL_SECS: u64 = 15;

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

fn score_to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

pub struct TriggerMonitor {
    redis: RedisStore,
    quotes: Arc<QuoteStore>,
    closer: Arc<dyn OrderCloser>,
}

impl TriggerMonitor {
    pub fn new(redis: RedisStore, quotes: Arc<QuoteStore>, closer: Arc<dyn OrderCloser>) -> Self {
        Self { redis, quotes, closer }
    }

    /// Adds a trigger's SL/TP entries to the sorted indexes (called when
    /// an order's SL/TP is set or acknowledged).
    pub async fn register(&self, trigger: &Trigger) -> Result<(), crate::core::EngineError> {
        let side = side_str(trigger.side);
        if let Some(sl) = trigger.stop_loss {
            let score = match trigger.side {
                Side::Buy => sl + trigger_half_spread(trigger),
                Side::Sell => sl - trigger_half_spread(trigger),
            };
            self.redis
                .zadd(&keys::sl_index(&trigger.symbol, side), &trigger.order_id, score_to_f64(score))
                .await?;
        }
        if let Some(tp) = trigger.take_profit {
            let score = match trigger.side {
                Side::Buy => tp + trigger_half_spread(trigger),
                Side::Sell => tp - trigger_half_spread(trigger),
            };
            self.redis
                .zadd(&keys::tp_index(&trigger.symbol, side), &trigger.order_id, score_to_f64(score))
                .await?;
        }
        self.redis.sadd(keys::TRIGGER_ACTIVE_SYMBOLS, &trigger.symbol).await?;
        Ok(())
    }

    pub async fn deregister(&self, order_id: &str, symbol: &str, side: Side) -> Result<(), crate::core::EngineError> {
        let side = side_str(side);
        self.redis.zrem(&keys::sl_index(symbol, side), order_id).await?;
        self.redis.zrem(&keys::tp_index(symbol, side), order_id).await?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SCAN_TICK);
        loop {
            tick.tick().await;
            if let Err(e) = self.scan_once().await {
                warn!(error = ?e, "trigger monitor scan failed");
            }
        }
    }

    async fn scan_once(&self) -> Result<(), crate::core::EngineError> {
        let symbols = self.redis.smembers(keys::TRIGGER_ACTIVE_SYMBOLS).await?;
        for symbol in symbols {
            let Some(quote) = self.quotes.get(&symbol) else { continue };

            let mut candidates: HashMap<String, CloseReason> = HashMap::new();

            if let Some(bid) = quote.bid {
                self.collect_side(&symbol, Side::Buy, bid, &mut candidates).await?;
            }
            if let Some(ask) = quote.ask {
                self.collect_side(&symbol, Side::Sell, ask, &mut candidates).await?;
            }

            for (order_id, reason) in candidates {
                self.try_fire(&order_id, reason).await;
            }
        }
        Ok(())
    }

    /// BUY compares against bid, SELL against ask (spec.md §4.7 table).
    async fn collect_side(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        candidates: &mut HashMap<String, CloseReason>,
    ) -> Result<(), crate::core::EngineError> {
        let side_key = side_str(side);
        let price_f = score_to_f64(price);

        // SL fires when price has moved to or past the stop: BUY/bid<=score
        // (members with score>=price), SELL/ask>=score (members with score<=price).
        let sl_ids = match side {
            Side::Buy => self.redis.zrangebyscore_min(&keys::sl_index(symbol, side_key), price_f, BATCH).await?,
            Side::Sell => self.redis.zrangebyscore_max(&keys::sl_index(symbol, side_key), price_f, BATCH).await?,
        };
        // TP fires on the opposite range.
        let tp_ids = match side {
            Side::Buy => self.redis.zrangebyscore_max(&keys::tp_index(symbol, side_key), price_f, BATCH).await?,
            Side::Sell => self.redis.zrangebyscore_min(&keys::tp_index(symbol, side_key), price_f, BATCH).await?,
        };

        for id in tp_ids {
            candidates.insert(id, CloseReason::Takeprofit);
        }
        // Stoploss takes priority on conflict (spec.md §4.7 step 2).
        for id in sl_ids {
            candidates.insert(id, CloseReason::Stoploss);
        }
        Ok(())
    }

    async fn try_fire(&self, order_id: &str, reason: CloseReason) {
        let sentinel = keys::close_processing(order_id);
        match self.redis.set_nx_ex(&sentinel, "1", PROCESSING_TTL_SECS).await {
            Ok(true) => {}
            Ok(false) => return, // already being processed by this or another replica
            Err(e) => {
                warn!(error = ?e, order_id, "failed acquiring close_processing sentinel");
                return;
            }
        }

        match self.closer.close_order(order_id, reason).await {
            Ok(resp) => debug!(order_id = %resp.order_id, reason = reason.as_str(), "trigger fired"),
            Err(e) => warn!(error = ?e, order_id, "trigger-driven close failed"),
        }
    }
}

fn trigger_half_spread(trigger: &Trigger) -> Decimal {
    // Trigger carries pre-computed scores when known; falls back to zero
    // so a caller that hasn't resolved half_spread yet still registers
    // (the score will be corrected on the order's next SL/TP ack).
    trigger.score_sl.zip(trigger.stop_loss).map(|(s, sl)| (s - sl).abs())
        .or_else(|| trigger.score_tp.zip(trigger.take_profit).map(|(s, tp)| (s - tp).abs()))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn buy_sl_score_adds_half_spread() {
        let sl = dec!(1.0950);
        let half_spread = dec!(0.0001);
        let score = sl + half_spread;
        assert_eq!(score, dec!(1.0951));
    }

    #[test]
    fn sell_tp_score_subtracts_half_spread() {
        let tp = dec!(1.0900);
        let half_spread = dec!(0.0001);
        let score = tp - half_spread;
        assert_eq!(score, dec!(1.0899));
    }
}
