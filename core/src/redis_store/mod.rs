//! Thin async Redis wrapper (spec.md §6 key namespace, §9 "Lua atomic
//! script" design note). One [`RedisStore`] holds the shared connection
//! manager; every subsystem takes a `&RedisStore` rather than touching
//! `redis` directly, the way the teacher's engine modules take a shared
//! handle instead of reaching for module-level globals.

pub mod keys;
pub mod order_codec;

use crate::core::{EngineError, InfraError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

fn infra(e: redis::RedisError) -> EngineError {
    EngineError::Infra(InfraError::Redis(e.to_string()))
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url).map_err(infra)?;
        let conn = client.get_tokio_connection_manager().await.map_err(infra)?;
        Ok(Self { conn })
    }

    pub fn raw(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Pipelined batch write of quote updates into `market:{SYMBOL}`
    /// hashes (component B's ~20ms batching window, spec.md §4.2).
    pub async fn write_market_batch(
        &self,
        updates: &[(String, Option<Decimal>, Option<Decimal>, i64)],
    ) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (symbol, bid, ask, ts_ms) in updates {
            let key = keys::market(symbol);
            let mut fields: Vec<(&str, String)> = vec![("ts", ts_ms.to_string())];
            if let Some(b) = bid {
                fields.push(("bid", b.to_string()));
            }
            if let Some(a) = ask {
                fields.push(("ask", a.to_string()));
            }
            pipe.hset_multiple(&key, &fields).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async(&mut conn).await.map_err(infra)
    }

    pub async fn publish(&self, channel: &str, message: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, message).await.map_err(infra)?;
        Ok(())
    }

    /// `SET NX EX` idempotency/lock primitive shared by the idempotency
    /// layer, trigger/pending single-fire sentinels, and auto-cutoff
    /// sentinels.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(infra)?;
        Ok(result.is_some())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(infra)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(infra)?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(infra)?;
        Ok(())
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(infra)?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await.map_err(infra)?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(infra)
    }

    pub async fn scard(&self, key: &str) -> Result<i64, EngineError> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(infra)
    }

    pub async fn hset_all(&self, key: &str, fields: &[(&str, String)]) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await.map_err(infra)?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<std::collections::HashMap<String, String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(infra)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(infra)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, field).await.map_err(infra)?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, EngineError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(infra)
    }

    /// Sorted-set score/member helpers for trigger (§4.7) and pending
    /// (§4.8) indexes.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await.map_err(infra)?;
        Ok(())
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(key, member).await.map_err(infra)?;
        Ok(())
    }

    /// One-sided range query `[-inf, max]`, used for BUY-SL/SELL-TP fires.
    pub async fn zrangebyscore_max(
        &self,
        key: &str,
        max: f64,
        limit: isize,
    ) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(infra)
    }

    /// One-sided range query `[min, +inf]`, used for BUY-TP/SELL-SL fires.
    pub async fn zrangebyscore_min(
        &self,
        key: &str,
        min: f64,
        limit: isize,
    ) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(infra)
    }

    pub async fn smembers_set(&self, key: &str) -> Result<Vec<String>, EngineError> {
        self.smembers(key).await
    }

    /// Full-range dump of a sorted set's members, low score to high.
    /// Used by `oms-admin` to inspect trigger/pending indexes; the scan
    /// loops use the one-sided range queries above instead.
    pub async fn zrange_all(&self, key: &str) -> Result<Vec<String>, EngineError> {
        let mut conn = self.conn.clone();
        conn.zrange(key, 0, -1).await.map_err(infra)
    }

    /// Atomic user-shard order placement (spec.md §4.3 step 8): asserts
    /// the order doesn't already exist, writes the order hash, and
    /// updates the portfolio margin fields, all in one server-side
    /// script so a concurrent placement can't interleave (§9 "Lua atomic
    /// script"). Returns `Ok(true)` on success, `Ok(false)` if the order
    /// already existed.
    pub async fn place_order_atomic(
        &self,
        order_key: &str,
        order_fields: &[(&str, String)],
        portfolio_key: &str,
        used_margin_executed: Decimal,
        used_margin_all: Decimal,
    ) -> Result<bool, EngineError> {
        const SCRIPT: &str = r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return 0
            end
            for i = 1, #ARGV - 1, 2 do
                redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
            end
            redis.call('HSET', KEYS[2], 'used_margin_executed', ARGV[#ARGV - 1], 'used_margin_all', ARGV[#ARGV])
            return 1
        "#;
        let mut args: Vec<String> = Vec::with_capacity(order_fields.len() * 2 + 2);
        for (k, v) in order_fields {
            args.push((*k).to_string());
            args.push(v.clone());
        }
        args.push(used_margin_executed.to_string());
        args.push(used_margin_all.to_string());

        let script = Script::new(SCRIPT);
        let mut invocation = script.key(order_key).key(portfolio_key);
        for a in &args {
            invocation = invocation.arg(a);
        }
        let mut conn = self.conn.clone();
        match invocation.invoke_async::<_, i64>(&mut conn).await {
            Ok(1) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) => {
                warn!(error = %e, "place_order_atomic script failed, caller should fall back to non-atomic sequence");
                Err(infra(e))
            }
        }
    }

    pub fn parse_decimal(raw: &str) -> Option<Decimal> {
        Decimal::from_str(raw).ok()
    }
}
