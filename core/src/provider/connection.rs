//! Provider Connection (component I, spec.md §4.9).
//!
//! One long-lived framed socket to the liquidity provider gateway — a
//! Unix domain socket when colocated (`provider.uds_path`), a TCP
//! fallback otherwise. Every frame is `[u32 BE length][MessagePack
//! body]`, the same envelope the teacher's market listener uses for its
//! own binary feed (just msgpack instead of protobuf+zlib, since there's
//! no compression win on small order/ack frames).
//!
//! Two halves run concurrently under [`ProviderConnection::run`]: a send
//! loop draining a bounded queue onto the socket, and a receive loop
//! parsing frames back off it. Either half exiting (socket closed, write
//! error) tears down both and the outer loop reconnects with
//! [`crate::resilience::backoff`].

use super::types::{ExecutionReport, OutboundMessage};
use crate::amqp::AmqpClient;
use crate::config::ProviderConfig;
use crate::core::{EngineError, ExternalError};
use crate::execution::{ProviderGateway, ProviderOutcome, ProviderSendPayload};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

const SEND_QUEUE_CAPACITY: usize = 1000;
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

fn now_ms() -> i64 {
    crate::quote_store::now_ms()
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Either transport, behind the same `AsyncRead + AsyncWrite` seam so
/// the send/receive loops don't need to care which one is in use.
enum Socket {
    Uds(UnixStream),
    Tcp(TcpStream),
}

impl Socket {
    async fn connect(config: &ProviderConfig) -> Result<Self, EngineError> {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        if let Some(path) = &config.uds_path {
            let fut = UnixStream::connect(path);
            let stream = tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| EngineError::External(ExternalError::ProviderUnreachable))?
                .map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))?;
            return Ok(Socket::Uds(stream));
        }
        if let Some(host) = &config.tcp_host {
            let addr = format!("{}:{}", host, config.tcp_port);
            let fut = TcpStream::connect(&addr);
            let stream = tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| EngineError::External(ExternalError::ProviderUnreachable))?
                .map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))?;
            return Ok(Socket::Tcp(stream));
        }
        Err(EngineError::External(ExternalError::ProviderUnreachable))
    }

    fn split(self) -> (Box<dyn AsyncRead + Unpin + Send>, Box<dyn AsyncWrite + Unpin + Send>) {
        match self {
            Socket::Uds(s) => {
                let (r, w) = tokio::io::split(s);
                (Box::new(r), Box::new(w))
            }
            Socket::Tcp(s) => {
                let (r, w) = tokio::io::split(s);
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Shared state the send/receive loops and the `ProviderGateway`
/// trait impl all touch.
struct Shared {
    config: ProviderConfig,
    amqp: AmqpClient,
    confirmation_queue: String,
    send_tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    waiters: DashMap<String, oneshot::Sender<ProviderOutcome>>,
    /// Receivers parked here by [`ProviderConnection::queue`] until the
    /// matching `send_*`/`await_outcome` pair picks them up. Keyed by
    /// lifecycle id, same as `waiters`.
    pending_receivers: DashMap<String, oneshot::Receiver<ProviderOutcome>>,
    connected: AtomicBool,
    notify_connected: tokio::sync::Notify,
}

/// Component I. Cheap to clone (wraps a single `Arc`); the clone shares
/// the live socket state with the original.
#[derive(Clone)]
pub struct ProviderConnection {
    shared: Arc<Shared>,
}

impl ProviderConnection {
    pub fn new(config: ProviderConfig, amqp: AmqpClient, confirmation_queue: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                amqp,
                confirmation_queue,
                send_tx: Mutex::new(None),
                waiters: DashMap::new(),
                pending_receivers: DashMap::new(),
                connected: AtomicBool::new(false),
                notify_connected: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Runs the reconnect loop forever. Spawn this once at startup.
    pub async fn run(self) {
        let mut backoff = crate::resilience::ExponentialBackoff::with_config(
            crate::resilience::BackoffConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                max_retries: None,
                jitter_factor: 0.1,
            },
        );
        loop {
            match self.run_session().await {
                Ok(()) => info!("provider connection session ended cleanly"),
                Err(e) => warn!(error = ?e, "provider connection session failed"),
            }
            self.shared.connected.store(false, Ordering::SeqCst);
            *self.shared.send_tx.lock().await = None;
            let delay = backoff.next_delay().unwrap_or(Duration::from_secs(30));
            debug!(delay_ms = delay.as_millis() as u64, "reconnecting to provider");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&self) -> Result<(), EngineError> {
        let socket = Socket::connect(&self.shared.config).await?;
        let (mut reader, mut writer) = socket.split();

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(SEND_QUEUE_CAPACITY);
        *self.shared.send_tx.lock().await = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.notify_connected.notify_waiters();
        info!("provider connection established");

        let send_loop = async {
            while let Some(msg) = rx.recv().await {
                let body = match rmp_serde::to_vec_named(&msg) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = ?e, "failed encoding outbound provider message");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &body).await {
                    return Err::<(), std::io::Error>(e);
                }
            }
            Ok(())
        };

        let recv_loop = async {
            loop {
                let frame = read_frame(&mut reader).await?;
                self.handle_frame(&frame).await;
            }
            #[allow(unreachable_code)]
            Ok::<(), std::io::Error>(())
        };

        tokio::select! {
            r = send_loop => { r.map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))?; }
            r = recv_loop => { r.map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))?; }
        }
        Ok(())
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let value: serde_json::Value = match rmp_serde::from_slice(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = ?e, "failed decoding provider frame");
                return;
            }
        };

        let report = if ExecutionReport::looks_like_fix_map(&value) {
            ExecutionReport::from_fix_map(&value, now_ms())
        } else {
            match serde_json::from_value::<ExecutionReport>(value.clone()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = ?e, "unrecognized provider frame shape");
                    return;
                }
            }
        };

        if let Some(id) = report.lifecycle_id() {
            if let Some((_, waiter)) = self.shared.waiters.remove(id) {
                let outcome = outcome_from_report(&report);
                let _ = waiter.send(outcome);
            }
        }

        self.publish_confirmation(&report).await;
    }

    async fn publish_confirmation(&self, report: &ExecutionReport) {
        let channel = match self.shared.amqp.channel().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = ?e, "failed opening amqp channel for confirmation publish");
                return;
            }
        };
        if let Err(e) = self.shared.amqp.declare_durable(&channel, &self.shared.confirmation_queue).await {
            error!(error = ?e, "failed declaring confirmation queue");
            return;
        }
        if let Err(e) = self
            .shared
            .amqp
            .publish_json(&channel, &self.shared.confirmation_queue, report)
            .await
        {
            error!(error = ?e, "failed publishing execution report to confirmation queue");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the persistent connection to become
    /// available. Used by [`Self::send_provider_order`]; never falls
    /// back to a transient socket silently (spec.md §4.9).
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), EngineError> {
        if self.is_connected() {
            return Ok(());
        }
        let wait = self.shared.notify_connected.notified();
        match tokio::time::timeout(timeout, wait).await {
            Ok(_) if self.is_connected() => Ok(()),
            _ => Err(EngineError::External(ExternalError::ProviderUnreachable)),
        }
    }

    /// Direct-send API: waits the configured short window for the
    /// persistent connection, then sends. Reports `ProviderUnreachable`
    /// on timeout rather than opening a throwaway socket.
    pub async fn send_provider_order(&self, payload: ProviderSendPayload) -> Result<(), EngineError> {
        self.wait_until_connected(Duration::from_secs(self.shared.config.send_wait_secs)).await?;
        self.send_order(payload).await
    }

    /// Bootstrap/test-only fallback: opens a single short-lived socket,
    /// sends one frame, and closes it. Never called from the normal
    /// dispatch path — only integration tests that need to exercise a
    /// provider without standing up the reconnect loop.
    pub async fn send_via_transient_socket(&self, msg: OutboundMessage) -> Result<(), EngineError> {
        let socket = Socket::connect(&self.shared.config).await?;
        let (_, mut writer) = socket.split();
        let body = rmp_serde::to_vec_named(&msg)
            .map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))?;
        write_frame(&mut writer, &body)
            .await
            .map_err(|e| EngineError::External(ExternalError::ProviderSendFailed(e.to_string())))
    }

    /// Registers a waiter for `msg`'s lifecycle id and hands it to the
    /// send loop. The matching [`Self::await_outcome`] call picks the
    /// receiver back up out of `pending_receivers`.
    async fn queue(&self, msg: OutboundMessage) -> Result<(), EngineError> {
        let lifecycle_id = msg.lifecycle_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(lifecycle_id.clone(), tx);
        self.shared.pending_receivers.insert(lifecycle_id, rx);

        let guard = self.shared.send_tx.lock().await;
        let sender = guard
            .as_ref()
            .ok_or(EngineError::External(ExternalError::ProviderUnreachable))?;
        sender
            .try_send(msg)
            .map_err(|_| EngineError::External(ExternalError::ProviderSendFailed("send queue full".into())))?;
        Ok(())
    }
}

fn outcome_from_report(report: &ExecutionReport) -> ProviderOutcome {
    match report.ord_status.as_str() {
        "EXECUTED" => ProviderOutcome::Executed {
            avgpx: report.avgpx.unwrap_or(Decimal::ZERO),
        },
        "CANCELLED" | "CANCELED" => ProviderOutcome::Cancelled,
        _ => ProviderOutcome::Rejected,
    }
}

#[async_trait]
impl ProviderGateway for ProviderConnection {
    async fn send_order(&self, payload: ProviderSendPayload) -> Result<(), EngineError> {
        let msg = OutboundMessage::Order {
            order_id: payload.order_id,
            symbol: payload.symbol,
            order_type: payload.order_type,
            order_price: payload.order_price,
            contract_value: payload.contract_value,
            status: payload.status,
            ts: now_ms(),
        };
        self.queue(msg).await?;
        Ok(())
    }

    async fn send_cancel(&self, cancel_id: &str, target_lifecycle_id: &str) -> Result<(), EngineError> {
        let msg = OutboundMessage::Cancel {
            cancel_id: cancel_id.to_string(),
            target_lifecycle_id: target_lifecycle_id.to_string(),
            ts: now_ms(),
        };
        self.queue(msg).await?;
        Ok(())
    }

    async fn send_close(&self, close_id: &str, order_id: &str) -> Result<(), EngineError> {
        let msg = OutboundMessage::Close {
            close_id: close_id.to_string(),
            order_id: order_id.to_string(),
            ts: now_ms(),
        };
        self.queue(msg).await?;
        Ok(())
    }

    async fn await_outcome(&self, lifecycle_id: &str, deadline: Duration) -> Result<ProviderOutcome, EngineError> {
        let rx = self
            .shared
            .pending_receivers
            .remove(lifecycle_id)
            .map(|(_, rx)| rx)
            .ok_or(EngineError::External(ExternalError::CancelAckTimeout))?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Sender dropped (connection torn down before a reply arrived)
            // or the wait itself timed out: either way the caller treats
            // this as a retryable ack timeout.
            Ok(Err(_)) | Err(_) => {
                self.shared.waiters.remove(lifecycle_id);
                Err(EngineError::External(ExternalError::CancelAckTimeout))
            }
        }
    }
}
