//! Durable RabbitMQ queue wrapper (spec.md §5/§6). One [`AmqpClient`] per
//! process, cloned per-consumer `Channel`s carrying the prefetch counts
//! named in §5 ("every worker sets a finite prefetch").

use crate::core::{EngineError, InfraError};
use futures_util::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    Consumer,
};
use serde::Serialize;
use tracing::{error, info};

fn infra(e: lapin::Error) -> EngineError {
    EngineError::Infra(InfraError::Amqp(e.to_string()))
}

#[derive(Clone)]
pub struct AmqpClient {
    conn: std::sync::Arc<Connection>,
}

impl AmqpClient {
    pub async fn connect(url: &str) -> Result<Self, EngineError> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(infra)?;
        info!("connected to RabbitMQ");
        Ok(Self {
            conn: std::sync::Arc::new(conn),
        })
    }

    pub async fn channel(&self) -> Result<Channel, EngineError> {
        self.conn.create_channel().await.map_err(infra)
    }

    /// Declare a durable queue (every queue in §6 is durable).
    pub async fn declare_durable(&self, channel: &Channel, name: &str) -> Result<(), EngineError> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(infra)?;
        Ok(())
    }

    /// Publish a persistent JSON message to the default exchange (direct
    /// routing to a queue of the same name), matching `db_update`/worker
    /// queue usage in the original.
    pub async fn publish_json<T: Serialize>(
        &self,
        channel: &Channel,
        queue: &str,
        payload: &T,
    ) -> Result<(), EngineError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| EngineError::Infra(InfraError::Amqp(e.to_string())))?;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(infra)?
            .await
            .map_err(infra)?;
        Ok(())
    }

    /// Create a consumer with the given prefetch (§5 per-worker prefetch
    /// counts: open 64, close 64, dispatcher 100, cancel 256, SL/TP 128,
    /// pending 64, reject 1).
    pub async fn consume(
        &self,
        channel: &Channel,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Consumer, EngineError> {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(infra)?;
        channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(infra)
    }
}

/// Acks a delivery after successful processing; nacks-with-requeue on
/// recoverable failure, or acks-and-drops after exhausting retries (§7
/// worker propagation policy).
pub async fn ack(delivery: &lapin::message::Delivery) -> Result<(), EngineError> {
    delivery
        .ack(BasicAckOptions::default())
        .await
        .map_err(infra)
}

pub async fn nack_requeue(delivery: &lapin::message::Delivery) -> Result<(), EngineError> {
    delivery
        .nack(BasicNackOptions {
            requeue: true,
            ..Default::default()
        })
        .await
        .map_err(infra)
}

pub async fn nack_drop(delivery: &lapin::message::Delivery) -> Result<(), EngineError> {
    delivery
        .nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
        .map_err(infra)
}

/// Drains a consumer with a callback; used by every provider worker and
/// the dispatcher. Stops when the consumer stream ends (connection
/// lost) so the caller's supervising task can reconnect.
pub async fn run_consumer<F, Fut>(mut consumer: Consumer, mut handler: F)
where
    F: FnMut(lapin::message::Delivery) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => handler(delivery).await,
            Err(e) => {
                error!(error = %e, "amqp consumer stream error");
                break;
            }
        }
    }
}
