use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Binding pattern that matches every routing key, so the single shared
/// queue sees all traffic and consumers filter by recipient.
const BIND_ALL: &str = "#";

#[derive(Debug)]
pub enum BrokerError {
    Connect,
    Channel,
    Publish,
    Consume,
    Cancel,
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "broker connect failure"),
            Self::Channel => write!(f, "broker channel failure"),
            Self::Publish => write!(f, "broker publish failure"),
            Self::Consume => write!(f, "broker consume failure"),
            Self::Cancel => write!(f, "broker cancel failure"),
        }
    }
}

impl Error for BrokerError {}

pub struct Broker {
    _connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
}

/// Connects to the broker and declares the durable topology: one topic
/// exchange and one shared queue bound with the wildcard pattern.
pub async fn connect(url: &str, exchange: &str, queue: &str) -> Result<Broker, BrokerError> {
    let options = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio);
    let connection = Connection::connect(url, options)
        .await
        .map_err(|_| BrokerError::Connect)?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|_| BrokerError::Channel)?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| BrokerError::Channel)?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|_| BrokerError::Channel)?;
    channel
        .queue_bind(
            queue,
            exchange,
            BIND_ALL,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|_| BrokerError::Channel)?;
    Ok(Broker {
        _connection: connection,
        channel,
        exchange: exchange.to_string(),
        queue: queue.to_string(),
    })
}

impl Broker {
    /// Publishes a JSON payload addressed by recipient user id.
    pub async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|_| BrokerError::Publish)?
            .await
            .map_err(|_| BrokerError::Publish)?;
        Ok(())
    }

    /// Starts a manual-ack consumer on the shared queue and spawns its
    /// delivery pump. Handler success acks, handler failure nacks with
    /// requeue. The returned handle completes when the pump stops, which
    /// the caller treats as disconnect.
    pub async fn consume<F, Fut>(
        &self,
        tag: &str,
        handler: F,
    ) -> Result<JoinHandle<()>, BrokerError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| BrokerError::Consume)?;
        let consumer_tag = tag.to_string();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        warn!(consumer = %consumer_tag, "delivery fault: {}", err);
                        break;
                    }
                };
                match handler(delivery.data.clone()).await {
                    Ok(()) => {
                        if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await {
                            warn!(consumer = %consumer_tag, "ack failed: {}", err);
                        }
                    }
                    Err(err) => {
                        warn!(consumer = %consumer_tag, "handler failed, requeueing: {}", err);
                        if let Err(err) = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..BasicNackOptions::default()
                            })
                            .await
                        {
                            warn!(consumer = %consumer_tag, "nack failed: {}", err);
                        }
                    }
                }
            }
            debug!(consumer = %consumer_tag, "delivery pump stopped");
        });
        Ok(handle)
    }

    /// Cancels the named consumer without closing the channel. Cancelling a
    /// tag that no longer exists returns an error the caller may ignore.
    pub async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|_| BrokerError::Cancel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_pattern_is_wildcard() {
        assert_eq!(BIND_ALL, "#");
    }

    #[test]
    fn broker_error_display() {
        assert_eq!(BrokerError::Connect.to_string(), "broker connect failure");
        assert_eq!(BrokerError::Cancel.to_string(), "broker cancel failure");
    }
}
