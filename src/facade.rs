//! Thin adapter over the AMQP wire client.
//!
//! Everything the transport does to the broker goes through here:
//! dialing, queue and exchange declarations, bindings, consumers and
//! publishes. The facade also keeps the connection state and funnels
//! connection-level errors into a channel the transport supervises.

use std::sync::{Arc, Mutex, PoisonError};

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::channel_pool::{ChannelPool, PooledChannel};
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::util::OnError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Closed,
    /// A dial is in flight.
    Opening,
    /// Connected and usable.
    Open,
    /// Connection lost; the supervisor is re-dialing.
    Reconnecting,
}

/// Broker reply codes that are informational on consumers and only
/// warrant a log line.
pub(crate) const SOFT_REPLY_CODES: [u16; 2] = [311, 313];

/// Extracts the AMQP reply code out of a wire-client error.
pub(crate) fn reply_code(err: &lapin::Error) -> Option<u16> {
    match err {
        lapin::Error::ProtocolError(protocol_err) => Some(protocol_err.get_id()),
        _ => None,
    }
}

/// Whether a broker error text names the given queue.
pub(crate) fn mentions_queue(err: &lapin::Error, queue: &str) -> bool {
    !queue.is_empty() && err.to_string().contains(queue)
}

/// The wire-client adapter.
pub(crate) struct Facade {
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    conn: Mutex<Option<Arc<Connection>>>,
    pool: Mutex<Option<ChannelPool>>,
    error_tx: mpsc::UnboundedSender<lapin::Error>,
}

impl Facade {
    /// Creates the facade and the stream of connection-level errors the
    /// transport's supervisor listens on.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<lapin::Error>) {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state: Mutex::new(ConnectionState::Closed),
                conn: Mutex::new(None),
                pool: Mutex::new(None),
                error_tx,
            },
            error_rx,
        )
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the lifecycle to a new state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Dials the broker and installs the error hook. The caller is
    /// responsible for the surrounding state transitions.
    pub async fn connect(&self, connection_name: &str) -> Result<(), Error> {
        let uri = self.config.uri()?;
        let properties =
            ConnectionProperties::default().with_connection_name(connection_name.into());
        let conn = Arc::new(
            Connection::connect(uri.as_str(), properties)
                .await
                .map_err(Error::from)
                .on_err(|err| error!("failed to dial broker: {err}"))?,
        );

        conn.on_error({
            let tx = self.error_tx.clone();
            move |err| {
                let _ = tx.send(err);
            }
        });

        let pool = ChannelPool::new(conn.clone())?;
        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);

        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "connected to broker"
        );
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Connection>, Error> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::InvalidOperation("transport is not connected".to_string()))
    }

    /// A pooled channel for declarations and publishes.
    pub async fn channel(&self) -> Result<PooledChannel, Error> {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::InvalidOperation("transport is not connected".to_string()))?;
        pool.get().await
    }

    /// Declares a queue and returns the broker's view of it.
    pub async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<lapin::Queue, Error> {
        let channel = self.channel().await?;
        let queue = channel.queue_declare(name, options, arguments).await?;
        debug!(queue = %queue.name(), "declared queue");
        Ok(queue)
    }

    /// Declares an exchange.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), Error> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    /// Binds a queue to an exchange.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                arguments,
            )
            .await?;
        debug!(queue, exchange, routing_key, "bound queue");
        Ok(())
    }

    /// Opens a consumer on a dedicated channel and returns both, so the
    /// caller can cancel the consumer and close its channel on teardown.
    ///
    /// A set prefetch applies QoS and switches to explicit acks; no
    /// prefetch consumes with `no_ack`.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<(lapin::Channel, Consumer), Error> {
        let channel = self.connection()?.create_channel().await?;
        if let Some(prefetch) = prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: prefetch.is_none(),
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok((channel, consumer))
    }

    /// Publishes a message, optionally awaiting the broker's confirm.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
        confirm: bool,
    ) -> Result<(), Error> {
        let channel = self.channel().await?;
        let confirmation = channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        if confirm {
            match confirmation.await? {
                Confirmation::Nack(_) => Err(Error::Connection(anyhow::anyhow!(
                    "broker nacked publish to `{routing_key}`"
                ))),
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    /// Closes the connection and drops the channel pool.
    pub async fn close(&self) -> Result<(), Error> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(conn) = conn {
            conn.close(200, "OK").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lapin::protocol::AMQPError;

    use super::*;

    fn protocol_error(code: u16) -> lapin::Error {
        lapin::Error::ProtocolError(
            AMQPError::from_id(code, "test".into()).expect("known reply code"),
        )
    }

    #[test]
    fn reply_code_reads_protocol_errors() {
        assert_eq!(reply_code(&protocol_error(404)), Some(404));
        assert_eq!(reply_code(&protocol_error(406)), Some(406));
        assert_eq!(reply_code(&lapin::Error::ChannelsLimitReached), None);
    }

    #[test]
    fn soft_codes_cover_informational_replies() {
        assert!(SOFT_REPLY_CODES.contains(&311));
        assert!(SOFT_REPLY_CODES.contains(&313));
        assert!(!SOFT_REPLY_CODES.contains(&404));
    }

    #[test]
    fn queue_mention_matches_broker_error_text() {
        let err = lapin::Error::ProtocolError(
            AMQPError::from_id(404, "NOT_FOUND - no queue 'jobs' in vhost '/'".into())
                .expect("known reply code"),
        );
        assert!(mentions_queue(&err, "jobs"));
        assert!(!mentions_queue(&err, "other.queue"));
        assert!(!mentions_queue(&err, ""));
    }

    #[test]
    fn fresh_facade_starts_closed() {
        let (facade, _errors) = Facade::new(ConnectionConfig::default());
        assert_eq!(facade.state(), ConnectionState::Closed);
        facade.set_state(ConnectionState::Opening);
        assert_eq!(facade.state(), ConnectionState::Opening);
    }
}
