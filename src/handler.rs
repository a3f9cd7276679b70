//! Handler contract for consumed queues.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde_json::Value;
use tracing::{warn, Instrument, Span};

use crate::error::Error;
use crate::events::TransportEvent;
use crate::message::DeliveryProperties;
use crate::transport::Transport;

/// One inbound delivery, decoded and enriched, as handlers see it.
pub struct Inbound {
    /// Decoded body. Parse failures arrive here as an [`Error::Parse`]
    /// value instead of crashing the consume loop.
    pub message: Result<Value, Error>,
    /// AMQP properties enriched with delivery metadata.
    pub properties: DeliveryProperties,
    /// The raw delivery, for callers that need the original bytes.
    pub raw: Arc<Delivery>,
}

/// Handlers bound on consumed queues.
///
/// Implemented for any `async fn(Inbound, Responder)`-shaped closure, so
/// most callers never name this trait.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes one delivery. Replying is the [`Responder`]'s job and
    /// may be skipped for fire-and-forget consumers.
    async fn handle(&self, inbound: Inbound, responder: Responder);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Inbound, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, inbound: Inbound, responder: Responder) {
        (self)(inbound, responder).await;
    }
}

/// Reply callback handed to handlers alongside each inbound message.
///
/// Consuming [`send`](Responder::send) is the single terminal action: it
/// publishes a reply when the inbound carried both `replyTo` and
/// `correlationId`, and emits the audit `After` event otherwise. In
/// explicit-ack mode it also settles the delivery: ack on success, nack
/// without requeue on error so the DLX picks the message up. Dropping
/// the responder without sending still emits `After` exactly once; an
/// unsettled delivery is then redelivered by the broker.
pub struct Responder {
    transport: Transport,
    properties: DeliveryProperties,
    span: Span,
    /// Present only when the consumer runs with explicit acks.
    raw: Option<Arc<Delivery>>,
    /// Whether handler errors should be nacked into the DLX.
    nack_errors: bool,
    settled: bool,
}

impl Responder {
    pub(crate) fn new(
        transport: Transport,
        properties: DeliveryProperties,
        span: Span,
        raw: Option<Arc<Delivery>>,
        nack_errors: bool,
    ) -> Self {
        Self {
            transport,
            properties,
            span,
            raw,
            nack_errors,
            settled: false,
        }
    }

    /// Whether the inbound message expects a reply.
    #[must_use]
    pub fn is_replyable(&self) -> bool {
        self.properties.reply_to.is_some() && self.properties.correlation_id.is_some()
    }

    /// Settles the inbound delivery with the handler's outcome.
    pub async fn send(mut self, result: Result<Value, Error>) {
        self.settled = true;
        let failed = result.is_err();
        let span = self.span.clone();
        async {
            if self.is_replyable() {
                if let Err(err) = self.transport.reply(&self.properties, result).await {
                    warn!(
                        routing_key = %self.properties.routing_key,
                        error = %err,
                        "failed to deliver reply"
                    );
                    self.transport.emit(TransportEvent::Error(Arc::new(err)));
                }
            } else {
                if let Err(error) = result {
                    warn!(
                        routing_key = %self.properties.routing_key,
                        %error,
                        "handler failed with nowhere to reply"
                    );
                }
                self.transport.emit(TransportEvent::After {
                    routing_key: self.properties.routing_key.clone(),
                });
            }

            if let Some(raw) = self.raw.take() {
                let acked = if failed && self.nack_errors {
                    raw.acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await
                } else {
                    raw.acker.ack(BasicAckOptions::default()).await
                };
                if let Err(err) = acked {
                    warn!(
                        delivery_tag = self.properties.delivery_tag,
                        error = %err,
                        "failed to settle delivery"
                    );
                }
            }
        }
        .instrument(span)
        .await;
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.settled {
            self.transport.emit(TransportEvent::After {
                routing_key: self.properties.routing_key.clone(),
            });
        }
    }
}
