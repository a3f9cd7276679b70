//! The transport core.
//!
//! Owns the connection lifecycle, the private reply queue used for RPC
//! replies, the registry of consumed-queue bindings that survive
//! reconnects, and the publish/consume pipelines.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicCancelOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Consumer};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{fingerprint, ResponseCache};
use crate::config::{QueueOptions, TransportConfig};
use crate::error::{Death, Error};
use crate::events::{EventBus, TransportEvent};
use crate::facade::{mentions_queue, reply_code, ConnectionState, Facade, SOFT_REPLY_CODES};
use crate::handler::{Inbound, MessageHandler, Responder};
use crate::message::{json_to_field_table, AppId, DeliveryProperties, PublishOptions, Response};
use crate::reply_storage::ReplyStorage;
use crate::serialize::{deserialize, serialize, ContentEncoding, ContentType};
use crate::util::OnError;

/// Name prefix of private reply queues.
const REPLY_QUEUE_PREFIX: &str = "microfleet.";
/// Outbound header carrying the tracing request id.
const REQUEST_ID_HEADER: &str = "x-request-id";
/// Outbound header mirroring the caller's RPC timeout.
const TIMEOUT_HEADER: &str = "timeout";
/// Binding header used on the headers exchange.
const ROUTING_KEY_HEADER: &str = "routing-key";
/// Binding header routing DLX'd replies back to their origin.
const REPLY_TO_HEADER: &str = "reply-to";

/// Identity of a consumed-queue binding, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(Uuid);

/// Lifecycle of the private reply queue name.
enum ReplyQueueState {
    /// Nobody asked for it yet.
    Unknown,
    /// Creation is in flight.
    Pending,
    /// Declared and consuming under this name.
    Ready(String),
}

/// A consumed-queue registration: everything needed to re-establish its
/// consumer after an error or reconnect.
struct ConsumerBinding {
    id: Uuid,
    handler: Arc<dyn MessageHandler>,
    queue_opts: QueueOptions,
    /// Every route ever bound on this queue; reconnects rebind the union.
    routes: Mutex<Vec<String>>,
    consumer: Mutex<Option<ConsumerHandle>>,
    attempt: AtomicU32,
    /// Serializes concurrent establish attempts for this binding.
    establish_lock: tokio::sync::Mutex<()>,
}

/// A live consumer and the channel it runs on.
struct ConsumerHandle {
    queue: String,
    tag: String,
    channel: lapin::Channel,
    task: JoinHandle<()>,
}

/// The AMQP transport.
///
/// Cheap to clone; all clones share one connection, one private reply
/// queue and one consumer registry.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    app_id_json: String,
    facade: Facade,
    events: EventBus,
    replies: ReplyStorage,
    cache: ResponseCache,
    reply_state: Mutex<ReplyQueueState>,
    /// Once established, the name survives reconnects until close.
    remembered_reply_queue: Mutex<Option<String>>,
    reply_queue_ready: Notify,
    private_consumer: Mutex<Option<ConsumerHandle>>,
    bindings: Mutex<HashMap<Uuid, Arc<ConsumerBinding>>>,
}

impl Transport {
    /// Connects to the broker and starts the lifecycle supervisor.
    ///
    /// # Errors
    ///
    /// Fails with a connection error when the broker cannot be reached,
    /// or an invalid-operation error on a transport that is already
    /// connecting or connected.
    pub async fn connect(config: TransportConfig) -> Result<Self, Error> {
        let (facade, error_rx) = Facade::new(config.connection.clone());
        let app_id_json = AppId::new(&config.name, &config.version).to_json();
        let cache_capacity = config.cache;
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                app_id_json,
                facade,
                events: EventBus::new(),
                replies: ReplyStorage::new(),
                cache: ResponseCache::new(cache_capacity),
                reply_state: Mutex::new(ReplyQueueState::Unknown),
                remembered_reply_queue: Mutex::new(None),
                reply_queue_ready: Notify::new(),
                private_consumer: Mutex::new(None),
                bindings: Mutex::new(HashMap::new()),
            }),
        };

        transport.do_connect().await?;
        tokio::spawn(transport.clone().supervise(error_rx));

        if transport.inner.config.private {
            tokio::spawn({
                let transport = transport.clone();
                async move { transport.run_private_queue_creation().await }
            });
        }

        Ok(transport)
    }

    async fn do_connect(&self) -> Result<(), Error> {
        let facade = &self.inner.facade;
        match facade.state() {
            ConnectionState::Closed => {}
            state => {
                return Err(Error::InvalidOperation(format!(
                    "connect is not possible from state {state:?}"
                )))
            }
        }
        facade.set_state(ConnectionState::Opening);
        match facade.connect(&self.inner.config.name).await {
            Ok(()) => {
                facade.set_state(ConnectionState::Open);
                self.emit(TransportEvent::Ready);
                Ok(())
            }
            Err(err) => {
                facade.set_state(ConnectionState::Closed);
                Err(err)
            }
        }
    }

    /// Closes the transport: consumers are cancelled, pending RPC calls
    /// rejected, and the connection shut down.
    ///
    /// # Errors
    ///
    /// Fails with an invalid-operation error when the transport is not
    /// open.
    pub async fn close(&self) -> Result<(), Error> {
        let facade = &self.inner.facade;
        match facade.state() {
            ConnectionState::Open | ConnectionState::Reconnecting => {}
            state => {
                return Err(Error::InvalidOperation(format!(
                    "close is not possible from state {state:?}"
                )))
            }
        }
        facade.set_state(ConnectionState::Closed);

        if let Some(handle) = self
            .inner
            .private_consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.close_consumer_handle(handle).await;
        }
        let bindings: Vec<Arc<ConsumerBinding>> = self
            .inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for binding in bindings {
            let handle = binding
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                self.close_consumer_handle(handle).await;
            }
        }

        self.inner
            .replies
            .reject_all(|id| Error::Connection(anyhow::anyhow!("transport closed while `{id}` was pending")));

        *self
            .inner
            .reply_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ReplyQueueState::Unknown;
        *self
            .inner
            .remembered_reply_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.reply_queue_ready.notify_waiters();

        let outcome = self
            .inner
            .facade
            .close()
            .await
            .on_err(|err| warn!("connection close failed: {err}"));
        self.emit(TransportEvent::Close(None));
        outcome
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.facade.state()
    }

    /// Subscribes to the transport's lifecycle events.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        self.inner.events.emit(event);
    }

    // ------------------------------------------------------------------
    // Lifecycle supervision
    // ------------------------------------------------------------------

    /// Watches connection-level errors and drives reconnects: re-dial
    /// with backoff, re-create the private reply queue first, then
    /// re-establish every registered binding exactly once.
    async fn supervise(self, mut error_rx: mpsc::UnboundedReceiver<lapin::Error>) {
        while let Some(err) = error_rx.recv().await {
            if self.state() == ConnectionState::Closed {
                break;
            }
            error!(error = %err, "connection lost");
            self.inner.facade.set_state(ConnectionState::Reconnecting);
            self.emit(TransportEvent::Close(Some(Arc::new(err.into()))));

            let had_reply_queue = {
                let mut state = self
                    .inner
                    .reply_state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match &*state {
                    ReplyQueueState::Unknown => false,
                    _ => {
                        *state = ReplyQueueState::Pending;
                        true
                    }
                }
            };

            let policy = self.inner.config.recovery.consumed;
            let mut attempt: u32 = 0;
            loop {
                if self.state() == ConnectionState::Closed {
                    return;
                }
                attempt += 1;
                match self.inner.facade.connect(&self.inner.config.name).await {
                    Ok(()) => break,
                    Err(redial_err) => {
                        warn!(error = %redial_err, attempt, "re-dial failed");
                        policy.sleep(attempt).await;
                    }
                }
            }
            self.inner.facade.set_state(ConnectionState::Open);

            // The private reply queue comes back before any RPC call or
            // binding proceeds.
            if had_reply_queue || self.inner.config.private {
                self.run_private_queue_creation().await;
            }

            let bindings: Vec<Arc<ConsumerBinding>> = self
                .inner
                .bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for binding in bindings {
                self.establish_consumer(binding).await;
            }

            self.emit(TransportEvent::Ready);
        }
    }

    // ------------------------------------------------------------------
    // Queue declaration
    // ------------------------------------------------------------------

    /// Declares a queue with the transport's defaults applied.
    ///
    /// Unnamed queues are declared server-named, auto-delete and
    /// non-durable; named queues durable and permanent. A declaration
    /// conflict (broker code 406) is logged and resolved by adopting the
    /// server's existing definition.
    ///
    /// # Errors
    ///
    /// Propagates declaration failures other than the 406 conflict.
    pub async fn create_queue(&self, opts: QueueOptions) -> Result<lapin::Queue, Error> {
        let merged = self.inner.config.default_queue_opts.overlaid(&opts);
        let auto_named = merged.name.is_empty();
        let options = QueueDeclareOptions {
            durable: merged.durable.unwrap_or(!auto_named),
            auto_delete: merged.auto_delete.unwrap_or(auto_named),
            exclusive: merged.exclusive,
            ..QueueDeclareOptions::default()
        };
        let mut arguments = merged.arguments.clone();
        if self.inner.config.dlx.enabled {
            arguments
                .entry("x-dead-letter-exchange".to_string())
                .or_insert_with(|| Value::from(self.inner.config.dlx.exchange.clone()));
        }

        let declared = self
            .inner
            .facade
            .declare_queue(&merged.name, options, json_to_field_table(&arguments))
            .await;
        match declared {
            Ok(queue) => Ok(queue),
            Err(err) if error_reply_code(&err) == Some(406) => {
                warn!(
                    queue = %merged.name,
                    "queue exists with a conflicting definition; adopting the server's"
                );
                self.inner
                    .facade
                    .declare_queue(
                        &merged.name,
                        QueueDeclareOptions {
                            passive: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn declare_default_exchange(&self) -> Result<(), Error> {
        let config = &self.inner.config;
        self.inner
            .facade
            .declare_exchange(
                &config.exchange,
                config.exchange_args.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: config.exchange_args.durable,
                    auto_delete: config.exchange_args.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .await
    }

    async fn declare_dlx_exchange(&self) -> Result<(), Error> {
        let dlx = &self.inner.config.dlx;
        self.inner
            .facade
            .declare_exchange(
                &dlx.exchange,
                dlx.params.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: dlx.params.durable,
                    auto_delete: dlx.params.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .await
    }

    // ------------------------------------------------------------------
    // Private reply queue
    // ------------------------------------------------------------------

    /// Resolves the private reply queue name, creating the queue first
    /// when necessary.
    async fn ensure_reply_queue(&self) -> Result<String, Error> {
        loop {
            if self.state() == ConnectionState::Closed {
                return Err(Error::InvalidOperation(
                    "transport is closed".to_string(),
                ));
            }
            let mut notified = pin!(self.inner.reply_queue_ready.notified());
            notified.as_mut().enable();

            let spawn_creation = {
                let mut state = self
                    .inner
                    .reply_state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match &*state {
                    ReplyQueueState::Ready(name) => return Ok(name.clone()),
                    ReplyQueueState::Pending => false,
                    ReplyQueueState::Unknown => {
                        *state = ReplyQueueState::Pending;
                        true
                    }
                }
            };
            if spawn_creation {
                tokio::spawn({
                    let transport = self.clone();
                    async move { transport.run_private_queue_creation().await }
                });
            }
            notified.await;
        }
    }

    /// Creates the private reply queue, retrying indefinitely with the
    /// `private` backoff policy, then marks it ready.
    async fn run_private_queue_creation(&self) {
        {
            let mut state = self
                .inner
                .reply_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *state = ReplyQueueState::Pending;
        }
        let policy = self.inner.config.recovery.private;
        let mut attempt: u32 = 0;
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            match self.establish_private_queue().await {
                Ok(name) => {
                    {
                        let mut state = self
                            .inner
                            .reply_state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        *state = ReplyQueueState::Ready(name.clone());
                    }
                    self.inner.reply_queue_ready.notify_waiters();
                    info!(queue = %name, "private reply queue ready");
                    self.emit(TransportEvent::PrivateQueueReady { queue: name });
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    warn!(error = %err, attempt, "failed to create private reply queue");
                    policy.sleep(attempt).await;
                }
            }
        }
    }

    fn establish_private_queue(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + '_>> {
        Box::pin(async move {
        let config = &self.inner.config;
        let name = self
            .inner
            .remembered_reply_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| format!("{REPLY_QUEUE_PREFIX}{}", Uuid::new_v4()));

        let opts = QueueOptions {
            name: name.clone(),
            durable: Some(false),
            auto_delete: Some(true),
            ..QueueOptions::default()
        }
        .overlaid(&config.private_queue_opts);
        let queue = self.create_queue(opts).await?;
        let queue_name = queue.name().to_string();

        // Broker-expired requests published by this process come back
        // here via the DLX headers exchange.
        if config.dlx.enabled {
            self.declare_dlx_exchange().await?;
            let binding_args = BTreeMap::from([
                ("x-match".to_string(), Value::from("any")),
                (REPLY_TO_HEADER.to_string(), Value::from(queue_name.clone())),
            ]);
            self.inner
                .facade
                .bind_queue(
                    &queue_name,
                    &config.dlx.exchange,
                    &queue_name,
                    json_to_field_table(&binding_args),
                )
                .await?;
        }

        let (channel, consumer) = self.inner.facade.consume(&queue_name, "", None).await?;
        let tag = consumer.tag().to_string();
        let task = tokio::spawn(
            self.clone()
                .run_private_consumer(consumer, queue_name.clone()),
        );

        let prior = self
            .inner
            .private_consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ConsumerHandle {
                queue: queue_name.clone(),
                tag,
                channel,
                task,
            });
        if let Some(prior) = prior {
            self.close_consumer_handle(prior).await;
        }

        *self
            .inner
            .remembered_reply_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(queue_name.clone());
        Ok(queue_name)
        })
    }

    /// Consume loop of the private reply queue.
    async fn run_private_consumer(self, mut consumer: Consumer, queue: String) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    // User-visible work never runs on the I/O callback.
                    let transport = self.clone();
                    tokio::spawn(async move { transport.route_private_delivery(delivery).await });
                }
                Err(err) => match reply_code(&err) {
                    Some(code) if SOFT_REPLY_CODES.contains(&code) => {
                        warn!(code, error = %err, "broker notice on private consumer");
                    }
                    Some(404) if mentions_queue(&err, &queue) => {
                        warn!(queue = %queue, "private reply queue disappeared; re-creating");
                        break;
                    }
                    _ => {
                        self.emit(TransportEvent::Error(Arc::new(err.into())));
                    }
                },
            }
        }

        self.emit(TransportEvent::ConsumerClose {
            queue: queue.clone(),
        });
        // Re-create after a backoff unless the lifecycle owns recovery.
        if self.state() == ConnectionState::Open {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.inner.config.recovery.private.sleep(1).await;
                transport.run_private_queue_creation().await;
            });
        }
    }

    /// Routes one delivery arriving on the private reply queue.
    async fn route_private_delivery(&self, delivery: Delivery) {
        let properties = DeliveryProperties::from_delivery(&delivery);
        let decoded = deserialize(
            &delivery.data,
            properties.content_type.as_deref(),
            properties.content_encoding.as_deref(),
        );
        let correlation_id = properties.correlation_id.clone().unwrap_or_default();
        let deaths = Death::trail(&properties.headers);

        let Some(pending) = self.inner.replies.pop(&correlation_id) else {
            self.handle_unroutable_reply(&properties, deaths, &correlation_id)
                .await;
            return;
        };

        if let Some(deaths) = deaths {
            debug!(
                correlation_id = %correlation_id,
                "request expired in transit; demoting to a dead-letter error"
            );
            pending.settle(Err(Death::into_error(deaths)));
            return;
        }

        match decoded {
            Err(parse_err) => pending.settle(Err(parse_err)),
            Ok(body) => {
                if let Some(wire_error) = body.get("error") {
                    let mut err = Error::from_wire(wire_error);
                    if let Error::Remote(remote) = &mut err {
                        remote.reply_headers = Some(properties.headers.clone());
                    }
                    pending.settle(Err(err));
                } else {
                    let response = Response {
                        headers: properties.headers.clone(),
                        data: body,
                    };
                    self.inner.cache.set(pending.cache_key, response.clone());
                    pending.settle(Ok(response));
                }
            }
        }
    }

    /// A reply with no pending caller: either a late arrival after the
    /// timer fired, or a dead-lettered request that belongs to someone
    /// else entirely.
    async fn handle_unroutable_reply(
        &self,
        properties: &DeliveryProperties,
        deaths: Option<Vec<Death>>,
        correlation_id: &str,
    ) {
        let Some(deaths) = deaths else {
            debug!(
                correlation_id = %correlation_id,
                "dropping reply with no pending caller"
            );
            return;
        };
        warn!(
            correlation_id = %correlation_id,
            deaths = deaths.len(),
            "dead-lettered message with no pending caller"
        );
        let own_queue = self
            .inner
            .remembered_reply_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reply_to) = &properties.reply_to {
            if own_queue.as_deref() != Some(reply_to.as_str()) {
                // Fail the original caller deterministically instead of
                // letting it run into its own timeout.
                let err = Error::NotPermitted(correlation_id.to_string());
                let body = json!({ "error": err.to_wire() });
                let opts = PublishOptions::default()
                    .with_correlation_id(correlation_id.to_string());
                if let Err(publish_err) = self
                    .publish_message("", reply_to, &body, &opts, None)
                    .await
                {
                    warn!(error = %publish_err, "failed to forward dead-letter notice");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumed queues
    // ------------------------------------------------------------------

    /// Registers a long-running consumer and establishes it. The binding
    /// re-establishes itself after consumer errors and reconnects until
    /// the transport closes.
    ///
    /// # Errors
    ///
    /// Fails with an argument error on empty or, in headers-exchange
    /// mode, wildcard routes. Broker-side establishment failures are
    /// retried with backoff instead of surfacing here.
    pub async fn create_consumed_queue<H>(
        &self,
        handler: H,
        routes: &[&str],
        overrides: QueueOptions,
    ) -> Result<BindingId, Error>
    where
        H: MessageHandler,
    {
        let config = &self.inner.config;
        let mut all_routes: Vec<String> = config.listen.clone();
        all_routes.extend(routes.iter().map(ToString::to_string));
        all_routes.sort();
        all_routes.dedup();
        if all_routes.iter().any(String::is_empty) {
            return Err(Error::Argument("routes must be non-empty strings".to_string()));
        }
        if config.bind_persistant_queue_to_headers_exchange {
            if let Some(route) = all_routes
                .iter()
                .find(|route| route.contains('*') || route.contains('#'))
            {
                return Err(Error::Argument(format!(
                    "route `{route}` must be literal when binding on the headers exchange"
                )));
            }
        }

        let mut queue_opts = overrides;
        if queue_opts.name.is_empty() {
            queue_opts.name = config.queue.clone();
        }

        let binding = Arc::new(ConsumerBinding {
            id: Uuid::new_v4(),
            handler: Arc::new(handler),
            queue_opts,
            routes: Mutex::new(all_routes),
            consumer: Mutex::new(None),
            attempt: AtomicU32::new(0),
            establish_lock: tokio::sync::Mutex::new(()),
        });
        self.inner
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(binding.id, binding.clone());

        self.establish_consumer(binding.clone()).await;
        Ok(BindingId(binding.id))
    }

    /// Establishes (or replaces) the binding's consumer, retrying with
    /// the `consumed` backoff policy until it sticks.
    async fn establish_consumer(&self, binding: Arc<ConsumerBinding>) {
        let _guard = binding.establish_lock.lock().await;
        let policy = self.inner.config.recovery.consumed;
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            match self.try_establish_consumer(&binding).await {
                Ok(queue) => {
                    binding.attempt.store(0, Ordering::Relaxed);
                    info!(queue = %queue, "consumer established");
                    self.emit(TransportEvent::ConsumedQueueReconnected { queue });
                    return;
                }
                Err(err) => {
                    let attempt = binding.attempt.fetch_add(1, Ordering::Relaxed) + 1;
                    let err = Error::Connection(anyhow::anyhow!(
                        "failed to establish consumer: {err}"
                    ));
                    warn!(error = %err, attempt, "establish failed; backing off");
                    policy.sleep(attempt).await;
                }
            }
        }
    }

    fn try_establish_consumer<'a>(
        &'a self,
        binding: &'a Arc<ConsumerBinding>,
    ) -> Pin<Box<dyn Future<Output = Result<String, Error>> + Send + 'a>> {
        Box::pin(async move {
        let config = &self.inner.config;

        // Replacement is atomic with closure of the predecessor.
        let prior = binding
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(prior) = prior {
            self.close_consumer_handle(prior).await;
        }

        let queue = self.create_queue(binding.queue_opts.clone()).await?;
        let queue_name = queue.name().to_string();

        let routes = binding
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !routes.is_empty() {
            self.declare_default_exchange().await?;
            for route in &routes {
                self.inner
                    .facade
                    .bind_queue(&queue_name, &config.exchange, route, FieldTable::default())
                    .await?;
            }
            if config.bind_persistant_queue_to_headers_exchange {
                let headers = &config.headers_exchange;
                self.inner
                    .facade
                    .declare_exchange(
                        &headers.exchange,
                        headers.args.exchange_kind(),
                        ExchangeDeclareOptions {
                            durable: headers.args.durable,
                            auto_delete: headers.args.auto_delete,
                            ..ExchangeDeclareOptions::default()
                        },
                    )
                    .await?;
                for route in &routes {
                    let args = BTreeMap::from([
                        ("x-match".to_string(), Value::from("any")),
                        (ROUTING_KEY_HEADER.to_string(), Value::from(route.clone())),
                    ]);
                    self.inner
                        .facade
                        .bind_queue(
                            &queue_name,
                            &headers.exchange,
                            route,
                            json_to_field_table(&args),
                        )
                        .await?;
                }
            }
        }

        let (channel, consumer) = self
            .inner
            .facade
            .consume(&queue_name, "", config.neck)
            .await?;
        let tag = consumer.tag().to_string();
        let task = tokio::spawn(self.clone().run_consumer_loop(
            binding.clone(),
            consumer,
            queue_name.clone(),
        ));
        *binding
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ConsumerHandle {
            queue: queue_name.clone(),
            tag,
            channel,
            task,
        });
        Ok(queue_name)
        })
    }

    /// Consume loop of a bound queue: dispatch deliveries, classify
    /// consumer errors, rebind when the consumer dies underneath us.
    async fn run_consumer_loop(
        self,
        binding: Arc<ConsumerBinding>,
        mut consumer: Consumer,
        queue: String,
    ) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    self.emit(TransportEvent::Pre {
                        routing_key: delivery.routing_key.to_string(),
                    });
                    let transport = self.clone();
                    let handler = binding.handler.clone();
                    // Handlers run on their own task, never on the
                    // consumer's I/O callback.
                    tokio::spawn(async move {
                        transport.dispatch_delivery(handler, delivery).await;
                    });
                }
                Err(err) => match reply_code(&err) {
                    Some(code) if SOFT_REPLY_CODES.contains(&code) => {
                        warn!(code, error = %err, "broker notice on consumer");
                    }
                    Some(404) if mentions_queue(&err, &queue) => {
                        warn!(queue = %queue, "queue disappeared; rebinding");
                        break;
                    }
                    _ => {
                        self.emit(TransportEvent::Error(Arc::new(err.into())));
                        break;
                    }
                },
            }
        }

        self.emit(TransportEvent::ConsumerClose {
            queue: queue.clone(),
        });
        // End of stream without an error means the broker cancelled us.
        if self.state() == ConnectionState::Open {
            let transport = self.clone();
            tokio::spawn(async move {
                transport.inner.config.recovery.consumed.sleep(1).await;
                transport.establish_consumer(binding).await;
            });
        }
    }

    /// The routing adapter: decode, enrich, span, dispatch.
    async fn dispatch_delivery(&self, handler: Arc<dyn MessageHandler>, delivery: Delivery) {
        let delivery = Arc::new(delivery);
        let properties = DeliveryProperties::from_delivery(&delivery);
        let request_id = properties
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let peer = properties.app().map(|app| app.name).unwrap_or_default();
        let span = info_span!(
            "on_consume",
            routing_key = %properties.routing_key,
            request_id = %request_id,
            peer = %peer,
            redelivered = properties.redelivered,
        );

        let message = deserialize(
            &delivery.data,
            properties.content_type.as_deref(),
            properties.content_encoding.as_deref(),
        );

        let explicit_ack = self.inner.config.neck.is_some();
        let responder = Responder::new(
            self.clone(),
            properties.clone(),
            span.clone(),
            explicit_ack.then(|| delivery.clone()),
            self.inner.config.dlx.enabled,
        );
        let inbound = Inbound {
            message,
            properties,
            raw: delivery,
        };
        handler.handle(inbound, responder).instrument(span).await;
    }

    async fn close_consumer_handle(&self, handle: ConsumerHandle) {
        handle.task.abort();
        if let Err(err) = handle
            .channel
            .basic_cancel(&handle.tag, BasicCancelOptions::default())
            .await
        {
            debug!(queue = %handle.queue, error = %err, "consumer cancel failed");
        }
        self.emit(TransportEvent::ConsumerClose {
            queue: handle.queue,
        });
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publishes a message to the configured exchange, fire-and-forget.
    ///
    /// # Errors
    ///
    /// Propagates serialization and broker publish failures.
    pub async fn publish(
        &self,
        route: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<(), Error> {
        let merged = self.inner.config.default_opts.overlaid(&opts);
        let exchange = merged
            .exchange
            .clone()
            .unwrap_or_else(|| self.inner.config.exchange.clone());
        self.publish_message(&exchange, route, message, &merged, None)
            .await
    }

    /// Sends a message directly to a queue over the default exchange.
    ///
    /// # Errors
    ///
    /// Propagates serialization and broker publish failures.
    pub async fn send(
        &self,
        queue: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<(), Error> {
        let merged = self.inner.config.default_opts.overlaid(&opts);
        self.publish_message("", queue, message, &merged, None).await
    }

    /// Publishes to the configured exchange and awaits the correlated
    /// reply, returning the payload only.
    ///
    /// # Errors
    ///
    /// Rejects with a timeout, dead-letter, remote or connection error
    /// depending on how the call fails.
    pub async fn publish_and_wait(
        &self,
        route: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<Value, Error> {
        self.publish_and_wait_full(route, message, opts)
            .await
            .map(|response| response.data)
    }

    /// Publishes to the configured exchange and awaits the correlated
    /// reply with its headers.
    ///
    /// # Errors
    ///
    /// See [`publish_and_wait`](Self::publish_and_wait).
    pub async fn publish_and_wait_full(
        &self,
        route: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<Response, Error> {
        let exchange = opts
            .exchange
            .clone()
            .or_else(|| self.inner.config.default_opts.exchange.clone())
            .unwrap_or_else(|| self.inner.config.exchange.clone());
        self.call(&exchange, route, message, opts).await
    }

    /// Sends to a queue and awaits the correlated reply, payload only.
    ///
    /// # Errors
    ///
    /// See [`publish_and_wait`](Self::publish_and_wait).
    pub async fn send_and_wait(
        &self,
        queue: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<Value, Error> {
        self.send_and_wait_full(queue, message, opts)
            .await
            .map(|response| response.data)
    }

    /// Sends to a queue and awaits the correlated reply with headers.
    ///
    /// # Errors
    ///
    /// See [`publish_and_wait`](Self::publish_and_wait).
    pub async fn send_and_wait_full(
        &self,
        queue: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<Response, Error> {
        self.call("", queue, message, opts).await
    }

    /// The RPC pipeline shared by `publish_and_wait` and `send_and_wait`.
    async fn call(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
        opts: PublishOptions,
    ) -> Result<Response, Error> {
        let config = &self.inner.config;
        let merged = config.default_opts.overlaid(&opts);

        let reply_to = match merged.reply_to.clone() {
            Some(reply_to) => reply_to,
            None => self.ensure_reply_queue().await?,
        };

        let cache_key = merged
            .cache
            .map(|_| fingerprint(message, routing_key));
        if let (Some(ttl), Some(key)) = (merged.cache, cache_key) {
            if let Some(hit) = self.inner.cache.get(key, Duration::from_secs(ttl)) {
                debug!(routing_key, "serving RPC response from cache");
                return Ok(hit);
            }
        }

        let correlation_id = merged
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout_ms = merged.timeout.unwrap_or(config.timeout);
        let timeout = Duration::from_millis(timeout_ms);

        let (tx, rx) = oneshot::channel();
        self.inner
            .replies
            .push(&correlation_id, routing_key, cache_key, timeout, tx)?;

        // The broker expires the in-flight message ahead of our timer so
        // a dead consumer surfaces as a DLX error, not a blind timeout.
        // The reply queue name rides along as a header too: that is what
        // the DLX headers exchange matches on to route the corpse back.
        let expiration_ms = (timeout_ms * 9).div_ceil(10);
        let publish_opts = merged
            .clone()
            .with_timeout(timeout_ms)
            .with_header(REPLY_TO_HEADER, reply_to.clone())
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_to);

        let span = info_span!("rpc", routing_key, correlation_id = %correlation_id);
        let published = self
            .publish_message(
                exchange,
                routing_key,
                message,
                &publish_opts,
                Some(expiration_ms),
            )
            .instrument(span)
            .await;
        if let Err(publish_err) = published {
            self.inner.replies.reject(&correlation_id, publish_err);
        }

        rx.await.map_err(|_| {
            Error::Connection(anyhow::anyhow!(
                "transport closed while awaiting reply for `{routing_key}`"
            ))
        })?
    }

    /// Publishes a reply to the inbound's `replyTo` queue.
    ///
    /// Emits `After` once the publish settles, successful or not.
    ///
    /// # Errors
    ///
    /// Fails early with a validation error when the inbound carried no
    /// `replyTo`/`correlationId` pair; otherwise propagates publish
    /// failures.
    pub async fn reply(
        &self,
        properties: &DeliveryProperties,
        result: Result<Value, Error>,
    ) -> Result<(), Error> {
        let (Some(reply_to), Some(correlation_id)) = (
            properties.reply_to.clone(),
            properties.correlation_id.clone(),
        ) else {
            return Err(Error::Validation(
                "reply requires both `replyTo` and `correlationId`".to_string(),
            ));
        };

        let mut opts = PublishOptions::default().with_correlation_id(correlation_id);
        let body = match result {
            Ok(data) => data,
            Err(err) => {
                if let Error::Remote(remote) = &err {
                    if let Some(headers) = &remote.reply_headers {
                        opts.headers
                            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                json!({ "error": err.to_wire() })
            }
        };

        let outcome = self
            .publish_message("", &reply_to, &body, &opts, None)
            .await;
        self.emit(TransportEvent::After {
            routing_key: properties.routing_key.clone(),
        });
        outcome
    }

    /// Serializes, enriches and publishes one message.
    async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Value,
        opts: &PublishOptions,
        expiration_ms: Option<u64>,
    ) -> Result<(), Error> {
        let content_type = match opts.content_type.as_deref() {
            None => ContentType::Json,
            Some(raw) => ContentType::parse(raw)
                .ok_or_else(|| Error::Validation(format!("unsupported content type `{raw}`")))?,
        };
        let encoding = if opts.gzip {
            ContentEncoding::Gzip
        } else {
            ContentEncoding::Plain
        };

        let payload = if opts.skip_serialize {
            match message {
                Value::String(raw) => raw.clone().into_bytes(),
                other => serde_json::to_vec(other)
                    .map_err(|err| Error::Validation(format!("unusable raw payload: {err}")))?,
            }
        } else {
            serialize(message, encoding)?
        };

        let mut headers = opts.headers.clone();
        headers
            .entry(REQUEST_ID_HEADER.to_string())
            .or_insert_with(|| Value::from(Uuid::new_v4().to_string()));
        if let Some(timeout) = opts.timeout {
            headers.insert(TIMEOUT_HEADER.to_string(), Value::from(timeout));
        }

        #[allow(clippy::cast_sign_loss)]
        let mut properties = BasicProperties::default()
            .with_content_type(content_type.as_str().into())
            .with_content_encoding(encoding.as_str().into())
            .with_app_id(self.inner.app_id_json.as_str().into())
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_headers(json_to_field_table(&headers));
        if let Some(correlation_id) = &opts.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &opts.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if let Some(expiration_ms) = expiration_ms {
            properties = properties.with_expiration(expiration_ms.to_string().into());
        }

        self.inner
            .facade
            .publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: opts.mandatory,
                    immediate: opts.immediate,
                },
                &payload,
                properties,
                opts.confirm,
            )
            .await?;

        self.emit(TransportEvent::Publish {
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }
}

/// Reply code buried inside a connection error, when there is one.
fn error_reply_code(err: &Error) -> Option<u16> {
    match err {
        Error::Connection(inner) => inner.downcast_ref::<lapin::Error>().and_then(reply_code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_ids_are_unique() {
        assert_ne!(BindingId(Uuid::new_v4()), BindingId(Uuid::new_v4()));
    }

    #[test]
    fn expiration_is_ninety_percent_of_the_timeout_rounded_up() {
        let timeout_ms: u64 = 200;
        assert_eq!((timeout_ms * 9).div_ceil(10), 180);
        let odd: u64 = 333;
        assert_eq!((odd * 9).div_ceil(10), 300);
    }

    #[test]
    fn connection_reply_codes_are_extracted_through_anyhow() {
        let lapin_err = lapin::Error::ProtocolError(
            lapin::protocol::AMQPError::from_id(406, "PRECONDITION_FAILED".into())
                .expect("known reply code"),
        );
        let err = Error::from(lapin_err);
        assert_eq!(error_reply_code(&err), Some(406));
        assert_eq!(error_reply_code(&Error::Parse("nope".to_string())), None);
    }
}
