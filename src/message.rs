//! Publish options, message properties and their AMQP conversions.

use std::collections::BTreeMap;

use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call publish options, merged over the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishOptions {
    /// Override the default exchange for this call.
    pub exchange: Option<String>,
    /// Wait for the broker's publisher confirm before resolving.
    pub confirm: bool,
    /// AMQP `mandatory` publish flag.
    pub mandatory: bool,
    /// AMQP `immediate` publish flag.
    pub immediate: bool,
    /// RPC timeout in milliseconds; also written into the headers.
    pub timeout: Option<u64>,
    /// Response cache TTL in seconds. Absence disables the cache for
    /// this call entirely.
    pub cache: Option<u64>,
    /// Force gzip content encoding.
    pub gzip: bool,
    /// Transmit the payload as-is (already serialized bytes).
    pub skip_serialize: bool,
    /// Reuse a specific correlation id instead of generating one.
    pub correlation_id: Option<String>,
    /// Override the reply queue name.
    pub reply_to: Option<String>,
    /// Override the outbound `contentType` property.
    pub content_type: Option<String>,
    /// Caller-supplied AMQP headers. Timeout and tracing fields are
    /// merged in by the transport.
    pub headers: BTreeMap<String, Value>,
}

impl PublishOptions {
    /// Returns `self` overlaid with the set fields of `overlay`.
    /// Call-site options win over configured defaults.
    #[must_use]
    pub fn overlaid(&self, overlay: &PublishOptions) -> PublishOptions {
        let mut merged = self.clone();
        if overlay.exchange.is_some() {
            merged.exchange = overlay.exchange.clone();
        }
        merged.confirm |= overlay.confirm;
        merged.mandatory |= overlay.mandatory;
        merged.immediate |= overlay.immediate;
        if overlay.timeout.is_some() {
            merged.timeout = overlay.timeout;
        }
        if overlay.cache.is_some() {
            merged.cache = overlay.cache;
        }
        merged.gzip |= overlay.gzip;
        merged.skip_serialize |= overlay.skip_serialize;
        if overlay.correlation_id.is_some() {
            merged.correlation_id = overlay.correlation_id.clone();
        }
        if overlay.reply_to.is_some() {
            merged.reply_to = overlay.reply_to.clone();
        }
        if overlay.content_type.is_some() {
            merged.content_type = overlay.content_type.clone();
        }
        merged
            .headers
            .extend(overlay.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Defaults to `None`.
    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Defaults to `None` (cache disabled).
    #[must_use]
    pub fn with_cache(mut self, ttl_seconds: u64) -> Self {
        self.cache = Some(ttl_seconds);
        self
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    /// Defaults to `false`.
    #[must_use]
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    /// Defaults to `None`.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Defaults to `None` (a fresh uuid per call).
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds a single outbound header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Publisher identity stamped into the outbound `appId` property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppId {
    /// Service name.
    pub name: String,
    /// Host the service runs on.
    pub host: String,
    /// Process id.
    pub pid: u32,
    /// Version of this transport library.
    pub utils_version: String,
    /// Service version.
    pub version: String,
}

impl AppId {
    /// Builds the identity for this process.
    #[must_use]
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            utils_version: env!("CARGO_PKG_VERSION").to_string(),
            version: version.to_string(),
        }
    }

    /// JSON encoding used on the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Tolerant parse of a peer's `appId` property.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// AMQP properties of an inbound delivery, enriched with the delivery
/// metadata the raw frame carries next to them.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProperties {
    /// `contentType` property.
    pub content_type: Option<String>,
    /// `contentEncoding` property.
    pub content_encoding: Option<String>,
    /// Raw `appId` property (JSON, see [`AppId`]).
    pub app_id: Option<String>,
    /// `correlationId` property.
    pub correlation_id: Option<String>,
    /// `replyTo` property.
    pub reply_to: Option<String>,
    /// `expiration` property.
    pub expiration: Option<String>,
    /// Message headers.
    pub headers: BTreeMap<String, Value>,
    /// Broker delivery tag.
    pub delivery_tag: u64,
    /// Whether the broker redelivered this message.
    pub redelivered: bool,
    /// Exchange the message arrived through.
    pub exchange: String,
    /// Routing key of the delivery.
    pub routing_key: String,
    /// Frame weight of the delivery.
    pub weight: u16,
}

impl DeliveryProperties {
    /// Copies the AMQP properties of a delivery and overlays the
    /// delivery metadata.
    #[must_use]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let properties = &delivery.properties;
        Self {
            content_type: properties.content_type().clone().map(|s| s.to_string()),
            content_encoding: properties
                .content_encoding()
                .clone()
                .map(|s| s.to_string()),
            app_id: properties.app_id().clone().map(|s| s.to_string()),
            correlation_id: properties.correlation_id().clone().map(|s| s.to_string()),
            reply_to: properties.reply_to().clone().map(|s| s.to_string()),
            expiration: properties.expiration().clone().map(|s| s.to_string()),
            headers: properties
                .headers()
                .as_ref()
                .map(field_table_to_json)
                .unwrap_or_default(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            weight: 0,
        }
    }

    /// Parses the publisher identity out of the `appId` property.
    #[must_use]
    pub fn app(&self) -> Option<AppId> {
        self.app_id.as_deref().and_then(AppId::parse)
    }
}

/// A full RPC response: the reply's headers next to its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// AMQP headers of the reply.
    pub headers: BTreeMap<String, Value>,
    /// Decoded reply payload.
    pub data: Value,
}

/// Converts AMQP field tables into JSON maps.
#[must_use]
pub fn field_table_to_json(table: &FieldTable) -> BTreeMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

/// Converts JSON maps into AMQP field tables.
#[must_use]
pub fn json_to_field_table(map: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(key.as_str().into(), json_to_amqp_value(value));
    }
    table
}

/// Best-effort mapping of a single AMQP value onto JSON.
fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::from(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(f64::from(*n)),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::DecimalValue(d) => {
            Value::from(f64::from(d.value) / 10_f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::Timestamp(ts) => Value::from(*ts),
        AMQPValue::FieldTable(table) => {
            Value::Object(field_table_to_json(table).into_iter().collect())
        }
        AMQPValue::ByteArray(bytes) => {
            Value::from(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        }
        AMQPValue::Void => Value::Null,
    }
}

/// Maps a JSON value onto the closest AMQP value.
fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                AMQPValue::LongLongInt(int)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => {
            let fields = map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>();
            AMQPValue::FieldTable(json_to_field_table(&fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn overlay_prefers_call_site_options() {
        let defaults = PublishOptions::default()
            .with_timeout(10_000)
            .with_header("region", "eu");
        let call = PublishOptions::default()
            .with_timeout(250)
            .with_cache(5)
            .with_header("attempt", 1);
        let merged = defaults.overlaid(&call);
        assert_eq!(merged.timeout, Some(250));
        assert_eq!(merged.cache, Some(5));
        assert_eq!(merged.headers["region"], json!("eu"));
        assert_eq!(merged.headers["attempt"], json!(1));
    }

    #[test]
    fn app_id_round_trips_through_json() {
        let app = AppId::new("payments", "3.2.1");
        let parsed = AppId::parse(&app.to_json()).unwrap();
        assert_eq!(parsed.name, "payments");
        assert_eq!(parsed.version, "3.2.1");
        assert_eq!(parsed.pid, std::process::id());
    }

    #[test]
    fn field_table_round_trips_nested_structures() {
        let headers = BTreeMap::from([
            ("routing-key".to_string(), json!("maintenance.cleanup")),
            ("attempt".to_string(), json!(3)),
            ("ratio".to_string(), json!(0.5)),
            ("flags".to_string(), json!({"retry": true, "tags": ["a", "b"]})),
        ]);
        let round_tripped = field_table_to_json(&json_to_field_table(&headers));
        assert_eq!(round_tripped["routing-key"], json!("maintenance.cleanup"));
        assert_eq!(round_tripped["attempt"], json!(3));
        assert_eq!(round_tripped["ratio"], json!(0.5));
        assert_eq!(round_tripped["flags"]["retry"], json!(true));
        assert_eq!(round_tripped["flags"]["tags"], json!(["a", "b"]));
    }

    #[test]
    fn options_deserialize_with_camel_case_keys() {
        let options: PublishOptions = serde_json::from_value(json!({
            "timeout": 5000,
            "skipSerialize": true,
            "replyTo": "microfleet.responses",
        }))
        .unwrap();
        assert_eq!(options.timeout, Some(5000));
        assert!(options.skip_serialize);
        assert_eq!(options.reply_to.as_deref(), Some("microfleet.responses"));
    }
}
