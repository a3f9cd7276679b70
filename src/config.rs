//! Transport configuration.
//!
//! Every section deserializes from the host application's config with
//! sensible defaults, so an empty map yields a working local setup.

use std::collections::BTreeMap;

use lapin::ExchangeKind;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::backoff::RecoveryPolicy;
use crate::error::Error;
use crate::message::PublishOptions;

/// Top-level transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Service name, reported in the outbound `appId` property.
    pub name: String,
    /// Service version, reported in the outbound `appId` property.
    pub version: String,
    /// Broker connection parameters.
    pub connection: ConnectionConfig,
    /// Default exchange for [`publish`](crate::Transport::publish).
    pub exchange: String,
    /// Declaration arguments for the default exchange.
    pub exchange_args: ExchangeConfig,
    /// The optional headers exchange used for literal-route bindings.
    pub headers_exchange: HeadersExchangeConfig,
    /// Create the private reply queue eagerly on connect instead of on
    /// the first RPC call.
    pub private: bool,
    /// Default queue name for consumed queues.
    pub queue: String,
    /// Default routes for consumed queues.
    pub listen: Vec<String>,
    /// Consumer prefetch. `None` consumes with `no_ack`.
    pub neck: Option<u16>,
    /// Merged into every queue declaration.
    pub default_queue_opts: QueueOptions,
    /// Overlay applied to the private reply queue declaration.
    pub private_queue_opts: QueueOptions,
    /// Merged into every outbound publish.
    pub default_opts: PublishOptions,
    /// Default RPC timeout in milliseconds.
    pub timeout: u64,
    /// Response cache capacity (number of entries).
    pub cache: usize,
    /// Backoff policies for queue and consumer re-establishment.
    pub recovery: RecoveryConfig,
    /// Dead-letter exchange behavior.
    pub dlx: DlxConfig,
    /// Additionally bind consumed-queue routes on the headers exchange.
    /// Routes must be literal (no `*` or `#`) in this mode.
    pub bind_persistant_queue_to_headers_exchange: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "microfleet".to_string(),
            version: "n/a".to_string(),
            connection: ConnectionConfig::default(),
            exchange: "microfleet".to_string(),
            exchange_args: ExchangeConfig::default(),
            headers_exchange: HeadersExchangeConfig::default(),
            private: false,
            queue: String::new(),
            listen: Vec::new(),
            neck: None,
            default_queue_opts: QueueOptions::default(),
            private_queue_opts: QueueOptions::default(),
            default_opts: PublishOptions::default(),
            timeout: 10_000,
            cache: 100,
            recovery: RecoveryConfig::default(),
            dlx: DlxConfig::default(),
            bind_persistant_queue_to_headers_exchange: false,
        }
    }
}

/// Broker connection parameters, assembled into an AMQP URI.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login user.
    pub login: String,
    /// Login password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    /// Maximum frame size in bytes.
    pub frame_max: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            login: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: 10,
            frame_max: 131_072,
        }
    }
}

impl ConnectionConfig {
    /// Assembles the AMQP URI for the wire client.
    ///
    /// # Errors
    ///
    /// Returns a validation error when host or credentials do not form a
    /// parseable URI.
    pub fn uri(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|err| Error::Validation(format!("invalid connection host: {err}")))?;
        url.set_username(&self.login)
            .map_err(|()| Error::Validation("invalid connection login".to_string()))?;
        url.set_password(Some(&self.password))
            .map_err(|()| Error::Validation("invalid connection password".to_string()))?;
        if self.vhost != "/" {
            // One path segment; a `/` inside the vhost must arrive
            // percent-encoded at the broker.
            url.path_segments_mut()
                .map_err(|()| Error::Validation("invalid connection host".to_string()))?
                .push(&self.vhost);
        }
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat.to_string())
            .append_pair("frame_max", &self.frame_max.to_string());
        Ok(url)
    }
}

/// Exchange declaration arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeConfig {
    /// Exchange type: `topic`, `direct`, `fanout` or `headers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete once the last binding is removed.
    pub auto_delete: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: "topic".to_string(),
            durable: true,
            auto_delete: false,
        }
    }
}

impl ExchangeConfig {
    /// Maps the configured type onto the wire client's exchange kind.
    #[must_use]
    pub fn exchange_kind(&self) -> ExchangeKind {
        match self.kind.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

/// Name and arguments of the headers exchange used for literal-route
/// bindings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeadersExchangeConfig {
    /// Exchange name.
    pub exchange: String,
    /// Declaration arguments.
    #[serde(flatten)]
    pub args: ExchangeConfig,
}

impl Default for HeadersExchangeConfig {
    fn default() -> Self {
        Self {
            exchange: "amq.match".to_string(),
            args: ExchangeConfig {
                kind: "headers".to_string(),
                durable: true,
                auto_delete: false,
            },
        }
    }
}

/// Queue declaration options.
///
/// `None` fields fall back to the name-dependent defaults: server-named
/// queues are auto-delete and non-durable, named queues durable and
/// permanent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    /// Queue name. Empty requests a server-generated name.
    pub name: String,
    /// Survive broker restarts.
    pub durable: Option<bool>,
    /// Delete once the last consumer disconnects.
    pub auto_delete: Option<bool>,
    /// Restrict the queue to this connection.
    pub exclusive: bool,
    /// Extra `x-*` declaration arguments.
    pub arguments: BTreeMap<String, Value>,
}

impl QueueOptions {
    /// Returns `self` overlaid with the set fields of `overlay`.
    #[must_use]
    pub fn overlaid(&self, overlay: &QueueOptions) -> QueueOptions {
        let mut merged = self.clone();
        if !overlay.name.is_empty() {
            merged.name = overlay.name.clone();
        }
        if overlay.durable.is_some() {
            merged.durable = overlay.durable;
        }
        if overlay.auto_delete.is_some() {
            merged.auto_delete = overlay.auto_delete;
        }
        merged.exclusive |= overlay.exclusive;
        merged
            .arguments
            .extend(overlay.arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Backoff policies for the two recovery paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Private reply queue re-creation.
    pub private: RecoveryPolicy,
    /// Consumed queue re-establishment.
    pub consumed: RecoveryPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            private: RecoveryPolicy::private_default(),
            consumed: RecoveryPolicy::consumed_default(),
        }
    }
}

/// Dead-letter exchange behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DlxConfig {
    /// Route expired and rejected messages through the DLX.
    pub enabled: bool,
    /// DLX exchange name.
    pub exchange: String,
    /// DLX exchange declaration arguments.
    pub params: ExchangeConfig,
}

impl Default for DlxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exchange: "microfleet.dlx".to_string(),
            params: ExchangeConfig {
                kind: "headers".to_string(),
                durable: true,
                auto_delete: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_yields_working_defaults() {
        let config: TransportConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.exchange, "microfleet");
        assert_eq!(config.timeout, 10_000);
        assert_eq!(config.cache, 100);
        assert!(config.dlx.enabled);
        assert_eq!(config.recovery.private.min, 250);
        assert_eq!(config.recovery.consumed.min, 500);
    }

    #[test]
    fn uri_encodes_credentials_and_vhost() {
        let connection = ConnectionConfig {
            vhost: "team/a".to_string(),
            password: "p@ss".to_string(),
            ..ConnectionConfig::default()
        };
        let uri = connection.uri().unwrap();
        assert_eq!(uri.scheme(), "amqp");
        assert_eq!(uri.username(), "guest");
        assert_eq!(uri.password(), Some("p%40ss"));
        assert_eq!(uri.path(), "/team%2Fa");
        assert!(uri.query().unwrap().contains("heartbeat=10"));
    }

    #[test]
    fn default_vhost_stays_off_the_path() {
        let uri = ConnectionConfig::default().uri().unwrap();
        assert!(uri.path().is_empty() || uri.path() == "/");
    }

    #[test]
    fn queue_options_overlay_prefers_set_fields() {
        let base = QueueOptions {
            name: "jobs".to_string(),
            durable: Some(true),
            arguments: BTreeMap::from([("x-max-priority".to_string(), Value::from(5))]),
            ..QueueOptions::default()
        };
        let overlay = QueueOptions {
            durable: Some(false),
            arguments: BTreeMap::from([("x-expires".to_string(), Value::from(60_000))]),
            ..QueueOptions::default()
        };
        let merged = base.overlaid(&overlay);
        assert_eq!(merged.name, "jobs");
        assert_eq!(merged.durable, Some(false));
        assert_eq!(merged.arguments.len(), 2);
    }

    #[test]
    fn exchange_kind_maps_known_types() {
        let args: ExchangeConfig = serde_json::from_str(r#"{"type": "headers"}"#).unwrap();
        assert_eq!(args.exchange_kind(), ExchangeKind::Headers);
        assert!(args.durable);
    }
}
