//! End-to-end scenarios against a live broker.
//!
//! These need a RabbitMQ instance on `localhost:5672` with the default
//! guest credentials, so they are ignored by default:
//!
//! ```sh
//! cargo test --test rpc -- --ignored
//! ```

use std::time::{Duration, Instant};

use microfleet_amqp::{
    Error, Inbound, PublishOptions, QueueOptions, Responder, Transport, TransportConfig,
    TransportEvent,
};
use serde_json::json;

async fn connect(name: &str) -> Transport {
    let config = TransportConfig {
        name: name.to_string(),
        version: "0.0.0-test".to_string(),
        ..TransportConfig::default()
    };
    Transport::connect(config)
        .await
        .expect("broker must be reachable on localhost:5672")
}

async fn echo_handler(inbound: Inbound, responder: Responder) {
    responder.send(inbound.message).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a RabbitMQ broker"]
async fn echo_rpc_round_trips() {
    let server = connect("echo-server").await;
    server
        .create_consumed_queue(
            echo_handler,
            &["echo"],
            QueueOptions {
                name: "echo".to_string(),
                ..QueueOptions::default()
            },
        )
        .await
        .unwrap();

    let client = connect("echo-client").await;

    let reply = client
        .publish_and_wait("echo", &json!({"a": 1}), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({"a": 1}));

    let full = client
        .publish_and_wait_full("echo", &json!({"b": [1, 2, 3]}), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(full.data, json!({"b": [1, 2, 3]}));
    assert!(full.headers.contains_key("x-request-id"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a RabbitMQ broker"]
async fn remote_errors_keep_their_kind_and_reply_headers() {
    let server = connect("error-server").await;
    server
        .create_consumed_queue(
            |_inbound: Inbound, responder: Responder| async move {
                responder
                    .send(Err(Error::Validation("bad".to_string())))
                    .await;
            },
            &["always.fails"],
            QueueOptions {
                name: "always-fails".to_string(),
                ..QueueOptions::default()
            },
        )
        .await
        .unwrap();

    let client = connect("error-client").await;
    let err = client
        .publish_and_wait("always.fails", &json!({}), PublishOptions::default())
        .await
        .unwrap_err();

    let Error::Remote(remote) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(remote.kind, "ValidationError");
    assert_eq!(remote.message, "bad");
    assert!(
        remote.reply_headers.is_some(),
        "reply headers must ride along on remote errors"
    );

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a RabbitMQ broker"]
async fn unrouted_rpc_times_out_on_schedule() {
    let client = connect("timeout-client").await;

    let started = Instant::now();
    let err = client
        .publish_and_wait(
            "nobody.home",
            &json!({}),
            PublishOptions::default().with_timeout(300),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a RabbitMQ broker"]
async fn expired_requests_come_back_as_dead_letters() {
    let client = connect("dlx-client").await;

    // A queue with no consumer: the request sits there until the broker
    // expires it into the DLX and it returns to the private queue.
    client
        .create_queue(QueueOptions {
            name: "sleepy".to_string(),
            ..QueueOptions::default()
        })
        .await
        .unwrap();

    let err = client
        .send_and_wait(
            "sleepy",
            &json!({}),
            PublishOptions::default().with_timeout(500),
        )
        .await
        .unwrap_err();

    let Error::DeadLettered { queue, reason, deaths } = err else {
        panic!("expected a dead-letter rejection, got {err:?}");
    };
    assert_eq!(queue, "sleepy");
    assert_eq!(reason, "expired");
    assert!(!deaths.is_empty());

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a RabbitMQ broker"]
async fn cached_calls_publish_only_once() {
    let server = connect("sum-server").await;
    server
        .create_consumed_queue(
            |inbound: Inbound, responder: Responder| async move {
                let reply = inbound.message.map(|message| {
                    let x = message["x"].as_i64().unwrap_or_default();
                    let y = message["y"].as_i64().unwrap_or_default();
                    json!(x + y)
                });
                responder.send(reply).await;
            },
            &["sum"],
            QueueOptions {
                name: "sum".to_string(),
                ..QueueOptions::default()
            },
        )
        .await
        .unwrap();

    let client = connect("sum-client").await;
    let mut events = client.events();

    let opts = PublishOptions::default().with_cache(5);
    let first = client
        .publish_and_wait("sum", &json!({"x": 1, "y": 2}), opts.clone())
        .await
        .unwrap();
    let second = client
        .publish_and_wait("sum", &json!({"x": 1, "y": 2}), opts)
        .await
        .unwrap();
    assert_eq!(first, json!(3));
    assert_eq!(second, first);

    let mut publishes_to_sum = 0;
    while let Ok(event) = events.try_recv() {
        if let TransportEvent::Publish { routing_key } = event {
            if routing_key == "sum" {
                publishes_to_sum += 1;
            }
        }
    }
    assert_eq!(publishes_to_sum, 1, "second call must be served from cache");

    client.close().await.unwrap();
    server.close().await.unwrap();
}
