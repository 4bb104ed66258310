//! Controller and endpoint agent talking over a loopback WebSocket.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use remote_channel_core::{
    ChannelConfig, ErrorKind, Handshake, PortFrame, ReconnectConfig, RemoteError, Role,
    protocol::ENDPOINT_PORT_CHANNEL,
};
use remote_channel_session::{Controller, Dispatcher, EndpointAgent};
use remote_channel_transport::{Bus, Port, Transport};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

struct Harness {
    controller: Controller,
    agent: Arc<EndpointAgent>,
    runner: JoinHandle<Result<(), remote_channel_core::ConnectionError>>,
    executions: Arc<AtomicUsize>,
}

async fn start(session_id: &'static str) -> Harness {
    let controller = Controller::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        "controller",
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register_fn("echo", |args| async move { Ok(args) })
        .register_fn("fail", |_| async {
            Err(RemoteError::new("refused").with_detail(json!({"code": 7})))
        });
    dispatcher.register_fn("count", {
        let executions = Arc::clone(&executions);
        move |_| {
            let executions = Arc::clone(&executions);
            async move { Ok(json!(executions.fetch_add(1, Ordering::SeqCst) + 1)) }
        }
    });

    let agent = Arc::new(EndpointAgent::new(dispatcher).with_reconnect(ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts: None,
    }));
    let runner = tokio::spawn({
        let agent = Arc::clone(&agent);
        let url = controller.url();
        async move { agent.run(&url, session_id).await }
    });

    Harness {
        controller,
        agent,
        runner,
        executions,
    }
}

/// Endpoint driven by hand, so the test sees the raw port frames.
async fn dial_endpoint(url: &str, session_id: &str) -> (Bus, Port) {
    let transport = Transport::connect(url).await.unwrap();
    let bus = Bus::dial(
        transport,
        Handshake::new(Role::Endpoint, session_id),
        ChannelConfig::default(),
    );
    let port = bus.open_port(ENDPOINT_PORT_CHANNEL);
    bus.handshake().await.unwrap();
    (bus, port)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = start("s1").await;

    let reply = harness
        .controller
        .invoke("s1", "echo", json!("x"))
        .await
        .unwrap();
    assert_eq!(reply, json!("x"));

    harness.agent.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_remote_failure_keeps_endpoint_usable() {
    let harness = start("s1").await;

    let err = harness
        .controller
        .invoke("s1", "fail", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteExecution);
    match err {
        remote_channel_core::ChannelError::Remote(remote) => {
            assert_eq!(remote.message, "refused");
            assert_eq!(remote.detail, Some(json!({"code": 7})));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = harness
        .controller
        .invoke("s1", "no-such-instruction", Value::Null)
        .await
        .unwrap_err();
    assert!(err.is_remote());

    let reply = harness
        .controller
        .invoke("s1", "echo", json!({"still": "alive"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"still": "alive"}));

    harness.agent.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_request_pending_across_drop_runs_once() {
    let harness = start("s1").await;
    let controller = &harness.controller;
    controller.wait_for_endpoint("s1").await.unwrap();

    // Forced drop. Whatever the controller tried on the dead link is
    // replayed once the agent is back.
    assert!(harness.agent.disconnect());

    let reply = controller.invoke("s1", "count", Value::Null).await.unwrap();
    assert_eq!(reply, json!(1));
    assert_eq!(controller.registry().pending_count("s1"), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.executions.load(Ordering::SeqCst), 1);

    harness.agent.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_endpoint_connecting_late_receives_queued_request() {
    let controller = Controller::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        "controller",
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    let request = controller.invoke("late", "echo", json!("queued"));
    let connect = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_fn("echo", |args| async move { Ok(args) });
        let agent = EndpointAgent::new(dispatcher);
        agent.connect(&controller.url(), "late").await.unwrap()
    };

    let (reply, bus) = tokio::join!(request, connect);
    assert_eq!(reply.unwrap(), json!("queued"));
    bus.close();
}

#[tokio::test]
async fn test_controller_close_drops_endpoints() {
    let harness = start("s1").await;
    harness.controller.wait_for_endpoint("s1").await.unwrap();

    harness.controller.close();
    wait_until(|| !harness.controller.registry().is_connected("s1")).await;
    assert_eq!(harness.controller.connection_count(), 0);

    harness.agent.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_replay_after_drop_keeps_request_id() {
    let controller = Controller::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        "controller",
        ChannelConfig::default(),
    )
    .await
    .unwrap();
    let url = controller.url();

    let request = controller.invoke("raw", "echo", json!("again"));
    let endpoint = async {
        let (first_bus, mut first_port) = dial_endpoint(&url, "raw").await;
        let original = first_port.recv().await.unwrap();
        first_bus.close();

        let (bus, mut port) = dial_endpoint(&url, "raw").await;
        let replayed = port.recv().await.unwrap();
        assert_eq!(replayed.id(), original.id());
        assert_eq!(replayed, original);

        port.send(PortFrame::message(replayed.id(), json!("again")))
            .unwrap();
        (bus, port)
    };

    let (reply, (bus, _port)) = tokio::join!(request, endpoint);
    assert_eq!(reply.unwrap(), json!("again"));
    assert_eq!(controller.registry().pending_count("raw"), 0);
    bus.close();
}
