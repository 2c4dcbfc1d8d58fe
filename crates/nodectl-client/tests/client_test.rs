//! Client integration tests against a loopback agent.

use std::sync::Arc;
use std::time::Duration;

use nodectl_client::{
    with_client_using, ClientConfig, ConnectionRegistry, Endpoint, NodectlError, Result, RpcClient,
    StreamReader,
};
use nodectl_common::protocol::{
    methods, ClientMessage, DmesgOptions, Request, RequestId, ServerMessage,
};
use nodectl_common::transport::{
    read_frame, write_frame, JsonCodec, ResponseSink, UnixServer, DEFAULT_MAX_MESSAGE_SIZE,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

const BOOT_LOG: [&str; 3] = [
    "[    0.000000] Linux version 6.6.0\n",
    "[    0.000001] Command line: console=ttyS0\n",
    "[    0.000002] BIOS-provided physical RAM map\n",
];

async fn agent(request: Request, sink: ResponseSink) -> Result<()> {
    match request.method.as_str() {
        methods::MACHINE_DMESG => {
            let options: DmesgOptions = serde_json::from_value(request.args)?;
            if !options.tail {
                for line in BOOT_LOG {
                    sink.send_data(line).await?;
                }
            }
            if options.follow {
                loop {
                    sink.send_data("[   10.000000] tick\n").await?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            Ok(())
        }
        methods::RUNTIME_VERSION => sink.reply(json!({"version": "1.7.0"})).await,
        methods::RUNTIME_STATUS => sink.reply(json!({"ready": true})).await,
        methods::IMAGE_LIST => sink.reply(json!({"images": ["registry.k8s.io/pause:3.9"]})).await,
        methods::IMAGE_FS_INFO => Err(NodectlError::Remote("image filesystem unavailable".into())),
        other => Err(NodectlError::Remote(format!("unknown method {}", other))),
    }
}

fn start_agent() -> (tempfile::TempDir, Endpoint) {
    let dir = tempfile::tempdir().unwrap();
    let server = UnixServer::bind(dir.path().join("agent.sock")).unwrap();
    let endpoint = server.endpoint();
    tokio::spawn(server.run_with_handler(agent));
    (dir, endpoint)
}

/// Accepts one connection on `listener` and reads the first call on it.
async fn accept_call(listener: &UnixListener) -> (UnixStream, RequestId) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let frame = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .unwrap()
        .unwrap();
    match JsonCodec::decode_client(&frame).unwrap() {
        ClientMessage::Call(request) => (stream, request.id),
        other => panic!("expected call, got {:?}", other),
    }
}

async fn send_frame(stream: &mut UnixStream, message: &ServerMessage) {
    write_frame(stream, &JsonCodec::encode(message).unwrap())
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

async fn open(endpoint: &Endpoint, registry: &Arc<ConnectionRegistry>) -> RpcClient {
    RpcClient::open_with_registry(endpoint.clone(), ClientConfig::default(), registry.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_open_close_restores_tracked_count() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());

    let first = open(&endpoint, &registry).await;
    let second = open(&endpoint, &registry).await;
    assert_eq!(registry.tracked_count(), 2);
    assert!(registry.is_tracked(first.id()));

    // closing works whether or not a call was made
    first.runtime().version().await.unwrap();
    first.close().await.unwrap();
    second.close().await.unwrap();

    assert_eq!(registry.tracked_count(), 0);
    assert!(registry.leaked().is_empty());
}

#[tokio::test]
async fn test_double_close_is_registry_invariant() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    client.close().await.unwrap();
    let second = client.close().await;

    assert!(matches!(second, Err(NodectlError::RegistryInvariant(_))));
    assert_eq!(registry.tracked_count(), 0);
    assert_eq!(registry.invariant_violations(), 1);
}

#[tokio::test]
async fn test_drop_without_close_is_reported_as_leaked() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let closed = open(&endpoint, &registry).await;
    let dropped = open(&endpoint, &registry).await;
    let dropped_id = dropped.id();

    drop(dropped);

    let leaked = registry.leaked();
    assert_eq!(leaked.len(), 1);
    assert_eq!(leaked[0].id, dropped_id);
    assert_eq!(leaked[0].endpoint, endpoint);

    closed.close().await.unwrap();
    assert_eq!(registry.tracked_count(), 1);
}

#[tokio::test]
async fn test_connect_to_missing_socket_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());
    let endpoint = Endpoint::new(dir.path().join("absent.sock"));

    let result =
        RpcClient::open_with_registry(endpoint, ClientConfig::default(), registry.clone()).await;

    let err = result.unwrap_err();
    assert!(matches!(err, NodectlError::Connection(_)));
    assert!(err.is_retryable());
    assert_eq!(registry.tracked_count(), 0);
}

#[tokio::test]
async fn test_unary_stubs() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    assert_eq!(client.runtime().version().await.unwrap()["version"], "1.7.0");
    assert_eq!(client.runtime().status().await.unwrap()["ready"], true);

    let services = client.services();
    let images = services.images.list_images().await.unwrap();
    assert_eq!(images["images"][0], "registry.k8s.io/pause:3.9");

    let err = services.images.image_fs_info().await.unwrap_err();
    assert!(matches!(err, NodectlError::Remote(ref m) if m.contains("image filesystem unavailable")));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_dmesg_drains_to_natural_end() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();
    let mut lines = Vec::new();
    let count = StreamReader::new(stream)
        .drain(|chunk| {
            lines.push(String::from_utf8(chunk).unwrap());
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(count, 3);
    assert_eq!(lines, BOOT_LOG);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_stops_drain() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();
    let mut seen = 0;
    let result = StreamReader::new(stream)
        .drain(|_chunk| {
            seen += 1;
            let fail = seen == 2;
            async move {
                if fail {
                    Err(NodectlError::Remote("stdout closed".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(matches!(result, Err(NodectlError::Handler(ref m)) if m.contains("stdout closed")));
    assert_eq!(seen, 2);

    // the connection stays usable after a handler failure
    client.runtime().version().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_cancellation_stops_followed_stream() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;
    let token = CancellationToken::new();

    let stream = client
        .machine()
        .dmesg(DmesgOptions::default().follow(true))
        .await
        .unwrap();
    let mut seen = 0;
    let result = StreamReader::new(stream)
        .with_cancellation(token.clone())
        .drain(|_chunk| {
            seen += 1;
            if seen == 5 {
                token.cancel();
            }
            async { Ok(()) }
        })
        .await;

    assert!(matches!(result, Err(NodectlError::Cancelled)));
    assert_eq!(seen, 5);

    client.runtime().status().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(registry.tracked_count(), 0);
}

#[tokio::test]
async fn test_tail_skips_existing_log() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    let mut stream = client
        .machine()
        .dmesg(DmesgOptions::default().follow(true).tail(true))
        .await
        .unwrap();
    let first = stream.recv().await.unwrap().unwrap();
    assert_eq!(first, b"[   10.000000] tick\n");

    drop(stream);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_fails_open_streams_with_transport_error() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&endpoint, &registry).await;

    let mut stream = client
        .machine()
        .dmesg(DmesgOptions::default().follow(true))
        .await
        .unwrap();
    assert!(stream.recv().await.unwrap().is_some());

    client.close().await.unwrap();

    let err = loop {
        match stream.recv().await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("followed stream ended cleanly after close"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, NodectlError::Transport(_)));
    assert!(client.services().runtime.version().await.is_err());
}

#[tokio::test]
async fn test_oversized_frame_is_transport_error() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let config = ClientConfig::default().with_max_message_size(16);
    let client = RpcClient::open_with_registry(endpoint, config, registry.clone())
        .await
        .unwrap();

    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();
    let result = StreamReader::new(stream).drain(|_| async { Ok(()) }).await;

    match result {
        Err(NodectlError::Transport(message)) => assert!(message.contains("too large")),
        other => panic!("expected transport error, got {:?}", other),
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_mid_stream_is_transport_not_handler() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flaky.sock");
    let listener = UnixListener::bind(&path).unwrap();

    // answers the first call with one chunk, then hangs up
    tokio::spawn(async move {
        let (mut stream, id) = accept_call(&listener).await;
        let data = ServerMessage::Data {
            id,
            bytes: b"[    0.000000] partial\n".to_vec(),
        };
        send_frame(&mut stream, &data).await;
    });

    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&Endpoint::new(&path), &registry).await;
    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();

    let mut seen = 0;
    let result = StreamReader::new(stream)
        .drain(|_| {
            seen += 1;
            async { Ok(()) }
        })
        .await;

    assert_eq!(seen, 1);
    let err = result.unwrap_err();
    assert!(matches!(err, NodectlError::Transport(_)), "got {:?}", err);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_with_client_closes_on_error_path() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());

    let version = with_client_using(
        registry.clone(),
        endpoint.clone(),
        ClientConfig::default(),
        |client| Box::pin(async move { client.runtime().version().await }),
    )
    .await
    .unwrap();
    assert_eq!(version["version"], "1.7.0");

    let result = with_client_using(
        registry.clone(),
        endpoint,
        ClientConfig::default(),
        |client| Box::pin(async move { client.images().image_fs_info().await }),
    )
    .await;

    assert!(matches!(result, Err(NodectlError::Remote(_))));
    assert_eq!(registry.tracked_count(), 0);
    assert!(registry.leaked().is_empty());
    assert_eq!(registry.invariant_violations(), 0);
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_other_calls() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let config = ClientConfig::default()
        .with_call_timeout(Some(Duration::from_secs(2)))
        .with_stream_buffer(4);
    let client = RpcClient::open_with_registry(endpoint, config, registry.clone())
        .await
        .unwrap();

    let mut followed = client
        .machine()
        .dmesg(DmesgOptions::default().follow(true))
        .await
        .unwrap();
    // long enough for the agent to fill the window many times over
    tokio::time::sleep(Duration::from_millis(500)).await;

    let version = client.runtime().version().await.unwrap();
    assert_eq!(version["version"], "1.7.0");
    client.images().list_images().await.unwrap();

    // the held stream resumes where it left off
    let first = followed.recv().await.unwrap().unwrap();
    assert_eq!(first, BOOT_LOG[0].as_bytes());

    drop(followed);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_stream_buffer_still_streams() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());
    let config = ClientConfig {
        stream_buffer: 0,
        ..ClientConfig::default()
    };
    let client = RpcClient::open_with_registry(endpoint, config, registry.clone())
        .await
        .unwrap();

    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();
    let count = tokio::time::timeout(
        Duration::from_secs(5),
        StreamReader::new(stream).drain(|_| async { Ok(()) }),
    )
    .await
    .expect("drain finishes with a one-frame window")
    .unwrap();

    assert_eq!(count, BOOT_LOG.len() as u64);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_frame_fails_pending_calls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbled.sock");
    let listener = UnixListener::bind(&path).unwrap();

    // one chunk, then a frame that is not a message, and the connection stays up
    tokio::spawn(async move {
        let (mut stream, id) = accept_call(&listener).await;
        let data = ServerMessage::Data {
            id,
            bytes: b"[    0.000000] Linux version 6.6.0\n".to_vec(),
        };
        send_frame(&mut stream, &data).await;
        write_frame(&mut stream, b"{\"type\":\"end\",\"id\":").await.unwrap();
        stream.flush().await.unwrap();
        std::future::pending::<()>().await;
    });

    let registry = Arc::new(ConnectionRegistry::new());
    let client = open(&Endpoint::new(&path), &registry).await;
    let stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();

    let mut seen = 0;
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        StreamReader::new(stream).drain(|_| {
            seen += 1;
            async { Ok(()) }
        }),
    )
    .await
    .expect("drain does not hang on a garbled frame");

    assert_eq!(seen, 1);
    match result {
        Err(NodectlError::Transport(message)) => assert!(message.contains("undecodable")),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(client.channel().is_closed());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_agent_overrunning_window_fails_only_that_call() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greedy.sock");
    let listener = UnixListener::bind(&path).unwrap();

    // ignores the window and sends everything at once
    tokio::spawn(async move {
        let (mut stream, id) = accept_call(&listener).await;
        for i in 0..5 {
            let data = ServerMessage::Data {
                id,
                bytes: format!("line {}\n", i).into_bytes(),
            };
            send_frame(&mut stream, &data).await;
        }
        send_frame(&mut stream, &ServerMessage::End { id }).await;
        std::future::pending::<()>().await;
    });

    let registry = Arc::new(ConnectionRegistry::new());
    let config = ClientConfig::default().with_stream_buffer(2);
    let client = RpcClient::open_with_registry(Endpoint::new(&path), config, registry.clone())
        .await
        .unwrap();
    let mut stream = client.machine().dmesg(DmesgOptions::default()).await.unwrap();

    // let every frame reach the reader before consuming any
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(stream.recv().await.unwrap().unwrap(), b"line 0\n");
    assert_eq!(stream.recv().await.unwrap().unwrap(), b"line 1\n");
    match stream.recv().await {
        Err(NodectlError::Transport(message)) => assert!(message.contains("unread frames")),
        other => panic!("expected transport error, got {:?}", other),
    }

    assert!(!client.channel().is_closed());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_with_client_closes_when_dropped_mid_call() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());

    let scoped = with_client_using(
        registry.clone(),
        endpoint,
        ClientConfig::default(),
        |client| {
            Box::pin(async move {
                let _log = client
                    .machine()
                    .dmesg(DmesgOptions::default().follow(true))
                    .await?;
                std::future::pending::<Result<()>>().await
            })
        },
    );
    let timed_out = tokio::time::timeout(Duration::from_millis(100), scoped).await;

    assert!(timed_out.is_err());
    assert_eq!(registry.tracked_count(), 0);
    assert!(registry.leaked().is_empty());
    assert_eq!(registry.invariant_violations(), 0);
}

#[tokio::test]
async fn test_with_client_closes_when_body_panics() {
    let (_dir, endpoint) = start_agent();
    let registry = Arc::new(ConnectionRegistry::new());

    let scoped = with_client_using(
        registry.clone(),
        endpoint,
        ClientConfig::default(),
        |client| {
            Box::pin(async move {
                let version = client.runtime().version().await;
                if version.is_ok() {
                    panic!("scope body failed");
                }
                version
            })
        },
    );
    let joined = tokio::spawn(scoped).await;

    assert!(joined.unwrap_err().is_panic());
    assert_eq!(registry.tracked_count(), 0);
    assert!(registry.leaked().is_empty());
}
