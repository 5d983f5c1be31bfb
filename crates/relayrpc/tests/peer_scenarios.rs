//! End-to-end scenarios: peers talking through a hub or a duplex pair.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use relayrpc::Callable;
use relayrpc::Peer;
use relayrpc::PeerConfig;
use relayrpc::RpcError;
use relayrpc::ServiceApi;
use relayrpc::ServiceConfig;
use relayrpc::Value;
use relayrpc::hub::Hub;
use relayrpc::kwargs;
use relayrpc::mock_transport::DuplexChannelTransport;
use relayrpc::value::ByteStream;
use relayrpc::value::MemoryStream;
use relayrpc::value::TypedArray;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn join(hub: &Hub, config: PeerConfig) -> Result<Peer> {
    let transport = hub.connect(config.wire_id())?;
    Ok(Peer::new(config, Box::new(transport))?)
}

fn int_arg(args: &[Value], index: usize) -> relayrpc::Result<i64> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| RpcError::InvalidArgument(format!("argument {index} must be an integer")))
}

/// A small service exercising most value kinds.
fn calc(config: ServiceConfig) -> ServiceApi {
    ServiceApi::Mapping(Value::map([
        ("id", Value::str("calc")),
        ("name", Value::str("Calculator")),
        ("config", config.to_value()),
        (
            "square",
            Value::function(|args: Vec<Value>| async move {
                let x = int_arg(&args, 0)?;
                Ok(Value::Int(x * x))
            }),
        ),
        (
            "echo",
            Value::function(|args: Vec<Value>| async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) }),
        ),
        (
            "apply",
            Value::function(|args: Vec<Value>| async move {
                let f = args
                    .first()
                    .and_then(Value::as_function)
                    .cloned()
                    .ok_or_else(|| RpcError::InvalidArgument("expected a function".into()))?;
                let x = int_arg(&args, 1)?;
                let y = f.call(vec![Value::Int(x)]).await?;
                Ok(Value::Int(y.as_int().unwrap_or_default() + 1))
            }),
        ),
        (
            "open",
            Value::function(|_: Vec<Value>| async move {
                let stream = MemoryStream::new(b"hello world".to_vec()).with_metadata("name", Value::str("greeting.txt"));
                Ok(Value::Stream(Arc::new(stream)))
            }),
        ),
        (
            "slow",
            Value::function(|args: Vec<Value>| async move {
                let secs = int_arg(&args, 0)?;
                tokio::time::sleep(Duration::from_secs(secs as u64)).await;
                Ok(Value::str("done"))
            }),
        ),
        (
            "hang",
            Value::function(|_: Vec<Value>| async move {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            }),
        ),
    ]))
}

#[tokio::test]
async fn test_call_remote_square() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    assert_eq!(svc.id(), "a:calc");
    assert_eq!(svc.name(), Some("Calculator"));
    assert_eq!(svc.call("square", vec![Value::Int(7)]).await?, Value::Int(49));

    assert_eq!(a.session_count(), 0);
    assert_eq!(b.session_count(), 0);
    assert_eq!(b.pending_refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_typed_array_echo() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    let sent = Value::TypedArray(TypedArray::from_slice::<u16>(&[1, 2]));
    let back = svc.call("echo", vec![sent.clone()]).await?;
    assert_eq!(back, sent);
    assert_eq!(back.as_typed_array().unwrap().to_vec::<u16>()?, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_ping() -> Result<()> {
    let hub = Hub::new();
    let _a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    assert_eq!(b.ping("a").await?, Value::str("pong"));
    Ok(())
}

#[tokio::test]
async fn test_protected_service_hidden_from_other_workspace() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a").with_workspace("ws1"))?;
    let neighbour = join(&hub, PeerConfig::new("c").with_workspace("ws1"))?;
    let stranger = join(&hub, PeerConfig::new("b").with_workspace("ws2"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = neighbour.get_remote_service("ws1/a:calc").await?;
    assert_eq!(svc.call("square", vec![Value::Int(3)]).await?, Value::Int(9));

    match stranger.get_remote_service("ws1/a:calc").await {
        Err(RpcError::Remote(message)) => assert!(message.contains("permission denied"), "{message}"),
        other => panic!("expected permission error, got {other:?}"),
    }

    // A raw call straight at the method path is refused too.
    let raw = stranger.call("ws1/a", "services.calc.square", vec![Value::Int(3)]).await;
    assert!(matches!(raw, Err(RpcError::Remote(_))));
    Ok(())
}

#[tokio::test]
async fn test_public_service_reachable_from_other_workspace() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a").with_workspace("ws1"))?;
    let b = join(&hub, PeerConfig::new("b").with_workspace("ws2"))?;
    a.register_service(calc(ServiceConfig::public()), false)?;

    let svc = b.get_remote_service("ws1/a:calc").await?;
    assert_eq!(svc.call("square", vec![Value::Int(5)]).await?, Value::Int(25));
    Ok(())
}

#[tokio::test]
async fn test_missing_service() -> Result<()> {
    let hub = Hub::new();
    let _a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;

    match b.get_remote_service("a:nothing").await {
        Err(RpcError::Remote(message)) => assert!(message.contains("not found"), "{message}"),
        other => panic!("expected not found, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_overwrite_emits_single_update() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    a.on("service-updated", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let duplicate = a.register_service(calc(ServiceConfig::default()), false);
    assert!(matches!(duplicate, Err(RpcError::ServiceExists(_))));
    assert_eq!(updates.load(Ordering::SeqCst), 0);

    a.register_service(calc(ServiceConfig::public()), true)?;
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_function_argument_called_back() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    let double = Callable::sync(|args| Ok(Value::Int(args[0].as_int().unwrap_or_default() * 2)));
    let result = svc.call("apply", vec![Value::Function(double), Value::Int(20)]).await?;
    assert_eq!(result, Value::Int(41));

    assert_eq!(b.session_count(), 0);
    assert_eq!(b.pending_refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_settled_callback_sessions_are_freed() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    let inc = Callable::sync(|args| Ok(Value::Int(args[0].as_int().unwrap_or_default() + 1)));
    for i in 0..100 {
        let result = svc.call("apply", vec![Value::Function(inc.clone()), Value::Int(i)]).await?;
        assert_eq!(result, Value::Int(i + 2));
    }
    assert_eq!(b.session_count(), 0);
    assert_eq!(b.pending_refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_kwargs_arrive_as_plain_map() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    let back = svc
        .call("echo", vec![kwargs([("loud", Value::Bool(true)), ("times", Value::Int(3))])])
        .await?;
    assert!(!back.is_kwargs());
    assert_eq!(back.get("loud"), Some(&Value::Bool(true)));
    assert_eq!(back.get("times"), Some(&Value::Int(3)));
    Ok(())
}

#[tokio::test]
async fn test_remote_stream() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let svc = b.get_remote_service("a:calc").await?;
    let Value::Stream(stream) = svc.call("open", vec![]).await? else {
        panic!("expected a stream");
    };
    assert_eq!(stream.read(Some(5)).await?, b"hello".to_vec());
    assert_eq!(stream.seek(6).await?, 6);
    assert_eq!(stream.read(None).await?, b"world".to_vec());
    assert!(stream.metadata().contains(&("name".to_string(), Value::str("greeting.txt"))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_slow_call_alive() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let result = b
        .call_with_timeout("a", "services.calc.slow", vec![Value::Int(3)], Duration::from_secs(1))
        .await?;
    assert_eq!(result, Value::str("done"));
    assert_eq!(b.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = reasons.clone();
    b.on("disconnect", move |value| {
        seen.lock().push(value.get("reason").cloned());
    });

    let caller = b.clone();
    let pending = tokio::spawn(async move { caller.call("a", "services.calc.hang", vec![]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.session_count(), 1);

    b.disconnect(Some("bye")).await;
    assert!(matches!(pending.await?, Err(RpcError::Disconnected)));
    assert_eq!(b.session_count(), 0);
    assert_eq!(b.pending_refs(), 0);
    assert_eq!(reasons.lock().as_slice(), &[Some(Value::str("bye"))]);
    assert!(!hub.contains("b"));
    Ok(())
}

#[tokio::test]
async fn test_large_payload_is_chunked() -> Result<()> {
    init_tracing();
    let max = 4096;
    let (near, far) = DuplexChannelTransport::pair();
    let b_sizes = near.sent_sizes();
    let a_sizes = far.sent_sizes();
    let b = Peer::new(PeerConfig::new("b").with_max_message_buffer_size(max), Box::new(near))?;
    let a = Peer::new(PeerConfig::new("a").with_max_message_buffer_size(max), Box::new(far))?;
    a.register_service(calc(ServiceConfig::default()), false)?;

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let svc = b.get_remote_service("a:calc").await?;
    let back = svc.call("echo", vec![Value::Bytes(payload.clone())]).await?;
    assert_eq!(back.as_bytes(), Some(payload.as_slice()));

    for sizes in [b_sizes, a_sizes] {
        let sizes = sizes.lock();
        assert!(sizes.len() > 5, "expected a chunked transfer, saw {sizes:?}");
        assert!(sizes.iter().all(|&n| n < payload.len()), "{sizes:?}");
    }
    Ok(())
}

/// A manager exporting the `default` service peers report to. Every call
/// it receives is forwarded to `seen` as `(member, first argument)`.
fn manager(seen: mpsc::UnboundedSender<(String, Value)>, token_life_time: f64) -> ServiceApi {
    let issued = Arc::new(AtomicUsize::new(0));
    let record = |member: &'static str| {
        let seen = seen.clone();
        Value::function(move |args: Vec<Value>| {
            let seen = seen.clone();
            async move {
                let _ = seen.send((member.to_string(), args.into_iter().next().unwrap_or(Value::Null)));
                Ok(Value::Null)
            }
        })
    };
    ServiceApi::Mapping(Value::map([
        ("id", Value::str("default")),
        (
            "get_connection_info",
            Value::function(move |_: Vec<Value>| {
                let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    Ok(Value::map([
                        ("reconnection_token", Value::str(format!("token-{n}"))),
                        ("reconnection_token_life_time", Value::Float(token_life_time)),
                    ]))
                }
            }),
        ),
        ("register_service", record("register_service")),
        ("unregister_service", record("unregister_service")),
    ]))
}

async fn next_report(seen: &mut mpsc::UnboundedReceiver<(String, Value)>) -> Result<(String, Value)> {
    let report = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await?;
    report.ok_or_else(|| anyhow::anyhow!("manager went away"))
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_token_refreshes_before_expiry() -> Result<()> {
    init_tracing();
    let hub = Hub::new();
    let (tx, _seen) = mpsc::unbounded_channel();
    let m = join(&hub, PeerConfig::new("manager"))?;
    m.register_service(manager(tx, 10.0), false)?;

    let _c = join(&hub, PeerConfig::new("c").with_manager("manager"))?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.reconnection_token("c").as_deref(), Some("token-1"));

    // Refreshed at 80% of the ten second lifetime.
    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert_eq!(hub.reconnection_token("c").as_deref(), Some("token-1"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.reconnection_token("c").as_deref(), Some("token-2"));

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(hub.reconnection_token("c").as_deref(), Some("token-3"));
    Ok(())
}

#[tokio::test]
async fn test_manager_hears_registrations() -> Result<()> {
    let hub = Hub::new();
    let (tx, mut seen) = mpsc::unbounded_channel();
    let m = join(&hub, PeerConfig::new("manager"))?;
    m.register_service(manager(tx, 3600.0), false)?;
    let c = join(&hub, PeerConfig::new("c").with_manager("manager"))?;

    let updates = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = updates.clone();
    c.on("service-updated", move |event| {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        log.lock().push(kind);
    });

    c.register_service(calc(ServiceConfig::default()), false)?;
    let (member, descriptor) = next_report(&mut seen).await?;
    assert_eq!(member, "register_service");
    assert_eq!(descriptor.get("id"), Some(&Value::str("c:calc")));

    c.unregister_service("calc", true)?;
    let (member, id) = next_report(&mut seen).await?;
    assert_eq!(member, "unregister_service");
    assert_eq!(id, Value::str("c:calc"));

    // Without notify the manager is left alone, but listeners still hear it.
    c.register_service(calc(ServiceConfig::default()), false)?;
    assert_eq!(next_report(&mut seen).await?.0, "register_service");
    c.unregister_service("calc", false)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.try_recv().is_err());

    assert_eq!(updates.lock().as_slice(), &["add", "remove", "add", "remove"]);
    assert!(!c.list_services().iter().any(|s| s.get("id") == Some(&Value::str("c:calc"))));
    Ok(())
}

#[tokio::test]
async fn test_reset_keeps_builtin_service() -> Result<()> {
    let hub = Hub::new();
    let a = join(&hub, PeerConfig::new("a"))?;
    let b = join(&hub, PeerConfig::new("b"))?;

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    a.on("service-updated", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    a.register_service(calc(ServiceConfig::default()), false)?;
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    a.reset()?;
    let ids: Vec<Value> = a.list_services().iter().filter_map(|s| s.get("id").cloned()).collect();
    assert_eq!(ids, vec![Value::str("a:built-in")]);

    a.emit("service-updated", &Value::Null);
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    assert_eq!(b.ping("a").await?, Value::str("pong"));
    assert!(b.get_remote_service("a:calc").await.is_err());
    Ok(())
}
