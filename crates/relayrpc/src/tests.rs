use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use relaypack::Encoder;
use relaypack::Packed;

use crate::DecodeContext;
use crate::chunk;
use crate::chunk::MessageCache;
use crate::codec::Codec;
use crate::config::PeerConfig;
use crate::envelope::CallbackRef;
use crate::envelope::Envelope;
use crate::envelope::MethodRef;
use crate::error::RpcError;
use crate::hub::Hub;
use crate::message::Frame;
use crate::message::Header;
use crate::mock_transport::DuplexChannelTransport;
use crate::peer::Peer;
use crate::refstore::RefStore;
use crate::refstore::StoreEvent;
use crate::service::ServiceConfig;
use crate::service::ServiceUri;
use crate::service::Visibility;
use crate::session::SessionStore;
use crate::transport::Transport;
use crate::value::Callable;
use crate::value::CustomValue;
use crate::value::DType;
use crate::value::NdArray;
use crate::value::TypedArray;
use crate::value::Value;
use crate::value::kwargs;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn noop() -> Callable {
    Callable::sync(|_| Ok(Value::Null))
}

/// A peer wired to a raw transport end the test drives by hand.
fn raw_peer(config: PeerConfig) -> (Peer, DuplexChannelTransport) {
    let (near, far) = DuplexChannelTransport::pair();
    let peer = Peer::new(config, Box::new(near)).unwrap();
    (peer, far)
}

// ============================================================================
//  REFERENCE STORE
// ============================================================================

#[test]
fn test_handles_are_reused_smallest_first() {
    let mut store = RefStore::new();
    let (a, _) = store.put("a");
    let (b, _) = store.put("b");
    let (c, _) = store.put("c");
    assert_eq!((a, b, c), (0, 1, 2));

    store.fetch(2);
    store.fetch(0);
    assert_eq!(store.put("d").0, 0);
    assert_eq!(store.put("e").0, 2);
    assert_eq!(store.put("f").0, 3);
}

#[test]
fn test_handle_is_single_use() {
    let mut store = RefStore::new();
    let (h, _) = store.put("once");
    assert_eq!(store.fetch(h).0, Some("once"));
    assert_eq!(store.fetch(h).0, None);
    assert_eq!(store.fetch(99).0, None);
}

#[test]
fn test_pair_releases_both_halves() {
    let mut store = RefStore::new();
    let ((resolve, reject), _) = store.put_pair("resolve", "reject", Some("s1"));
    assert_eq!(store.fetch(reject).0, Some("reject"));
    assert_eq!(store.fetch(resolve).0, None);
    assert!(store.is_empty());
}

#[test]
fn test_busy_and_ready_fire_once_per_drain() {
    let mut store = RefStore::new();
    assert_eq!(store.put(1).1, Some(StoreEvent::Busy));
    assert_eq!(store.put(2).1, None);
    assert_eq!(store.fetch(0).1, None);
    assert_eq!(store.fetch(1).1, Some(StoreEvent::Ready));
    assert_eq!(store.fetch(1).1, None);
    assert_eq!(store.put(3).1, Some(StoreEvent::Busy));
}

#[test]
fn test_release_respects_owner() {
    let mut store = RefStore::new();
    let ((a, _), _) = store.put_pair("x", "y", Some("mine"));
    assert_eq!(store.release(a, Some("theirs")), None);
    assert_eq!(store.len(), 2);
    assert_eq!(store.release(a, Some("mine")), Some(StoreEvent::Ready));
    assert!(store.is_empty());
}

// ============================================================================
//  SESSIONS
// ============================================================================

#[test]
fn test_mint_addresses_under_session() {
    let sessions = SessionStore::new();
    assert_eq!(sessions.mint("s1", "peer", noop()), "s1.0");
    assert_eq!(sessions.mint("s1", "peer", noop()), "s1.1");
    assert_eq!(sessions.len(), 1);
    assert!(sessions.lookup("s1.1", "peer").is_ok());
}

#[test]
fn test_session_callbacks_answer_only_their_peer() {
    let sessions = SessionStore::new();
    let path = sessions.mint("s1", "alice", noop());
    assert!(matches!(sessions.lookup(&path, "mallory"), Err(RpcError::Permission(_))));
    assert!(matches!(sessions.lookup("s1.7", "alice"), Err(RpcError::NotFound(_))));
    assert!(matches!(sessions.lookup("nope.0", "alice"), Err(RpcError::NotFound(_))));
}

#[test]
fn test_closing_parent_closes_descendants() {
    let sessions = SessionStore::new();
    sessions.mint("p", "peer", noop());
    sessions.mint("p.c", "peer", noop());
    sessions.mint("p.c.g", "peer", noop());
    sessions.mint("pq", "peer", noop());

    let closed = sessions.close("p");
    assert_eq!(closed.len(), 3);
    assert!(!sessions.contains("p.c.g"));
    assert!(sessions.contains("pq"));
}

// ============================================================================
//  CHUNKING & CONFIG
// ============================================================================

#[test]
fn test_chunk_threshold_is_inclusive() {
    let max = chunk::DEFAULT_MAX_MESSAGE_BUFFER_SIZE;
    assert_eq!(max, 500 * 1024 + 1024);
    assert!(!chunk::should_chunk(max, max));
    assert!(chunk::should_chunk(max + 1, max));
}

#[test]
fn test_chunks_reassemble_in_order() {
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let pieces: Vec<&[u8]> = chunk::chunks(&data, 4096).collect();
    assert_eq!(pieces.len(), 3);
    assert!(pieces.iter().all(|p| p.len() <= 4096));
    assert_eq!(pieces.concat(), data);
}

#[tokio::test]
async fn test_message_cache_is_owner_scoped() {
    let cache = MessageCache::new();
    cache.create("m1", "alice", None).unwrap();
    cache.append("m1", "alice", b"hel").unwrap();

    assert!(matches!(cache.create("m1", "mallory", None), Err(RpcError::Permission(_))));
    assert!(matches!(cache.append("m1", "mallory", b"x"), Err(RpcError::Permission(_))));
    assert!(!cache.remove("m1", "mallory"));
    assert!(cache.take("m1", "mallory").is_err());

    cache.append("m1", "alice", b"lo").unwrap();
    assert_eq!(cache.take("m1", "alice").unwrap(), b"hello".to_vec());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_message_cache_owner_may_restart_or_remove() {
    let cache = MessageCache::new();
    cache.create("m1", "alice", None).unwrap();
    cache.append("m1", "alice", b"stale").unwrap();
    cache.create("m1", "alice", None).unwrap();
    cache.append("m1", "alice", b"fresh").unwrap();
    assert_eq!(cache.take("m1", "alice").unwrap(), b"fresh".to_vec());

    cache.create("m2", "alice", None).unwrap();
    assert!(cache.remove("m2", "alice"));
    assert!(!cache.remove("m2", "alice"));
    assert_eq!(cache.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_cache_entry_expires_when_idle() {
    let cache = MessageCache::new();
    cache.create("m1", "alice", Some(Duration::from_secs(2))).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    cache.append("m1", "alice", b"a").unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cache.is_empty());
}

#[test]
fn test_config_validation() {
    assert!(PeerConfig::new("a").validate().is_ok());
    assert!(matches!(PeerConfig::new("").validate(), Err(RpcError::Config(_))));
    assert!(PeerConfig::new("a:b").validate().is_err());
    assert!(PeerConfig::new("a").with_workspace("w/x").validate().is_err());
    assert!(PeerConfig::new("a").with_max_message_buffer_size(0).validate().is_err());
    assert_eq!(PeerConfig::new("a").with_workspace("ws").wire_id(), "ws/a");
}

#[test]
fn test_service_uri_forms() {
    let full = ServiceUri::parse("ws/client:svc").unwrap();
    assert_eq!(full.workspace.as_deref(), Some("ws"));
    assert_eq!(full.client_id.as_deref(), Some("client"));
    assert_eq!(full.service_id, "svc");

    let bare = ServiceUri::parse("svc").unwrap();
    assert_eq!((bare.workspace, bare.client_id), (None, None));
    assert!(ServiceUri::parse("client:").is_err());
}

#[tokio::test]
async fn test_hub_token_lives_with_route() {
    let hub = Hub::new();
    let transport = hub.connect("c").unwrap();
    assert_eq!(transport.address(), "c");
    assert!(transport.supports_reconnection_token());
    assert_eq!(transport.reconnection_token(), None);

    transport.set_reconnection_token("t1");
    assert_eq!(transport.reconnection_token().as_deref(), Some("t1"));
    assert_eq!(hub.reconnection_token("c").as_deref(), Some("t1"));
    assert!(hub.connect("c").is_err());

    transport.disconnect(None).await;
    assert!(!hub.contains("c"));
    assert_eq!(hub.reconnection_token("c"), None);

    // A stale transport cannot touch the route of a newer connection.
    let fresh = hub.connect("c").unwrap();
    transport.set_reconnection_token("stale");
    drop(transport);
    assert!(hub.contains("c"));
    assert_eq!(fresh.reconnection_token(), None);
}

// ============================================================================
//  ENVELOPES & FRAMES
// ============================================================================

#[test]
fn test_envelope_classification() {
    let method = MethodRef::new("ws/a", "services.calc.square", true).to_packed();
    match Envelope::parse(&method).unwrap() {
        Some(Envelope::Method(m)) => {
            assert_eq!(m.target, "ws/a");
            assert_eq!(m.method, "services.calc.square");
            assert!(m.promise);
        }
        other => panic!("expected method envelope, got {other:?}"),
    }

    let callback = CallbackRef { target: "b", index: 3, pair: Some(4) }.to_packed();
    assert!(matches!(
        Envelope::parse(&callback).unwrap(),
        Some(Envelope::Callback(CallbackRef { index: 3, pair: Some(4), .. }))
    ));

    let unknown = Packed::map([("_rtype", Packed::str("mystery"))]);
    assert_eq!(Envelope::parse(&unknown).unwrap(), Some(Envelope::Other("mystery")));
    assert_eq!(Envelope::parse(&Packed::map([("a", Packed::Int(1))])).unwrap(), None);
}

#[test]
fn test_frame_is_two_segments() {
    let mut header = Header::method("a", "b", "services.x.y");
    header.session = Some("s1".into());
    let frame = Frame::new(header.clone(), Packed::map([("args", Packed::List(vec![Packed::Int(1)]))]));

    let bytes = frame.encode().unwrap();
    assert_eq!(relaypack::unpack_all(&bytes).unwrap().len(), 2);

    let decoded = Frame::decode(&bytes).unwrap();
    assert_eq!(decoded.header, header);
    assert_eq!(decoded.args(), &[Packed::Int(1)]);
    assert!(decoded.promise().is_none());
}

// ============================================================================
//  STRUCTURAL ENCODING
// ============================================================================

#[tokio::test]
async fn test_binary_views_round_trip() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let value = Value::List(vec![
        Value::TypedArray(TypedArray::from_slice::<u16>(&[1, 2, 65535])),
        Value::NdArray(NdArray::from_slice::<f32>(vec![2, 2], &[1.0, 2.0, 3.0, 4.5])),
        Value::MemoryView(vec![0, 1, 2]),
        Value::Bytes(vec![9, 9]),
    ]);

    let packed = peer.encode(&value, "s", "b").unwrap();
    let typed = &packed.as_list().unwrap()[0];
    assert_eq!(typed.get("_rdtype").and_then(Packed::as_str), Some("uint16"));
    assert_eq!(typed.get("_rvalue").and_then(Packed::as_bytes), Some(&[1, 0, 2, 0, 255, 255][..]));

    let back = peer.decode(&packed, &DecodeContext::default()).unwrap();
    assert_eq!(back, value);
    let Value::List(items) = back else { panic!("expected list") };
    assert_eq!(items[0].as_typed_array().unwrap().to_vec::<u16>().unwrap(), vec![1, 2, 65535]);
}

#[tokio::test]
async fn test_collections_round_trip() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let value = Value::map([
        ("set", Value::Set(vec![Value::Int(1), Value::str("two")])),
        (
            "ordered",
            Value::OrderedMap(vec![
                (Value::Int(2), Value::str("b")),
                (Value::Int(1), Value::str("a")),
            ]),
        ),
        ("error", Value::Error("boom".into())),
        ("nested", Value::map([("z", Value::Null), ("a", Value::Float(0.5))])),
    ]);

    let packed = peer.encode(&value, "s", "b").unwrap();
    assert_eq!(
        packed.get("set").and_then(|s| s.get("_rtype")).and_then(Packed::as_str),
        Some("set")
    );
    assert_eq!(peer.decode(&packed, &DecodeContext::default()).unwrap(), value);
}

#[tokio::test]
async fn test_local_function_comes_back_as_itself() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let f = Callable::sync(|_| Ok(Value::Int(1))).with_name("one").with_doc("returns one");

    let packed = peer.encode(&Value::Function(f.clone()), "s1", "b").unwrap();
    assert_eq!(packed.get("_rtarget").and_then(Packed::as_str), Some("a"));
    assert_eq!(packed.get("_rmethod").and_then(Packed::as_str), Some("s1.0"));
    assert_eq!(packed.get("_rname").and_then(Packed::as_str), Some("one"));
    assert_eq!(peer.session_count(), 1);

    let back = peer.decode(&packed, &DecodeContext::default()).unwrap();
    assert_eq!(back.as_function().map(Callable::id), Some(f.id()));
}

#[tokio::test]
async fn test_remote_function_reencodes_its_origin() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let envelope = MethodRef::new("b", "s9.4", true).to_packed();

    let proxy = peer.decode(&envelope, &DecodeContext::default()).unwrap();
    assert!(proxy.as_function().unwrap().is_remote());
    assert_eq!(peer.encode(&proxy, "s1", "c").unwrap(), envelope);
    assert_eq!(peer.session_count(), 0);
}

#[derive(Debug, PartialEq)]
struct Point {
    x: i64,
    y: i64,
}

#[tokio::test]
async fn test_codec_round_trip() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let codec = Codec::new::<Point>("point")
        .encoder(|p: &Point| Ok(Value::map([("x", Value::Int(p.x)), ("y", Value::Int(p.y))])))
        .decoder(|v| {
            let x = v.get("x").and_then(Value::as_int).unwrap_or_default();
            let y = v.get("y").and_then(Value::as_int).unwrap_or_default();
            Ok(Value::Custom(CustomValue::new(Point { x, y })))
        });
    peer.register_codec(codec).unwrap();

    let value = Value::Custom(CustomValue::new(Point { x: 3, y: -4 }));
    let packed = peer.encode(&value, "s", "b").unwrap();
    assert_eq!(packed.get("_rtype").and_then(Packed::as_str), Some("point"));

    let back = peer.decode(&packed, &DecodeContext::default()).unwrap();
    let Value::Custom(custom) = back else { panic!("expected custom value") };
    assert_eq!(custom.downcast_ref::<Point>(), Some(&Point { x: 3, y: -4 }));
}

#[tokio::test]
async fn test_codec_cannot_claim_builtin_tag() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let result = peer.register_codec(Codec::new::<Point>("ndarray"));
    assert!(matches!(result, Err(RpcError::Codec(_))));
}

#[tokio::test]
async fn test_custom_value_without_codec_is_unsupported() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let value = Value::List(vec![Value::Custom(CustomValue::new(Point { x: 0, y: 0 }))]);
    assert!(matches!(peer.encode(&value, "s", "b"), Err(RpcError::UnsupportedType(_))));
}

#[tokio::test]
async fn test_unknown_tag_decodes_as_map() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let packed = Packed::map([("_rtype", Packed::str("mystery")), ("n", Packed::Int(5))]);
    let value = peer.decode(&packed, &DecodeContext::default()).unwrap();
    assert_eq!(value.get("_rtype"), Some(&Value::str("mystery")));
    assert_eq!(value.get("n"), Some(&Value::Int(5)));
}

#[test]
fn test_kwargs_marker() {
    let k = kwargs([("loud", Value::Bool(true))]);
    assert!(k.is_kwargs());
    assert!(!Value::map([("loud", Value::Bool(true))]).is_kwargs());
    assert_eq!(DType::parse("complex128"), DType::Array);
}

// ============================================================================
//  SERVICES
// ============================================================================

#[tokio::test]
async fn test_duplicate_service_id() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    peer.on("service-updated", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let api = || {
        crate::ServiceApi::Mapping(Value::map([
            ("id", Value::str("calc")),
            ("one", Value::Function(noop())),
        ]))
    };
    peer.register_service(api(), false).unwrap();
    assert!(matches!(peer.register_service(api(), false), Err(RpcError::ServiceExists(_))));
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    peer.register_service(api(), true).unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 2);

    let ids: Vec<_> = peer
        .list_services()
        .iter()
        .filter_map(|d| d.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    assert_eq!(ids, vec!["a:built-in", "a:calc"]);
}

#[tokio::test]
async fn test_service_config_from_mapping() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    let descriptor = peer
        .register_service(
            crate::ServiceApi::Mapping(Value::map([
                ("id", Value::str("svc")),
                ("name", Value::str("My Service")),
                ("config", ServiceConfig::public().to_value()),
            ])),
            false,
        )
        .unwrap();
    assert_eq!(descriptor.get("name"), Some(&Value::str("My Service")));
    let config = ServiceConfig::from_value(descriptor.get("config").unwrap()).unwrap();
    assert_eq!(config.visibility, Visibility::Public);
}

#[tokio::test]
async fn test_unregister_unknown_service() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    assert!(matches!(peer.unregister_service("ghost", false), Err(RpcError::NotFound(_))));
}

struct Counter {
    hits: AtomicUsize,
}

impl crate::ServiceObject for Counter {
    fn id(&self) -> String {
        "counter".into()
    }

    fn members(self: Arc<Self>) -> Vec<(String, Value)> {
        let next = Callable::sync(move |_| Ok(Value::Int(self.hits.fetch_add(1, Ordering::SeqCst) as i64 + 1)));
        vec![("next".into(), Value::Function(next))]
    }
}

#[tokio::test]
async fn test_object_service_resolves_locally() {
    let (peer, _far) = raw_peer(PeerConfig::new("a"));
    peer.register_service(crate::ServiceApi::Object(Arc::new(Counter { hits: AtomicUsize::new(0) })), false)
        .unwrap();

    let svc = peer.get_remote_service("a:counter").await.unwrap();
    assert_eq!(svc.id(), "a:counter");
    assert_eq!(svc.call("next", vec![]).await.unwrap(), Value::Int(1));
    assert_eq!(svc.call("next", vec![]).await.unwrap(), Value::Int(2));
    assert_eq!(peer.session_count(), 0);
}

// ============================================================================
//  CALL LIFECYCLE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_rejects_and_removes_session() {
    init_tracing();
    let (peer, _far) = raw_peer(PeerConfig::new("a"));

    let result = peer
        .call_with_timeout("b", "services.slow.run", vec![Value::Int(1)], Duration::from_secs(2))
        .await;

    match result {
        Err(RpcError::Timeout { method }) => assert_eq!(method, "services.slow.run"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(peer.session_count(), 0);
    assert_eq!(peer.pending_refs(), 0);
}

#[tokio::test]
async fn test_encoding_failure_rejects_locally() {
    let (peer, far) = raw_peer(PeerConfig::new("a"));
    let bad = Value::Custom(CustomValue::new(Point { x: 1, y: 1 }));

    let result = peer.call("b", "services.any.thing", vec![bad]).await;
    assert!(matches!(result, Err(RpcError::UnsupportedType(_))));
    assert_eq!(peer.session_count(), 0);

    let nothing = tokio::time::timeout(Duration::from_millis(50), far.recv()).await;
    assert!(nothing.is_err(), "nothing should have been sent");
}

#[tokio::test]
async fn test_missing_parent_session_rejects() {
    init_tracing();
    let (_peer, far) = raw_peer(PeerConfig::new("b"));

    let mut header = Header::method("tester", "b", "services.built-in.ping");
    header.session = Some("s1".into());
    header.parent = Some("ghost".into());
    let promise = Packed::map([
        ("resolve", CallbackRef { target: "tester", index: 0, pair: Some(1) }.to_packed()),
        ("reject", CallbackRef { target: "tester", index: 1, pair: Some(0) }.to_packed()),
    ]);
    let extra = Packed::map([
        ("args", Packed::List(vec![Packed::str("hi")])),
        ("promise", promise),
    ]);
    far.send(&Frame::new(header, extra).encode().unwrap()).await.unwrap();

    let reply = Frame::decode(&far.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply.header.kind, "callback");
    assert_eq!(reply.header.index, Some(1));
    let message = reply.args()[0].as_str().unwrap();
    assert!(message.contains("parent session closed"), "{message}");
}

#[tokio::test]
async fn test_stale_callback_is_not_fatal() {
    init_tracing();
    let (_peer, far) = raw_peer(PeerConfig::new("b"));

    let stale = Frame::new(Header::callback("tester", "b", 42), Packed::map([("args", Packed::List(vec![]))]));
    far.send(&stale.encode().unwrap()).await.unwrap();

    let mut header = Header::method("tester", "b", "services.built-in.ping");
    header.session = Some("s1".into());
    let extra = Packed::map([
        ("args", Packed::List(vec![Packed::str("ping")])),
        (
            "promise",
            Packed::map([
                ("resolve", CallbackRef { target: "tester", index: 0, pair: Some(1) }.to_packed()),
                ("reject", CallbackRef { target: "tester", index: 1, pair: Some(0) }.to_packed()),
            ]),
        ),
    ]);
    far.send(&Frame::new(header, extra).encode().unwrap()).await.unwrap();

    let reply = Frame::decode(&far.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply.header.index, Some(0));
    assert_eq!(reply.args(), &[Packed::str("pong")]);
}

/// A method frame whose `args` nest `depth` lists deep.
fn deeply_nested_call(depth: usize) -> Vec<u8> {
    let header = Header::method("tester", "b", "services.built-in.ping");
    let mut bytes = relaypack::pack(&header.to_packed()).unwrap();

    let mut enc = Encoder::new();
    enc.map_begin().unwrap();
    enc.entry_begin("args").unwrap();
    for _ in 0..depth {
        enc.list_begin().unwrap();
    }
    enc.nil().unwrap();
    for _ in 0..depth {
        enc.list_end().unwrap();
    }
    enc.entry_end().unwrap();
    enc.map_end().unwrap();
    bytes.extend(enc.into_bytes().unwrap());
    bytes
}

#[tokio::test]
async fn test_deeply_nested_message_is_rejected() {
    init_tracing();
    let (_peer, far) = raw_peer(PeerConfig::new("b"));

    let bytes = deeply_nested_call(50_000);
    assert!(matches!(Frame::decode(&bytes), Err(RpcError::Protocol(_))));
    far.send(&bytes).await.unwrap();

    let mut header = Header::method("tester", "b", "services.built-in.ping");
    header.session = Some("s1".into());
    let extra = Packed::map([
        ("args", Packed::List(vec![])),
        (
            "promise",
            Packed::map([
                ("resolve", CallbackRef { target: "tester", index: 0, pair: Some(1) }.to_packed()),
                ("reject", CallbackRef { target: "tester", index: 1, pair: Some(0) }.to_packed()),
            ]),
        ),
    ]);
    far.send(&Frame::new(header, extra).encode().unwrap()).await.unwrap();

    let reply = Frame::decode(&far.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply.header.index, Some(0));
    assert_eq!(reply.args(), &[Packed::str("pong")]);
}

#[tokio::test]
async fn test_kwargs_flag_requires_trailing_map() {
    let (_peer, far) = raw_peer(PeerConfig::new("b"));

    let mut header = Header::method("tester", "b", "services.built-in.ping");
    header.session = Some("s1".into());
    let extra = Packed::map([
        ("args", Packed::List(vec![Packed::Int(1)])),
        ("with_kwargs", Packed::Bool(true)),
        (
            "promise",
            Packed::map([
                ("resolve", CallbackRef { target: "tester", index: 0, pair: Some(1) }.to_packed()),
                ("reject", CallbackRef { target: "tester", index: 1, pair: Some(0) }.to_packed()),
            ]),
        ),
    ]);
    let frame = Frame::new(header, extra);
    assert!(frame.with_kwargs());
    far.send(&frame.encode().unwrap()).await.unwrap();

    let reply = Frame::decode(&far.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(reply.header.index, Some(1));
    let message = reply.args()[0].as_str().unwrap();
    assert!(message.contains("keyword arguments must be a map"), "{message}");
}

#[tokio::test]
async fn test_unknown_message_type_becomes_event() {
    let (peer, far) = raw_peer(PeerConfig::new("b"));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = parking_lot::Mutex::new(Some(tx));
    peer.on("log", move |value| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(value.clone());
        }
    });

    let header = Header { kind: "log".into(), from: "tester".into(), to: "b".into(), ..Header::default() };
    let frame = Frame::new(header, Packed::map([("text", Packed::str("hello"))]));
    far.send(&frame.encode().unwrap()).await.unwrap();

    let event = rx.await.unwrap();
    assert_eq!(event.get("text"), Some(&Value::str("hello")));
    assert_eq!(event.get("from"), Some(&Value::str("tester")));
}
