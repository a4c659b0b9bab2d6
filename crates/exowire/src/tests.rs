//! Tests for channels, the codec and the relay table.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::channel::Channel;
use crate::channel::SendError;
use crate::channel::TrySendError;
use crate::codec;
use crate::error::Error;
use crate::fault::ErrorKind;
use crate::fault::RemoteError;
use crate::fault::TYPE_KEY;
use crate::ids::ChannelId;
use crate::ids::ChannelIds;
use crate::ids::TASK_ID_CEILING;
use crate::ids::TaskId;
use crate::ids::TaskIds;
use crate::message::CallResponse;
use crate::message::ChannelMessage;
use crate::message::Message;
use crate::message::ResponseBody;
use crate::relay;
use crate::relay::InboundRelays;
use crate::value::ChannelRef;
use crate::value::Direction;
use crate::value::Value;
use crate::value::WireValue;

// ============================================================================
//  CHANNEL
// ============================================================================

#[tokio::test]
async fn test_recv_drains_buffered_values_before_close_error() {
    let ch: Channel<i32> = Channel::unbounded();
    ch.send(1).await.unwrap();
    ch.send(2).await.unwrap();
    ch.close(Some(RemoteError::new("boom")));

    assert_eq!(ch.recv().await, Ok(Some(1)));
    assert_eq!(ch.recv().await, Ok(Some(2)));
    assert_eq!(ch.recv().await, Err(RemoteError::new("boom")));
    // The terminal state is sticky.
    assert_eq!(ch.recv().await, Err(RemoteError::new("boom")));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let ch: Channel<i32> = Channel::unbounded();
    ch.close(None);
    ch.close(Some(RemoteError::new("late")));

    assert!(ch.is_closed());
    assert_eq!(ch.recv().await, Ok(None));
}

#[tokio::test]
async fn test_send_after_close_hands_value_back() {
    let ch: Channel<&str> = Channel::unbounded();
    ch.close(None);

    assert_eq!(ch.send("lost").await, Err(SendError("lost")));
    assert_eq!(ch.try_send("lost"), Err(TrySendError::Closed("lost")));
}

#[tokio::test]
async fn test_bounded_send_waits_for_capacity() {
    let ch: Channel<i32> = Channel::bounded(1);
    ch.send(1).await.unwrap();
    assert_eq!(ch.try_send(2), Err(TrySendError::Full(2)));

    let writer = {
        let ch = ch.clone();
        tokio::spawn(async move { ch.send(2).await })
    };

    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(!writer.is_finished(), "send must wait while the channel is full");

    assert_eq!(ch.recv().await, Ok(Some(1)));
    writer.await.unwrap().unwrap();
    assert_eq!(ch.recv().await, Ok(Some(2)));
}

#[tokio::test]
async fn test_pending_recv_observes_close() {
    let ch: Channel<i32> = Channel::unbounded();
    let reader = {
        let ch = ch.clone();
        tokio::spawn(async move { ch.recv().await })
    };

    tokio::task::yield_now().await;
    ch.close(None);

    assert_eq!(reader.await.unwrap(), Ok(None));
}

#[tokio::test]
async fn test_bounded_capacity_is_at_least_one() {
    let ch: Channel<i32> = Channel::bounded(0);
    assert_eq!(ch.capacity(), Some(1));
    assert_eq!(Channel::<i32>::unbounded().capacity(), None);
}

// ============================================================================
//  CODEC
// ============================================================================

#[test]
fn test_transfer_list_covers_top_level_map_entries_and_list_elements() {
    let a = Bytes::from_static(b"a");
    let b = Bytes::from_static(b"b");
    let c = Bytes::from_static(b"c");
    let d = Bytes::from_static(b"d");
    let e = Bytes::from_static(b"e");

    let mut inner = BTreeMap::new();
    inner.insert("z".to_string(), WireValue::Buffer(c));
    let mut outer = BTreeMap::new();
    outer.insert("x".to_string(), WireValue::Buffer(b.clone()));
    outer.insert("y".to_string(), WireValue::Map(inner));

    let values = vec![
        WireValue::Buffer(a.clone()),
        WireValue::Map(outer),
        WireValue::List(vec![
            WireValue::Buffer(d.clone()),
            WireValue::List(vec![WireValue::Buffer(e)]),
        ]),
        WireValue::Int(4),
    ];

    assert_eq!(codec::collect_transfers(&values), vec![a, b, d]);
}

#[test]
fn test_error_envelope_keeps_name_code_and_message() {
    let original = RemoteError::new("disk on fire").with_name("IoError").with_code("EFIRE");

    let wire = codec::encode_value(Value::Error(original.clone())).unwrap();
    let WireValue::Map(map) = &wire else { panic!("expected an envelope, got {:?}", wire) };
    assert_eq!(map.get(TYPE_KEY), Some(&WireValue::Str("Error".into())));

    match codec::decode_plain(wire).unwrap() {
        Value::Error(decoded) => {
            assert_eq!(decoded, original);
            assert_eq!(decoded.to_string(), "IoError [EFIRE]: disk on fire");
        }
        other => panic!("expected an error, got {:?}", other),
    }
}

#[test]
fn test_aggregate_and_dom_errors_keep_their_category() {
    let original = RemoteError::aggregate(
        vec![RemoteError::new("first"), RemoteError::abort("second")],
        "two failures",
    );

    let decoded = RemoteError::from_envelope(&original.to_envelope()).unwrap();

    assert_eq!(decoded.kind, ErrorKind::Aggregate);
    assert_eq!(decoded.errors.len(), 2);
    assert_eq!(decoded.errors[1].kind, ErrorKind::Dom);
    assert_eq!(decoded.errors[1].name, "AbortError");
    assert_eq!(decoded, original);
}

#[test]
fn test_unknown_type_tag_stays_a_plain_map() {
    let mut map = BTreeMap::new();
    map.insert(TYPE_KEY.to_string(), WireValue::Str("Weird".into()));
    map.insert("message".to_string(), WireValue::Str("not an error".into()));

    let decoded = codec::decode_plain(WireValue::Map(map)).unwrap();

    assert_eq!(decoded.get(TYPE_KEY), Some(&Value::Str("Weird".into())));
    assert_eq!(decoded.get("message").and_then(Value::as_str), Some("not an error"));
}

#[test]
fn test_not_cloneable_errors_gain_a_frame_naming_the_callable() {
    let wire = RemoteError::data_clone("#<Socket> could not be cloned").to_envelope();

    let annotated = codec::error_from_wire(&wire, Some(("net", "connect")));
    assert_eq!(annotated.name, "DataCloneError");
    assert!(annotated.stack.as_deref().unwrap().ends_with("    at connect (net)"));

    let plain = codec::error_from_wire(&wire, None);
    assert_eq!(plain.stack, None);

    let other = codec::error_from_wire(
        &RemoteError::new("nope").to_envelope(),
        Some(("net", "connect")),
    );
    assert_eq!(other.stack, None);
}

#[test]
fn test_non_envelope_error_payload_becomes_generic_error() {
    let error = codec::error_from_wire(&WireValue::Str("bad input".into()), None);
    assert_eq!(error.kind, ErrorKind::Exception);
    assert_eq!(error.name, "Error");
    assert_eq!(error.message, "bad input");
}

#[test]
fn test_encode_value_refuses_channels() {
    let value = Value::List(vec![Value::output(Channel::unbounded())]);
    match codec::encode_value(value) {
        Err(Error::NotCloneable(_)) => {}
        other => panic!("expected NotCloneable, got {:?}", other),
    }
}

#[test]
fn test_encode_args_replaces_channels_with_refs() {
    let ids = ChannelIds::new();
    let input = Channel::unbounded();
    let output = Channel::unbounded();

    let encoded = codec::encode_args(
        vec![Value::Int(1), Value::input(input.clone()), Value::output(output.clone())],
        &ids,
    )
    .unwrap();

    assert_eq!(encoded.values[0], WireValue::Int(1));
    assert_eq!(
        encoded.values[1],
        WireValue::Channel(ChannelRef { id: ChannelId(1), direction: Direction::Input })
    );
    assert_eq!(
        encoded.values[2],
        WireValue::Channel(ChannelRef { id: ChannelId(2), direction: Direction::Output })
    );
    assert_eq!(encoded.channels.len(), 2);
    assert_eq!(encoded.channels[0].1, input);
    assert_eq!(encoded.channels[1].1, output);
}

#[test]
fn test_recursion_limit() {
    let mut value = Value::Null;
    for _ in 0..100 {
        value = Value::List(vec![value]);
    }
    assert_eq!(codec::encode_value(value), Err(Error::RecursionLimitExceeded));
}

#[test]
fn test_not_cloneable_converts_to_data_clone_error() {
    let remote = Error::NotCloneable("channel".into()).to_remote();
    assert_eq!(remote.kind, ErrorKind::Dom);
    assert!(remote.is_not_cloneable());
}

// ============================================================================
//  IDS AND MESSAGES
// ============================================================================

#[test]
fn test_task_ids_wrap_at_ceiling() {
    let ids = TaskIds::starting_at(TASK_ID_CEILING);
    assert_eq!(ids.allocate(|_| false), TaskId(TASK_ID_CEILING));
    assert_eq!(ids.allocate(|_| false), TaskId(1));
}

#[test]
fn test_task_ids_skip_ids_in_use() {
    let ids = TaskIds::new();
    assert_eq!(ids.allocate(|id| id.0 < 3), TaskId(3));
    assert_eq!(ids.allocate(|_| false), TaskId(4));
}

#[test]
fn test_terminal_responses() {
    let id = TaskId(9);
    assert!(CallResponse::new(id, ResponseBody::Return(WireValue::Null)).is_terminal());
    assert!(CallResponse::new(id, ResponseBody::Error(WireValue::Null)).is_terminal());
    let last = ResponseBody::Yield { value: WireValue::Null, done: true };
    assert!(CallResponse::new(id, last).is_terminal());
    let more = ResponseBody::Yield { value: WireValue::Null, done: false };
    assert!(!CallResponse::new(id, more).is_terminal());
    assert!(!CallResponse::new(id, ResponseBody::Gen).is_terminal());

    let gen_message = Message::Response(CallResponse::new(id, ResponseBody::Gen));
    assert_eq!(gen_message.kind(), "gen");
    assert_eq!(gen_message.task_id(), Some(id));
}

// ============================================================================
//  RELAY
// ============================================================================

async fn pipe(id: ChannelId, source: Channel<Value>, relays: &InboundRelays) {
    relay::forward(id, source, |message, _transfer| match message {
        Message::Channel(op) => relays.deliver(op).is_ok(),
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_relay_preserves_order_and_close() {
    let relays = InboundRelays::new();
    let target = Channel::unbounded();
    relays.install(ChannelId(7), target.clone());

    let source = Channel::unbounded();
    for i in 0..5 {
        source.send(Value::Int(i)).await.unwrap();
    }
    source.close(None);

    pipe(ChannelId(7), source, &relays).await;

    for i in 0..5 {
        assert_eq!(target.recv().await, Ok(Some(Value::Int(i))));
    }
    assert_eq!(target.recv().await, Ok(None));
    assert!(relays.is_empty());
}

#[tokio::test]
async fn test_relay_carries_close_error() {
    let relays = InboundRelays::new();
    let target = Channel::unbounded();
    relays.install(ChannelId(1), target.clone());

    let source = Channel::unbounded();
    source.send(Value::from("last")).await.unwrap();
    source.close(Some(RemoteError::new("producer failed").with_code("E_PROD")));

    pipe(ChannelId(1), source, &relays).await;

    assert_eq!(target.recv().await, Ok(Some(Value::from("last"))));
    let error = target.recv().await.unwrap_err();
    assert_eq!(error.message, "producer failed");
    assert_eq!(error.code.as_deref(), Some("E_PROD"));
}

#[tokio::test]
async fn test_relay_closes_both_ends_on_uncloneable_value() {
    let relays = InboundRelays::new();
    let target = Channel::unbounded();
    relays.install(ChannelId(3), target.clone());

    let source = Channel::unbounded();
    source.send(Value::input(Channel::unbounded())).await.unwrap();

    pipe(ChannelId(3), source.clone(), &relays).await;

    assert!(source.is_closed());
    assert_eq!(target.recv().await.unwrap_err().name, "DataCloneError");
}

#[test]
fn test_deliver_to_unknown_channel() {
    let relays = InboundRelays::new();
    let op = ChannelMessage::Send { channel_id: ChannelId(42), value: WireValue::Null };
    assert_eq!(relays.deliver(op), Err(Error::UnknownChannel(ChannelId(42))));
}
