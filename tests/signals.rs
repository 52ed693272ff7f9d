mod util;

use std::time::Duration;

use ntest::timeout;
use omnibusd::wire::{Message, Type, Value};
use util::{BusFixture, TestClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn signals_reach_exactly_the_matching_subscribers() {
    let bus = BusFixture::start().await.unwrap();
    let mut subscriber = TestClient::connect(&bus.path).await.unwrap();
    let mut emitter_b = TestClient::connect(&bus.path).await.unwrap();
    let mut emitter_c = TestClient::connect(&bus.path).await.unwrap();
    subscriber.hello().await.unwrap();
    let b_unique = emitter_b.hello().await.unwrap();
    emitter_c.hello().await.unwrap();

    subscriber
        .add_match("type='signal',interface='com.x',member='Y'")
        .await
        .unwrap();

    // C emits on a different interface first; it must never arrive.
    let serial = emitter_c.next_serial();
    emitter_c
        .send(Message::signal("/com/x", "com.other", "Y").with_serial(serial))
        .await
        .unwrap();

    let serial = emitter_b.next_serial();
    emitter_b
        .send(
            Message::signal("/com/x", "com.x", "Y")
                .with_serial(serial)
                .with_body(vec![Type::String], vec![Value::from("payload")]),
        )
        .await
        .unwrap();

    let signal = subscriber.recv_signal("Y").await.unwrap();
    assert_eq!(signal.interface.as_deref(), Some("com.x"));
    assert_eq!(signal.sender.as_deref(), Some(b_unique.as_str()));
    assert_eq!(signal.body, vec![Value::from("payload")]);

    // Nothing else is queued for the subscriber.
    let extra = tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await;
    assert!(extra.is_err(), "subscriber received an unmatched signal");

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn rule_less_peers_get_nothing_by_default() {
    let bus = BusFixture::start().await.unwrap();
    let mut bystander = TestClient::connect(&bus.path).await.unwrap();
    let mut emitter = TestClient::connect(&bus.path).await.unwrap();
    bystander.hello().await.unwrap();
    emitter.hello().await.unwrap();

    let serial = emitter.next_serial();
    emitter
        .send(Message::signal("/com/x", "com.x", "Y").with_serial(serial))
        .await
        .unwrap();

    let extra = tokio::time::timeout(Duration::from_millis(200), bystander.recv()).await;
    assert!(extra.is_err(), "strict mode delivered to a rule-less peer");

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn compat_broadcast_delivers_to_rule_less_peers() {
    let bus = BusFixture::start_with(true).await.unwrap();
    let mut bystander = TestClient::connect(&bus.path).await.unwrap();
    let mut emitter = TestClient::connect(&bus.path).await.unwrap();
    bystander.hello().await.unwrap();
    emitter.hello().await.unwrap();

    let serial = emitter.next_serial();
    emitter
        .send(Message::signal("/com/x", "com.x", "Y").with_serial(serial))
        .await
        .unwrap();

    let signal = bystander.recv_signal("Y").await.unwrap();
    assert_eq!(signal.interface.as_deref(), Some("com.x"));

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn match_rules_can_be_removed() {
    let bus = BusFixture::start().await.unwrap();
    let mut subscriber = TestClient::connect(&bus.path).await.unwrap();
    let mut emitter = TestClient::connect(&bus.path).await.unwrap();
    subscriber.hello().await.unwrap();
    emitter.hello().await.unwrap();

    let rule = "type='signal',interface='com.x'";
    subscriber.add_match(rule).await.unwrap();

    let reply = subscriber
        .call_bus("RemoveMatch", vec![Type::String], vec![Value::from(rule)])
        .await
        .unwrap();
    assert!(reply.error_name.is_none());

    // Removing it again fails.
    let reply = subscriber
        .call_bus("RemoveMatch", vec![Type::String], vec![Value::from(rule)])
        .await
        .unwrap();
    assert_eq!(
        reply.error_name.as_deref(),
        Some(omnibusd::fdo::ERR_MATCH_RULE_NOT_FOUND)
    );

    // And a bad rule never parses.
    let reply = subscriber
        .call_bus(
            "AddMatch",
            vec![Type::String],
            vec![Value::from("flavor='salty'")],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.error_name.as_deref(),
        Some(omnibusd::fdo::ERR_MATCH_RULE_INVALID)
    );

    let serial = emitter.next_serial();
    emitter
        .send(Message::signal("/com/x", "com.x", "Y").with_serial(serial))
        .await
        .unwrap();
    let extra = tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await;
    assert!(extra.is_err(), "signal arrived after RemoveMatch");

    bus.stop().await.unwrap();
}
