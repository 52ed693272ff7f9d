mod util;

use std::time::Duration;

use ntest::timeout;
use omnibusd::fdo;
use omnibusd::wire::{MessageType, Type, Value};
use util::{BusFixture, TestClient};

const NAME: &str = "com.example.Svc";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn request_name_primary_owner() {
    let bus = BusFixture::start().await.unwrap();
    let mut client = TestClient::connect(&bus.path).await.unwrap();
    let unique = client.hello().await.unwrap();

    assert_eq!(client.request_name(NAME, 0).await.unwrap(), 1);

    let reply = client
        .call_bus("GetNameOwner", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.body[0].as_str().unwrap(), unique);

    let reply = client
        .call_bus("NameHasOwner", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.body[0], Value::Bool(true));

    // Requesting a name twice just confirms ownership.
    assert_eq!(client.request_name(NAME, 0).await.unwrap(), 4);

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn queued_ownership_transfers_with_a_single_signal() {
    let bus = BusFixture::start().await.unwrap();
    let mut a = TestClient::connect(&bus.path).await.unwrap();
    let mut b = TestClient::connect(&bus.path).await.unwrap();
    let a_unique = a.hello().await.unwrap();
    let b_unique = b.hello().await.unwrap();

    assert_eq!(a.request_name(NAME, 0).await.unwrap(), 1);
    assert_eq!(b.request_name(NAME, 0).await.unwrap(), 2);

    // The queue is visible through ListQueuedOwners.
    let reply = a
        .call_bus(
            "ListQueuedOwners",
            vec![Type::String],
            vec![Value::from(NAME)],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.body[0],
        Value::Array(Type::String, vec![Value::from(b_unique.as_str())])
    );

    // An observer subscribed only from now on sees exactly the transfer.
    let mut observer = TestClient::connect(&bus.path).await.unwrap();
    observer.hello().await.unwrap();
    observer
        .add_match("type='signal',member='NameOwnerChanged'")
        .await
        .unwrap();

    assert_eq!(a.release_name(NAME).await.unwrap(), 1);

    let signal = observer.recv_signal("NameOwnerChanged").await.unwrap();
    assert_eq!(signal.sender.as_deref(), Some(fdo::BUS_NAME));
    assert_eq!(
        signal.body,
        vec![
            Value::from(NAME),
            Value::from(a_unique.as_str()),
            Value::from(b_unique.as_str()),
        ]
    );

    // No intermediate "released" transition is ever emitted.
    let extra = tokio::time::timeout(
        Duration::from_millis(200),
        observer.recv_signal("NameOwnerChanged"),
    )
    .await;
    assert!(extra.is_err(), "unexpected second NameOwnerChanged");

    // B was told directly that it now owns the name.
    let acquired = b.recv_signal("NameAcquired").await.unwrap();
    assert_eq!(acquired.body, vec![Value::from(NAME)]);
    assert_eq!(acquired.destination.as_deref(), Some(b_unique.as_str()));

    // And A that it lost it.
    let lost = a.recv_signal("NameLost").await.unwrap();
    assert_eq!(lost.body, vec![Value::from(NAME)]);

    let reply = a
        .call_bus("GetNameOwner", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.body[0].as_str().unwrap(), b_unique);

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn release_name_reply_codes() {
    let bus = BusFixture::start().await.unwrap();
    let mut a = TestClient::connect(&bus.path).await.unwrap();
    let mut b = TestClient::connect(&bus.path).await.unwrap();
    a.hello().await.unwrap();
    b.hello().await.unwrap();

    // Releasing a name nobody owns.
    assert_eq!(a.release_name(NAME).await.unwrap(), 2);

    a.request_name(NAME, 0).await.unwrap();
    // B neither owns nor waits.
    assert_eq!(b.release_name(NAME).await.unwrap(), 3);
    assert_eq!(a.release_name(NAME).await.unwrap(), 1);

    // The entry is gone afterwards.
    let reply = a
        .call_bus("GetNameOwner", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERR_NAME_HAS_NO_OWNER)
    );

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn disconnect_promotes_the_queue_head() {
    let bus = BusFixture::start().await.unwrap();
    let mut a = TestClient::connect(&bus.path).await.unwrap();
    let mut b = TestClient::connect(&bus.path).await.unwrap();
    let a_unique = a.hello().await.unwrap();
    let b_unique = b.hello().await.unwrap();

    a.request_name(NAME, 0).await.unwrap();
    assert_eq!(b.request_name(NAME, 0).await.unwrap(), 2);

    drop(a);

    // B is promoted once the bus notices the disconnect.
    let acquired = b.recv_signal("NameAcquired").await.unwrap();
    assert_eq!(acquired.body, vec![Value::from(NAME)]);

    let reply = b
        .call_bus("GetNameOwner", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.body[0].as_str().unwrap(), b_unique);

    // A's unique name is gone from ListNames.
    let reply = b.call_bus("ListNames", vec![], vec![]).await.unwrap();
    let Value::Array(_, names) = &reply.body[0] else {
        panic!("ListNames returns an array");
    };
    assert!(!names.iter().any(|n| n.as_str() == Some(a_unique.as_str())));

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn invalid_names_are_rejected() {
    let bus = BusFixture::start().await.unwrap();
    let mut client = TestClient::connect(&bus.path).await.unwrap();
    client.hello().await.unwrap();

    for bad in [":1.5", "nodots", "double..dot", "7com.example"] {
        let reply = client
            .call_bus(
                "RequestName",
                vec![Type::String, Type::Uint32],
                vec![Value::from(bad), Value::Uint32(0)],
            )
            .await
            .unwrap();
        assert_eq!(
            reply.error_name.as_deref(),
            Some(fdo::ERR_INVALID_ARGS),
            "name `{bad}` should be rejected"
        );
    }

    // Wrong argument types are rejected, too.
    let reply = client
        .call_bus("RequestName", vec![Type::String], vec![Value::from(NAME)])
        .await
        .unwrap();
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERR_INVALID_ARGS));

    bus.stop().await.unwrap();
}
