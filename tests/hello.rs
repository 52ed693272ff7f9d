mod util;

use ntest::timeout;
use omnibusd::fdo;
use omnibusd::wire::{MessageType, Type, Value};
use util::{BusFixture, TestClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn hello_assigns_a_unique_name() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let bus = BusFixture::start().await.unwrap();
    let mut client = TestClient::connect(&bus.path).await.unwrap();

    let name = client.hello().await.unwrap();
    assert!(name.starts_with(":1."));
    assert!(name[3..].chars().all(|c| c.is_ascii_digit()));

    // Hello is a once-only affair.
    let reply = client.call_bus("Hello", vec![], vec![]).await.unwrap();
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERR_FAILED));

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn bus_surface_basics() {
    let bus = BusFixture::start().await.unwrap();
    let mut client = TestClient::connect(&bus.path).await.unwrap();
    let name = client.hello().await.unwrap();

    // GetId returns the 32 character bus id.
    let reply = client.call_bus("GetId", vec![], vec![]).await.unwrap();
    let id = reply.body[0].as_str().unwrap();
    assert_eq!(id.len(), 32);

    // ListNames includes the bus itself and our unique name.
    let reply = client.call_bus("ListNames", vec![], vec![]).await.unwrap();
    let Value::Array(_, names) = &reply.body[0] else {
        panic!("ListNames returns an array");
    };
    let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
    assert!(names.contains(&fdo::BUS_NAME));
    assert!(names.contains(&name.as_str()));

    // ListActivatableNames is empty: no activation support.
    let reply = client
        .call_bus("ListActivatableNames", vec![], vec![])
        .await
        .unwrap();
    assert_eq!(reply.body[0], Value::Array(Type::String, vec![]));

    // Ping and GetMachineId on the Peer interface.
    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PEER,
            "Ping",
            vec![],
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageType::MethodReturn);
    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PEER,
            "GetMachineId",
            vec![],
            vec![],
        )
        .await
        .unwrap();
    assert!(!reply.body[0].as_str().unwrap().is_empty());

    // Introspection mentions every interface we claim to implement.
    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_INTROSPECTABLE,
            "Introspect",
            vec![],
            vec![],
        )
        .await
        .unwrap();
    let xml = reply.body[0].as_str().unwrap();
    for needle in [
        "org.freedesktop.DBus",
        "RequestName",
        "NameOwnerChanged",
        "org.freedesktop.DBus.Properties",
    ] {
        assert!(xml.contains(needle), "introspection is missing {needle}");
    }

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn properties_and_unknown_members() {
    let bus = BusFixture::start().await.unwrap();
    let mut client = TestClient::connect(&bus.path).await.unwrap();
    client.hello().await.unwrap();

    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PROPERTIES,
            "Get",
            vec![Type::String, Type::String],
            vec![Value::from(fdo::INTERFACE_DBUS), Value::from("Features")],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.body[0],
        Value::Variant(Box::new(Value::Array(Type::String, vec![])))
    );

    // The Interfaces property names what the bus object implements.
    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PROPERTIES,
            "Get",
            vec![Type::String, Type::String],
            vec![Value::from(fdo::INTERFACE_DBUS), Value::from("Interfaces")],
        )
        .await
        .unwrap();
    let Value::Variant(inner) = &reply.body[0] else {
        panic!("Get returns a variant");
    };
    let Value::Array(_, listed) = &**inner else {
        panic!("Interfaces is a string array");
    };
    for interface in [fdo::INTERFACE_DBUS, fdo::INTERFACE_PEER, fdo::INTERFACE_PROPERTIES] {
        assert!(
            listed.iter().any(|v| v.as_str() == Some(interface)),
            "Interfaces is missing {interface}"
        );
    }

    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PROPERTIES,
            "Get",
            vec![Type::String, Type::String],
            vec![Value::from(fdo::INTERFACE_DBUS), Value::from("Bogus")],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERR_UNKNOWN_PROPERTY)
    );

    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_PROPERTIES,
            "GetAll",
            vec![Type::String],
            vec![Value::from(fdo::INTERFACE_DBUS)],
        )
        .await
        .unwrap();
    let Value::Array(_, entries) = &reply.body[0] else {
        panic!("GetAll returns a dict");
    };
    assert_eq!(entries.len(), 2);

    let reply = client.call_bus("Dune", vec![], vec![]).await.unwrap();
    assert_eq!(reply.error_name.as_deref(), Some(fdo::ERR_UNKNOWN_METHOD));

    let reply = client
        .call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            "com.example.NoSuch",
            "Anything",
            vec![],
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.error_name.as_deref(),
        Some(fdo::ERR_UNKNOWN_INTERFACE)
    );

    bus.stop().await.unwrap();
}
