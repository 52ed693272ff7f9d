mod util;

use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use ntest::timeout;
use omnibusd::wire::{Message, Type, Value};
use util::{BusFixture, TestClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn descriptors_ride_along_and_never_leak_into_later_messages() {
    let bus = BusFixture::start().await.unwrap();
    let mut sender = TestClient::connect_with_fd_passing(&bus.path).await.unwrap();
    let mut receiver = TestClient::connect_with_fd_passing(&bus.path).await.unwrap();
    sender.hello().await.unwrap();
    let receiver_unique = receiver.hello().await.unwrap();

    let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

    // One descriptor, referenced from the body by index 0.
    let serial = sender.next_serial();
    let call = Message::method_call(
        Some(receiver_unique.as_str()),
        "/com/example/Fd",
        Some("com.example.Fd"),
        "Take",
    )
    .with_serial(serial)
    .with_body(vec![Type::UnixFd], vec![Value::UnixFd(0)])
    .with_fds(vec![Arc::new(pipe_write)]);
    sender.send(call).await.unwrap();

    let incoming = receiver.recv().await.unwrap();
    assert_eq!(incoming.unix_fds, 1);
    assert_eq!(incoming.fds.len(), 1);
    assert_eq!(incoming.body, vec![Value::UnixFd(0)]);

    // Prove the received descriptor is the write end of our pipe.
    let dup = incoming.fds[0].try_clone().unwrap();
    let mut writer = File::from(dup);
    writer.write_all(b"ping").unwrap();
    drop(writer);
    drop(incoming);

    let mut reader = File::from(pipe_read);
    let mut payload = [0u8; 4];
    reader.read_exact(&mut payload).unwrap();
    assert_eq!(&payload, b"ping");

    // A second, descriptor-free message must not pick up stale fds.
    let serial = sender.next_serial();
    let call = Message::method_call(
        Some(receiver_unique.as_str()),
        "/com/example/Fd",
        Some("com.example.Fd"),
        "Nothing",
    )
    .with_serial(serial);
    sender.send(call).await.unwrap();

    let incoming = receiver.recv().await.unwrap();
    assert_eq!(incoming.member.as_deref(), Some("Nothing"));
    assert_eq!(incoming.unix_fds, 0);
    assert!(incoming.fds.is_empty());

    bus.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn descriptors_are_dropped_without_negotiation() {
    let bus = BusFixture::start().await.unwrap();
    let mut sender = TestClient::connect_with_fd_passing(&bus.path).await.unwrap();
    // The receiver never negotiated fd passing.
    let mut receiver = TestClient::connect(&bus.path).await.unwrap();
    sender.hello().await.unwrap();
    let receiver_unique = receiver.hello().await.unwrap();

    let (_pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
    let serial = sender.next_serial();
    let call = Message::method_call(
        Some(receiver_unique.as_str()),
        "/com/example/Fd",
        Some("com.example.Fd"),
        "Take",
    )
    .with_serial(serial)
    .with_body(vec![Type::UnixFd], vec![Value::UnixFd(0)])
    .with_fds(vec![Arc::new(pipe_write)]);
    sender.send(call).await.unwrap();

    // The declared count stays on the wire, the descriptors do not.
    let incoming = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incoming.unix_fds, 1);
    assert!(incoming.fds.is_empty());

    bus.stop().await.unwrap();
}
