#![allow(dead_code)]

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use omnibusd::bus::Bus;
use omnibusd::events::BusEvent;
use omnibusd::fdo;
use omnibusd::peer::stream::Stream;
use omnibusd::wire::{message, Endian, Message, MessageType, Type, Value};

/// A bus running on a random socket in the temp directory.
pub struct BusFixture {
    pub path: PathBuf,
    pub events: broadcast::Receiver<BusEvent>,
    stop: mpsc::Sender<()>,
    handle: JoinHandle<Bus>,
}

impl BusFixture {
    pub async fn start() -> Result<Self> {
        Self::start_with(false).await
    }

    pub async fn start_with(compat_broadcast: bool) -> Result<Self> {
        let dir = std::env::temp_dir().join("omnibusd-test");
        if let Err(e) = tokio::fs::create_dir(&dir).await {
            // It's fine if it already exists.
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e).context("creating test dir");
            }
        }
        let name: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(10)
            .collect();
        let path = dir.join(name);

        let mut bus = Bus::for_address(
            Some(&format!("unix:path={}", path.display())),
            compat_broadcast,
        )
        .await?;
        let events = bus.events();
        let (stop, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = rx.recv() => {}
                _ = bus.run() => {
                    panic!("bus stopped unexpectedly");
                }
            }
            bus
        });

        Ok(Self {
            path,
            events,
            stop,
            handle,
        })
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(()).await;
        let bus = self.handle.await?;
        bus.cleanup().await
    }
}

/// A test client speaking the wire protocol over a Unix socket.
pub struct TestClient {
    stream: Stream,
    inbound: Vec<u8>,
    fds: Vec<OwnedFd>,
    serial: u32,
    pub unique_name: Option<String>,
}

enum Auth {
    Anonymous,
    External(u32),
}

impl TestClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        Self::connect_opts(path, Auth::Anonymous, false).await
    }

    pub async fn connect_with_fd_passing(path: &Path) -> Result<Self> {
        Self::connect_opts(path, Auth::Anonymous, true).await
    }

    pub async fn connect_as_uid(path: &Path, uid: u32) -> Result<Self> {
        Self::connect_opts(path, Auth::External(uid), false).await
    }

    async fn connect_opts(path: &Path, auth: Auth, negotiate_fds: bool) -> Result<Self> {
        let stream = Stream::Unix(Arc::new(UnixStream::connect(path).await?));
        let mut client = Self {
            stream,
            inbound: Vec::new(),
            fds: Vec::new(),
            serial: 0,
            unique_name: None,
        };
        let auth_line = match auth {
            Auth::Anonymous => "\0AUTH ANONYMOUS\r\n".to_string(),
            Auth::External(uid) => {
                let hex: String = uid
                    .to_string()
                    .bytes()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                format!("\0AUTH EXTERNAL {hex}\r\n")
            }
        };
        client.send_raw(auth_line.as_bytes()).await?;
        let line = client.read_line().await?;
        if !line.starts_with("OK ") {
            bail!("unexpected authentication reply: {line}");
        }
        if negotiate_fds {
            client.send_raw(b"NEGOTIATE_UNIX_FD\r\n").await?;
            let line = client.read_line().await?;
            if line != "AGREE_UNIX_FD" {
                bail!("fd passing not agreed: {line}");
            }
        }
        client.send_raw(b"BEGIN\r\n").await?;
        Ok(client)
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all_with_fds(bytes, &[])
            .await
            .map_err(Into::into)
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.inbound.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.inbound.drain(..pos + 2).collect();
                return Ok(String::from_utf8(line[..pos].to_vec())?);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        let (n, fds) = self.stream.read_with_fds(&mut buf).await?;
        if n == 0 {
            bail!("connection closed by the bus");
        }
        self.fds.extend(fds);
        self.inbound.extend_from_slice(&buf[..n]);
        Ok(())
    }

    pub fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    pub async fn send(&mut self, msg: Message) -> Result<()> {
        let raw_fds: Vec<RawFd> = msg.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let bytes = message::encode_message(&msg, Endian::Little)?;
        self.stream.write_all_with_fds(&bytes, &raw_fds).await?;
        Ok(())
    }

    /// Receives the next message, attaching any queued descriptors it
    /// declares.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some((mut msg, consumed)) = message::decode_message(&self.inbound)? {
                self.inbound.drain(..consumed);
                let declared = (msg.unix_fds as usize).min(self.fds.len());
                msg.fds = self.fds.drain(..declared).map(Arc::new).collect();
                return Ok(msg);
            }
            self.fill().await?;
        }
    }

    /// Receives until the reply to `serial` shows up, discarding everything
    /// else.
    pub async fn wait_reply(&mut self, serial: u32) -> Result<Message> {
        loop {
            let msg = self.recv().await?;
            if msg.reply_serial == Some(serial) {
                return Ok(msg);
            }
        }
    }

    /// Receives until a signal with the given member shows up.
    pub async fn recv_signal(&mut self, member: &str) -> Result<Message> {
        loop {
            let msg = self.recv().await?;
            if msg.kind == MessageType::Signal && msg.member.as_deref() == Some(member) {
                return Ok(msg);
            }
        }
    }

    pub async fn call(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        signature: Vec<Type>,
        body: Vec<Value>,
    ) -> Result<Message> {
        let serial = self.next_serial();
        let msg = Message::method_call(Some(destination), path, Some(interface), member)
            .with_serial(serial)
            .with_body(signature, body);
        self.send(msg).await?;
        self.wait_reply(serial).await
    }

    pub async fn call_bus(
        &mut self,
        member: &str,
        signature: Vec<Type>,
        body: Vec<Value>,
    ) -> Result<Message> {
        self.call(
            fdo::BUS_NAME,
            fdo::BUS_PATH,
            fdo::INTERFACE_DBUS,
            member,
            signature,
            body,
        )
        .await
    }

    pub async fn hello(&mut self) -> Result<String> {
        let reply = self.call_bus("Hello", vec![], vec![]).await?;
        if reply.kind != MessageType::MethodReturn {
            bail!("Hello failed: {:?}", reply.error_name);
        }
        let name = reply.body[0]
            .as_str()
            .context("Hello reply carries a string")?
            .to_string();
        self.unique_name = Some(name.clone());
        // The bus follows up with NameAcquired for the unique name; drain
        // it so tests only see the traffic they cause.
        let acquired = self.recv_signal("NameAcquired").await?;
        if acquired.body != vec![Value::from(name.as_str())] {
            bail!("unexpected NameAcquired payload: {:?}", acquired.body);
        }
        Ok(name)
    }

    /// Requests a name, draining the NameAcquired signal a grant produces.
    pub async fn request_name(&mut self, name: &str, flags: u32) -> Result<u32> {
        let reply = self
            .call_bus(
                "RequestName",
                vec![Type::String, Type::Uint32],
                vec![Value::from(name), Value::Uint32(flags)],
            )
            .await?;
        if reply.kind != MessageType::MethodReturn {
            bail!("RequestName failed: {:?}", reply.error_name);
        }
        let code = reply.body[0].as_u32().context("RequestName returns u32")?;
        if code == 1 {
            let acquired = self.recv_signal("NameAcquired").await?;
            if acquired.body != vec![Value::from(name)] {
                bail!("unexpected NameAcquired payload: {:?}", acquired.body);
            }
        }
        Ok(code)
    }

    pub async fn release_name(&mut self, name: &str) -> Result<u32> {
        let reply = self
            .call_bus("ReleaseName", vec![Type::String], vec![Value::from(name)])
            .await?;
        reply.body[0].as_u32().context("ReleaseName returns u32")
    }

    pub async fn add_match(&mut self, rule: &str) -> Result<Message> {
        self.call_bus("AddMatch", vec![Type::String], vec![Value::from(rule)])
            .await
    }
}
