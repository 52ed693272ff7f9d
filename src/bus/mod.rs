use anyhow::{anyhow, bail, Context, Result};
#[cfg(unix)]
use std::{
    env,
    path::{Path, PathBuf},
};
use std::{fmt, sync::Arc};
use tokio::{fs::remove_file, sync::broadcast};
use tracing::{debug, info, warn};

use crate::events::BusEvent;
use crate::peer::stream::Stream;
use crate::peer::Peer;
use crate::router::{Forwarder, Router};

/// The bus identity embedded in the handshake `OK` line and returned by
/// `GetId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guid(String);

impl Guid {
    /// 32 hex characters, freshly random per bus instance.
    pub fn generate() -> Self {
        let mut s = String::with_capacity(32);
        for _ in 0..32 {
            s.push(char::from_digit(fastrand::u32(0..16), 16).unwrap());
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Guid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The bus.
#[derive(Debug)]
pub struct Bus {
    router: Arc<Router>,
    listener: Listener,
    guid: Arc<Guid>,
    address: String,
}

#[derive(Debug)]
enum Listener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        socket_path: Option<PathBuf>,
    },
    Tcp {
        listener: tokio::net::TcpListener,
    },
}

impl Bus {
    pub async fn for_address(address: Option<&str>, compat_broadcast: bool) -> Result<Self> {
        let address = match address {
            Some(address) => address.to_string(),
            None => default_address(),
        };
        let listener = match address.split_once(':') {
            #[cfg(unix)]
            Some(("unix", opts)) => match opts.split_once('=') {
                Some(("path", path)) => Self::unix_stream(Path::new(path)).await?,
                #[cfg(target_os = "linux")]
                Some(("abstract", name)) => Self::abstract_stream(name)?,
                _ => bail!("unsupported `unix` address `{address}`"),
            },
            #[cfg(not(unix))]
            Some(("unix", _)) => bail!("`unix` transport on non-UNIX OS is not supported."),
            Some(("tcp", opts)) => Self::tcp_stream(opts).await?,
            _ => bail!("unsupported address `{address}`"),
        };

        let guid = Arc::new(Guid::generate());
        let machine_id = read_machine_id().await.unwrap_or_else(|| guid.to_string());
        let router = Router::new(guid.clone(), machine_id, compat_broadcast);
        info!("bus {guid} listening on {address}");

        Ok(Self {
            router,
            listener,
            guid,
            address,
        })
    }

    /// Accept loop. Each connection authenticates on its own task so a
    /// stalled handshake never blocks the bus.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.accept().await {
                Ok(stream) => {
                    let router = self.router.clone();
                    let guid = self.guid.clone();
                    tokio::spawn(async move {
                        match Peer::authenticate(stream, &guid).await {
                            Ok(peer) => {
                                router.add_peer(peer).await;
                            }
                            Err(e) => warn!("failed to establish connection: {e}"),
                        }
                    });
                }
                Err(e) => warn!("failed to accept connection: {e}"),
            }
        }
    }

    // AsyncDrop would have been nice!
    pub async fn cleanup(self) -> Result<()> {
        match self.listener {
            #[cfg(unix)]
            Listener::Unix {
                socket_path: Some(socket_path),
                ..
            } => remove_file(socket_path).await.map_err(Into::into),
            _ => Ok(()),
        }
    }

    #[cfg(unix)]
    async fn unix_stream(socket_path: &Path) -> Result<Listener> {
        // A stale socket from a previous run would fail the bind.
        match remove_file(socket_path).await {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!("unlinking {}", socket_path.display()))
            }
        }
        let listener = tokio::net::UnixListener::bind(socket_path)
            .context(format!("binding {}", socket_path.display()))?;
        Ok(Listener::Unix {
            listener,
            socket_path: Some(socket_path.to_path_buf()),
        })
    }

    #[cfg(target_os = "linux")]
    fn abstract_stream(name: &str) -> Result<Listener> {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        Ok(Listener::Unix {
            listener: tokio::net::UnixListener::from_std(listener)?,
            socket_path: None,
        })
    }

    async fn tcp_stream(opts: &str) -> Result<Listener> {
        let mut host = None;
        let mut port = None;
        for opt in opts.split(',') {
            match opt.split_once('=') {
                Some(("host", value)) => host = Some(value),
                Some(("port", value)) => port = Some(value.parse::<u16>()?),
                _ => bail!("unsupported `tcp` address option `{opt}`"),
            }
        }
        let host = host.ok_or_else(|| anyhow!("`tcp` address is missing `host`"))?;
        let port = port.ok_or_else(|| anyhow!("`tcp` address is missing `port`"))?;
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        Ok(Listener::Tcp { listener })
    }

    async fn accept(&mut self) -> Result<Stream> {
        match &mut self.listener {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                debug!("accepted connection from {:?}", addr);
                Ok(Stream::Unix(Arc::new(stream)))
            }
            Listener::Tcp { listener } => {
                let (stream, addr) = listener.accept().await?;
                debug!("accepted connection from {:?}", addr);
                Ok(Stream::Tcp(Arc::new(stream)))
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn guid(&self) -> &Arc<Guid> {
        &self.guid
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// A subscription to the observer feed.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.router.events().subscribe()
    }

    /// Installs the forwarder consulted for locally unknown destinations.
    pub fn set_forwarder(&self, forwarder: Box<dyn Forwarder>) {
        self.router.set_forwarder(forwarder);
    }
}

#[cfg(unix)]
fn default_address() -> String {
    let runtime_dir = env::var("XDG_RUNTIME_DIR")
        .as_ref()
        .map(|s| Path::new(s).to_path_buf())
        .ok()
        .unwrap_or_else(|| {
            Path::new("/run")
                .join("user")
                .join(format!("{}", nix::unistd::Uid::current()))
        });
    let path = runtime_dir.join("omnibusd-session");

    format!("unix:path={}", path.display())
}

#[cfg(not(unix))]
fn default_address() -> String {
    "tcp:host=127.0.0.1,port=4242".to_string()
}

#[cfg(unix)]
async fn read_machine_id() -> Option<String> {
    let id = tokio::fs::read_to_string("/etc/machine-id").await.ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(not(unix))]
async fn read_machine_id() -> Option<String> {
    None
}
