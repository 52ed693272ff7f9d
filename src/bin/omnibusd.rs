use anyhow::Result;
use clap::Parser;
use omnibusd::bus::Bus;
use tracing::{error, info};

/// A D-Bus message broker.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on, e.g. `unix:path=/tmp/bus-socket`.
    ///
    /// Defaults to a session socket under XDG_RUNTIME_DIR.
    #[clap(short = 'a', long)]
    address: Option<String>,

    /// Print the bus address to standard output once listening.
    #[clap(long)]
    print_address: bool,

    /// Deliver broadcast signals to peers that registered no match rules.
    ///
    /// This eases porting of clients that never call `AddMatch`; strict
    /// D-Bus semantics deliver signals only to matching subscribers.
    #[clap(long)]
    compat_broadcast: bool,

    /// Notify readiness by writing `READY=1` to this file descriptor.
    ///
    /// The descriptor is closed after the notification, which covers both
    /// systemd- and s6-style supervisors. Unix-like platforms only.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    omnibusd::tracing_subscriber::init();

    let args = Args::parse();
    let mut bus = Bus::for_address(args.address.as_deref(), args.compat_broadcast).await?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        notify_ready(fd)?;
    }
    if args.print_address {
        println!("{}", bus.address());
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sig_int = signal(SignalKind::interrupt())?;
        let mut sig_term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sig_int.recv() => info!("SIGINT received, shutting down"),
            _ = sig_term.recv() => info!("SIGTERM received, shutting down"),
            res = bus.run() => match res {
                Ok(()) => info!("bus stopped, shutting down"),
                Err(e) => error!("bus stopped with an error: {e}"),
            }
        }
    }
    #[cfg(not(unix))]
    bus.run().await?;

    if let Err(e) = bus.cleanup().await {
        error!("failed to clean up: {e}");
    }

    Ok(())
}

#[cfg(unix)]
fn notify_ready(fd: i32) -> Result<()> {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::FromRawFd;

    // SAFETY: taking ownership of the descriptor number is the contract of
    // --ready-fd; the supervisor keeps its own copy.
    let mut ready = unsafe { File::from_raw_fd(fd) };
    ready.write_all(b"READY=1\n").map_err(Into::into)
}
