//! Best-effort observer feed consumed by external taps (e.g. a dashboard).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::wire::Message;

const CHANNEL_CAPACITY: usize = 256;

/// A structured bus event. The feed is lossy by construction: slow
/// subscribers miss events instead of slowing the bus down.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    PeerUp {
        unique: String,
        uid: Option<u32>,
    },
    PeerDown {
        unique: String,
    },
    NameChanged {
        name: String,
        old: Option<String>,
        new: Option<String>,
    },
    MessageRouted {
        kind: &'static str,
        serial: u32,
        sender: Option<String>,
        destination: Option<String>,
        path: Option<String>,
        interface: Option<String>,
        member: Option<String>,
    },
    PolicyDenied {
        action: &'static str,
        unique: String,
        detail: String,
    },
}

impl BusEvent {
    pub(crate) fn message_routed(msg: &Message) -> Self {
        BusEvent::MessageRouted {
            kind: msg.kind.as_str(),
            serial: msg.serial,
            sender: msg.sender.clone(),
            destination: msg.destination.clone(),
            path: msg.path.clone(),
            interface: msg.interface.clone(),
            member: msg.member.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<BusEvent>,
}

impl EventFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes without caring whether anyone listens.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}
