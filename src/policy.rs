//! Capability-based access control.
//!
//! Grants are structured capabilities attached to a peer's unique name, not
//! XML rules. Defaults are installed from the authenticated credentials when
//! the peer comes up and destroyed with the peer.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::fdo;
use crate::peer::handshake::Credentials;
use crate::wire::{Message, MessageType};

/// Uids below this are treated as system services and trusted to own and
/// send freely.
const SYSTEM_UID_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Superuser,
    SendAny,
    SendTo(String),
    OwnAny,
    Own(String),
    Call {
        destination: String,
        interface: String,
        member: Option<String>,
    },
    ReceiveFrom(String),
    Eavesdrop,
}

/// A denied decision, carrying the error name for the synthesized reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deny {
    pub error_name: &'static str,
    pub detail: String,
}

impl Deny {
    fn new(detail: String) -> Self {
        Self {
            error_name: fdo::ERR_ACCESS_DENIED,
            detail,
        }
    }
}

#[derive(Debug, Default)]
pub struct Policy {
    grants: HashMap<String, HashSet<Capability>>,
}

impl Policy {
    /// Seeds a connecting peer's grants from its credentials: root gets
    /// everything, system users get blanket own/send, anything else may only
    /// talk to the bus itself. An anonymous peer on the local socket is
    /// treated like a system user.
    pub fn install_defaults(&mut self, unique_name: &str, credentials: &Credentials) {
        let grants = match credentials.uid {
            Some(0) => vec![Capability::Superuser],
            Some(uid) if uid < SYSTEM_UID_LIMIT => {
                vec![Capability::OwnAny, Capability::SendAny]
            }
            Some(_) => vec![Capability::SendTo(fdo::BUS_NAME.to_string())],
            None => vec![Capability::OwnAny, Capability::SendAny],
        };
        debug!("default grants for {unique_name}: {grants:?}");
        self.grants
            .insert(unique_name.to_string(), grants.into_iter().collect());
    }

    pub fn grant(&mut self, unique_name: &str, capability: Capability) {
        self.grants
            .entry(unique_name.to_string())
            .or_default()
            .insert(capability);
    }

    /// Gate on every send. Replies and bus-destined messages are always
    /// allowed; signals are currently allowed unconditionally.
    pub fn check_send(&self, sender: &str, msg: &Message) -> Result<(), Deny> {
        if msg.is_reply() {
            return Ok(());
        }
        let destination = match msg.destination.as_deref() {
            None | Some(fdo::BUS_NAME) => return Ok(()),
            Some(destination) => destination,
        };
        if msg.kind == MessageType::Signal {
            return Ok(());
        }

        let grants = self.grants.get(sender);
        let has = |cap: &Capability| grants.is_some_and(|set| set.contains(cap));
        if has(&Capability::Superuser)
            || has(&Capability::SendAny)
            || has(&Capability::SendTo(destination.to_string()))
        {
            return Ok(());
        }
        if let Some(interface) = msg.interface.as_deref() {
            if let Some(member) = msg.member.as_deref() {
                if has(&Capability::Call {
                    destination: destination.to_string(),
                    interface: interface.to_string(),
                    member: Some(member.to_string()),
                }) {
                    return Ok(());
                }
            }
            if has(&Capability::Call {
                destination: destination.to_string(),
                interface: interface.to_string(),
                member: None,
            }) {
                return Ok(());
            }
        }
        Err(Deny::new(format!(
            "peer `{sender}` may not send to `{destination}`"
        )))
    }

    pub fn check_own(&self, unique_name: &str, name: &str) -> Result<(), Deny> {
        let grants = self.grants.get(unique_name);
        let has = |cap: &Capability| grants.is_some_and(|set| set.contains(cap));
        if has(&Capability::Superuser)
            || has(&Capability::OwnAny)
            || has(&Capability::Own(name.to_string()))
        {
            return Ok(());
        }
        Err(Deny::new(format!(
            "peer `{unique_name}` may not own `{name}`"
        )))
    }

    pub fn check_eavesdrop(&self, unique_name: &str) -> Result<(), Deny> {
        if self
            .grants
            .get(unique_name)
            .is_some_and(|set| set.contains(&Capability::Superuser))
        {
            return Ok(());
        }
        Err(Deny::new(format!(
            "peer `{unique_name}` may not eavesdrop"
        )))
    }

    pub fn peer_disconnected(&mut self, unique_name: &str) {
        self.grants.remove(unique_name);
    }
}
