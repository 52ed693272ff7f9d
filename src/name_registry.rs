use std::collections::{HashMap, HashSet, VecDeque};

use enumflags2::{bitflags, BitFlags};

use crate::fdo;

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameFlags {
    AllowReplacement = 0x1,
    ReplaceExisting = 0x2,
    DoNotQueue = 0x4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

/// One ownership transition, reported back to the caller so it can emit the
/// `NameOwnerChanged` signal and the observer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NameOwner {
    unique_name: String,
    flags: BitFlags<RequestNameFlags>,
}

impl NameOwner {
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn allow_replacement(&self) -> bool {
        self.flags.contains(RequestNameFlags::AllowReplacement)
    }
}

#[derive(Debug, Clone)]
pub struct NameEntry {
    owner: NameOwner,
    waiting_list: VecDeque<NameOwner>,
}

impl NameEntry {
    pub fn owner(&self) -> &NameOwner {
        &self.owner
    }

    pub fn waiting_list(&self) -> impl Iterator<Item = &NameOwner> {
        self.waiting_list.iter()
    }
}

/// Well-known and unique name ownership.
///
/// The registry only records transitions; broadcasting them is the caller's
/// business. A reverse map from unique name to owned names keeps disconnect
/// teardown proportional to what the peer owned.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, NameEntry>,
    unique_names: HashSet<String>,
    names_by_peer: HashMap<String, HashSet<String>>,
}

impl NameRegistry {
    /// Records a freshly assigned unique name (on `Hello`).
    pub fn register_unique(&mut self, unique_name: &str) -> NameOwnerChanged {
        self.unique_names.insert(unique_name.to_string());
        NameOwnerChanged {
            name: unique_name.to_string(),
            old_owner: None,
            new_owner: Some(unique_name.to_string()),
        }
    }

    pub fn request_name(
        &mut self,
        name: &str,
        unique_name: &str,
        flags: BitFlags<RequestNameFlags>,
    ) -> (RequestNameReply, Option<NameOwnerChanged>) {
        let owner = NameOwner {
            unique_name: unique_name.to_string(),
            flags,
        };

        match self.names.get_mut(name) {
            Some(entry) => {
                if entry.owner.unique_name == unique_name {
                    // Refresh the flags so a later release honours them.
                    entry.owner.flags = flags;
                    (RequestNameReply::AlreadyOwner, None)
                } else if flags.contains(RequestNameFlags::ReplaceExisting)
                    && entry.owner.allow_replacement()
                {
                    let old = std::mem::replace(&mut entry.owner, owner);
                    entry
                        .waiting_list
                        .retain(|waiting| waiting.unique_name != unique_name);
                    unindex(&mut self.names_by_peer, &old.unique_name, name);
                    index(&mut self.names_by_peer, unique_name, name);
                    (
                        RequestNameReply::PrimaryOwner,
                        Some(NameOwnerChanged {
                            name: name.to_string(),
                            old_owner: Some(old.unique_name),
                            new_owner: Some(unique_name.to_string()),
                        }),
                    )
                } else if flags.contains(RequestNameFlags::DoNotQueue) {
                    (RequestNameReply::Exists, None)
                } else {
                    match entry
                        .waiting_list
                        .iter_mut()
                        .find(|waiting| waiting.unique_name == unique_name)
                    {
                        Some(waiting) => waiting.flags = flags,
                        None => entry.waiting_list.push_back(owner),
                    }
                    (RequestNameReply::InQueue, None)
                }
            }
            None => {
                self.names.insert(
                    name.to_string(),
                    NameEntry {
                        owner,
                        waiting_list: VecDeque::new(),
                    },
                );
                index(&mut self.names_by_peer, unique_name, name);
                (
                    RequestNameReply::PrimaryOwner,
                    Some(NameOwnerChanged {
                        name: name.to_string(),
                        old_owner: None,
                        new_owner: Some(unique_name.to_string()),
                    }),
                )
            }
        }
    }

    pub fn release_name(
        &mut self,
        name: &str,
        unique_name: &str,
    ) -> (ReleaseNameReply, Option<NameOwnerChanged>) {
        let Some(entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };

        if entry.owner.unique_name == unique_name {
            unindex(&mut self.names_by_peer, unique_name, name);
            let changed = match entry.waiting_list.pop_front() {
                Some(successor) => {
                    let new_owner = successor.unique_name.clone();
                    entry.owner = successor;
                    index(&mut self.names_by_peer, &new_owner, name);
                    NameOwnerChanged {
                        name: name.to_string(),
                        old_owner: Some(unique_name.to_string()),
                        new_owner: Some(new_owner),
                    }
                }
                None => {
                    self.names.remove(name);
                    NameOwnerChanged {
                        name: name.to_string(),
                        old_owner: Some(unique_name.to_string()),
                        new_owner: None,
                    }
                }
            };
            (ReleaseNameReply::Released, Some(changed))
        } else {
            let before = entry.waiting_list.len();
            entry
                .waiting_list
                .retain(|waiting| waiting.unique_name != unique_name);
            if entry.waiting_list.len() < before {
                (ReleaseNameReply::Released, None)
            } else {
                (ReleaseNameReply::NotOwner, None)
            }
        }
    }

    /// Resolves a destination to the owning unique name. The bus's own name
    /// resolves to itself.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if name == fdo::BUS_NAME {
            return Some(fdo::BUS_NAME.to_string());
        }
        if name.starts_with(':') {
            return self.unique_names.get(name).cloned();
        }
        self.names
            .get(name)
            .map(|entry| entry.owner.unique_name.clone())
    }

    /// Owner lookup for `GetNameOwner`; unlike `resolve` this does not treat
    /// the bus name specially.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.names
            .get(name)
            .map(|entry| entry.owner.unique_name.clone())
    }

    pub fn entry(&self, name: &str) -> Option<&NameEntry> {
        self.names.get(name)
    }

    pub fn well_known_names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    pub fn unique_names(&self) -> impl Iterator<Item = &str> {
        self.unique_names.iter().map(String::as_str)
    }

    pub fn has_unique_name(&self, unique_name: &str) -> bool {
        self.unique_names.contains(unique_name)
    }

    /// Releases everything the peer owns or waits for, promoting successors.
    /// Transitions are returned oldest first, the unique name's last.
    pub fn peer_disconnected(&mut self, unique_name: &str) -> Vec<NameOwnerChanged> {
        let mut changes = Vec::new();

        let owned = self
            .names_by_peer
            .get(unique_name)
            .map(|names| names.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for name in owned {
            let (reply, changed) = self.release_name(&name, unique_name);
            debug_assert_eq!(reply, ReleaseNameReply::Released);
            changes.extend(changed);
        }
        self.names_by_peer.remove(unique_name);

        for entry in self.names.values_mut() {
            entry
                .waiting_list
                .retain(|waiting| waiting.unique_name != unique_name);
        }

        if self.unique_names.remove(unique_name) {
            changes.push(NameOwnerChanged {
                name: unique_name.to_string(),
                old_owner: Some(unique_name.to_string()),
                new_owner: None,
            });
        }
        changes
    }

}

fn index(names_by_peer: &mut HashMap<String, HashSet<String>>, unique_name: &str, name: &str) {
    names_by_peer
        .entry(unique_name.to_string())
        .or_default()
        .insert(name.to_string());
}

fn unindex(names_by_peer: &mut HashMap<String, HashSet<String>>, unique_name: &str, name: &str) {
    if let Some(names) = names_by_peer.get_mut(unique_name) {
        names.remove(name);
        if names.is_empty() {
            names_by_peer.remove(unique_name);
        }
    }
}
