use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

use crate::wire::{Message, MessageType, Value};

/// Argument filters only exist for the first 64 body positions.
const MAX_ARG_INDEX: usize = 63;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchRuleError {
    #[error("unknown match rule key `{0}`")]
    UnknownKey(String),
    #[error("argument index {0} out of range")]
    ArgIndexOutOfRange(usize),
    #[error("invalid message type `{0}`")]
    InvalidMessageType(String),
    #[error("unterminated quoted value")]
    UnterminatedQuote,
    #[error("expected `key=value`, got `{0}`")]
    MissingValue(String),
    #[error("duplicate key `{0}`")]
    DuplicateKey(String),
    #[error("invalid value for key `{0}`")]
    InvalidValue(String),
}

/// One parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    pub kind: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    pub eavesdrop: bool,
    pub args: Vec<(usize, String)>,
    pub arg_paths: Vec<(usize, String)>,
}

impl MatchRule {
    /// Evaluates the rule against a message: the conjunction of every
    /// present key.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(kind) = self.kind {
            if kind != msg.kind {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if msg.sender.as_deref() != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if msg.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if msg.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if msg.destination.as_deref() != Some(destination.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if msg.path.as_deref() != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(namespace) = &self.path_namespace {
            match &msg.path {
                Some(path) if is_path_prefix(namespace, path) => {}
                _ => return false,
            }
        }
        for (index, expected) in &self.args {
            match msg.body.get(*index) {
                Some(Value::String(actual)) if actual == expected => {}
                _ => return false,
            }
        }
        for (index, expected) in &self.arg_paths {
            let actual = match msg.body.get(*index) {
                Some(Value::String(s)) | Some(Value::ObjectPath(s)) => s,
                _ => return false,
            };
            if actual != expected && !is_path_prefix(expected, actual) {
                return false;
            }
        }
        true
    }
}

/// `namespace` equals `path` or is a `/`-separated prefix of it.
fn is_path_prefix(namespace: &str, path: &str) -> bool {
    if namespace == path {
        return true;
    }
    let trimmed = namespace.strip_suffix('/').unwrap_or(namespace);
    match path.strip_prefix(trimmed) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

impl FromStr for MatchRule {
    type Err = MatchRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rule = MatchRule::default();
        for (key, value) in split_pairs(s)? {
            match key.as_str() {
                "type" => {
                    check_unset(rule.kind.is_none(), &key)?;
                    rule.kind = Some(match value.as_str() {
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        "signal" => MessageType::Signal,
                        other => return Err(MatchRuleError::InvalidMessageType(other.into())),
                    });
                }
                "sender" => {
                    check_unset(rule.sender.is_none(), &key)?;
                    rule.sender = Some(value);
                }
                "interface" => {
                    check_unset(rule.interface.is_none(), &key)?;
                    rule.interface = Some(value);
                }
                "member" => {
                    check_unset(rule.member.is_none(), &key)?;
                    rule.member = Some(value);
                }
                "path" => {
                    check_unset(rule.path.is_none(), &key)?;
                    rule.path = Some(value);
                }
                "path_namespace" => {
                    check_unset(rule.path_namespace.is_none(), &key)?;
                    rule.path_namespace = Some(value);
                }
                "destination" => {
                    check_unset(rule.destination.is_none(), &key)?;
                    rule.destination = Some(value);
                }
                "eavesdrop" => {
                    rule.eavesdrop = match value.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => return Err(MatchRuleError::InvalidValue(key)),
                    };
                }
                _ => {
                    if let Some(digits) = key.strip_prefix("arg") {
                        let (digits, is_path) = match digits.strip_suffix("path") {
                            Some(digits) => (digits, true),
                            None => (digits, false),
                        };
                        let index: usize = digits
                            .parse()
                            .map_err(|_| MatchRuleError::UnknownKey(key.clone()))?;
                        if index > MAX_ARG_INDEX {
                            return Err(MatchRuleError::ArgIndexOutOfRange(index));
                        }
                        let filters = if is_path {
                            &mut rule.arg_paths
                        } else {
                            &mut rule.args
                        };
                        if filters.iter().any(|(i, _)| *i == index) {
                            return Err(MatchRuleError::DuplicateKey(key));
                        }
                        filters.push((index, value));
                    } else {
                        return Err(MatchRuleError::UnknownKey(key));
                    }
                }
            }
        }
        Ok(rule)
    }
}

fn check_unset(unset: bool, key: &str) -> Result<(), MatchRuleError> {
    if unset {
        Ok(())
    } else {
        Err(MatchRuleError::DuplicateKey(key.to_string()))
    }
}

/// Splits `key='value',key='value'` pairs. Values may mix quoted and
/// unquoted segments; a backslash escapes the next character outside
/// quotes.
fn split_pairs(s: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(MatchRuleError::MissingValue(s.to_string()));
        }
        let mut value = String::new();
        let mut in_quote = false;
        let mut done = false;
        while let Some(c) = chars.next() {
            match c {
                '\'' => in_quote = !in_quote,
                ',' if !in_quote => {
                    done = true;
                    break;
                }
                '\\' if !in_quote => match chars.next() {
                    Some(escaped) => value.push(escaped),
                    None => break,
                },
                c => value.push(c),
            }
        }
        if in_quote {
            return Err(MatchRuleError::UnterminatedQuote);
        }
        pairs.push((key, value));
        // A trailing comma with nothing after it is tolerated.
        let _ = done;
    }
    Ok(pairs)
}

/// All subscriptions on the bus, keyed by the owning peer for fast teardown.
#[derive(Debug, Default)]
pub struct MatchRules {
    rules: HashMap<String, Vec<MatchRule>>,
}

impl MatchRules {
    pub fn add(&mut self, peer: &str, rule: MatchRule) {
        self.rules.entry(peer.to_string()).or_default().push(rule);
    }

    /// Removes the first rule equal to `rule`; false when none matches.
    pub fn remove(&mut self, peer: &str, rule: &MatchRule) -> bool {
        let Some(rules) = self.rules.get_mut(peer) else {
            return false;
        };
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return false;
        };
        rules.remove(pos);
        if rules.is_empty() {
            self.rules.remove(peer);
        }
        true
    }

    pub fn has_rules(&self, peer: &str) -> bool {
        self.rules.contains_key(peer)
    }

    /// Peers with at least one rule matching the message. Used for signal
    /// fan-out.
    pub fn matching_peers(&self, msg: &Message) -> Vec<String> {
        self.rules
            .iter()
            .filter(|(_, rules)| rules.iter().any(|rule| rule.matches(msg)))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Peers with a matching rule that asked to eavesdrop. Used to copy
    /// unicast traffic to monitors.
    pub fn eavesdroppers(&self, msg: &Message) -> Vec<String> {
        self.rules
            .iter()
            .filter(|(_, rules)| {
                rules
                    .iter()
                    .any(|rule| rule.eavesdrop && rule.matches(msg))
            })
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn peer_disconnected(&mut self, peer: &str) {
        self.rules.remove(peer);
    }
}
