//! The bus's own object at `/org/freedesktop/DBus`.
//!
//! Dispatch is a method table over `(interface, member)` with an
//! unknown-method catch-all. Handlers that change name ownership deliver
//! their reply before emitting the resulting signals, so a caller always
//! sees its reply first.


use enumflags2::BitFlags;
use tracing::debug;

use crate::events::BusEvent;
use crate::fdo;
use crate::match_rules::MatchRule;
use crate::name_registry::{ReleaseNameReply, RequestNameFlags};
use crate::names;
use crate::router::Router;
use crate::wire::{Message, MessageType, Type, Value};

/// `(error name, human-readable text)` for an error reply.
type MethodError = (&'static str, String);

type MethodResult = Result<Option<Message>, MethodError>;

pub(crate) const INTROSPECTION_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReleaseName">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetNameOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="s"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListQueuedOwners">
      <arg direction="in" type="s"/>
      <arg direction="out" type="as"/>
    </method>
    <method name="NameHasOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="b"/>
    </method>
    <method name="AddMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="RemoveMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="GetId">
      <arg direction="out" type="s"/>
    </method>
    <method name="GetConnectionUnixUser">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
    <signal name="NameLost">
      <arg type="s"/>
    </signal>
    <signal name="NameAcquired">
      <arg type="s"/>
    </signal>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="out" type="v"/>
    </method>
    <method name="GetAll">
      <arg direction="in" type="s"/>
      <arg direction="out" type="a{sv}"/>
    </method>
  </interface>
</node>
"#;

/// Handles a message addressed to the bus. Returns the reply to deliver to
/// the caller, if any.
pub(crate) async fn dispatch(router: &Router, msg: &Message) -> Option<Message> {
    if msg.kind != MessageType::MethodCall {
        // Signals and replies addressed at the bus are consumed silently.
        return None;
    }
    let interface = msg.interface.as_deref().unwrap_or(fdo::INTERFACE_DBUS);
    let member = msg.member.as_deref().unwrap_or_default();
    debug!("bus call: {interface}.{member}");

    let result = match (interface, member) {
        (fdo::INTERFACE_DBUS, "Hello") => hello(router, msg).await,
        (fdo::INTERFACE_DBUS, "RequestName") => request_name(router, msg).await,
        (fdo::INTERFACE_DBUS, "ReleaseName") => release_name(router, msg).await,
        (fdo::INTERFACE_DBUS, "GetNameOwner") => get_name_owner(router, msg).await,
        (fdo::INTERFACE_DBUS, "ListNames") => list_names(router, msg).await,
        (fdo::INTERFACE_DBUS, "ListActivatableNames") => {
            Ok(Some(router.bus_reply(msg).with_body(
                vec![Type::Array(Box::new(Type::String))],
                vec![Value::Array(Type::String, vec![])],
            )))
        }
        (fdo::INTERFACE_DBUS, "ListQueuedOwners") => list_queued_owners(router, msg).await,
        (fdo::INTERFACE_DBUS, "NameHasOwner") => name_has_owner(router, msg).await,
        (fdo::INTERFACE_DBUS, "AddMatch") => add_match(router, msg).await,
        (fdo::INTERFACE_DBUS, "RemoveMatch") => remove_match(router, msg).await,
        (fdo::INTERFACE_DBUS, "GetId") => Ok(Some(router.bus_reply(msg).with_body(
            vec![Type::String],
            vec![Value::String(router.guid().to_string())],
        ))),
        (fdo::INTERFACE_DBUS, "GetConnectionUnixUser") => {
            get_connection_unix_user(router, msg).await
        }
        (fdo::INTERFACE_DBUS, _) => unknown_method(interface, member),
        (fdo::INTERFACE_INTROSPECTABLE, "Introspect") => Ok(Some(
            router.bus_reply(msg).with_body(
                vec![Type::String],
                vec![Value::String(INTROSPECTION_XML.to_string())],
            ),
        )),
        (fdo::INTERFACE_INTROSPECTABLE, _) => unknown_method(interface, member),
        (fdo::INTERFACE_PEER, "Ping") => Ok(Some(router.bus_reply(msg))),
        (fdo::INTERFACE_PEER, "GetMachineId") => Ok(Some(router.bus_reply(msg).with_body(
            vec![Type::String],
            vec![Value::String(router.machine_id().to_string())],
        ))),
        (fdo::INTERFACE_PEER, _) => unknown_method(interface, member),
        (fdo::INTERFACE_PROPERTIES, "Get") => get_property(router, msg).await,
        (fdo::INTERFACE_PROPERTIES, "GetAll") => get_all_properties(router, msg).await,
        (fdo::INTERFACE_PROPERTIES, _) => unknown_method(interface, member),
        _ => Err((
            fdo::ERR_UNKNOWN_INTERFACE,
            format!("unknown interface `{interface}`"),
        )),
    };

    match result {
        Ok(reply) => reply,
        Err((error_name, text)) => Some(router.bus_error(msg, error_name, &text)),
    }
}

fn unknown_method(interface: &str, member: &str) -> MethodResult {
    Err((
        fdo::ERR_UNKNOWN_METHOD,
        format!("no method `{member}` on interface `{interface}`"),
    ))
}

fn caller(msg: &Message) -> &str {
    // The router stamps the sender before any message reaches the bus
    // object.
    msg.sender.as_deref().expect("sender stamped by the router")
}

fn arg_str<'m>(msg: &'m Message, index: usize) -> Result<&'m str, MethodError> {
    msg.body
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_args(msg, index))
}

fn arg_u32(msg: &Message, index: usize) -> Result<u32, MethodError> {
    msg.body
        .get(index)
        .and_then(Value::as_u32)
        .ok_or_else(|| invalid_args(msg, index))
}

fn invalid_args(msg: &Message, index: usize) -> MethodError {
    (
        fdo::ERR_INVALID_ARGS,
        format!(
            "invalid argument {index} for {}.{}",
            msg.interface.as_deref().unwrap_or(fdo::INTERFACE_DBUS),
            msg.member.as_deref().unwrap_or_default(),
        ),
    )
}

async fn hello(router: &Router, msg: &Message) -> MethodResult {
    let caller = caller(msg);
    let changed = router
        .greet(caller)
        .await
        .map_err(|_| (fdo::ERR_FAILED, "Already handled an Hello message".to_string()))?;

    // The reply must reach the peer before its NameAcquired signal.
    let reply = router.bus_reply(msg).with_body(
        vec![Type::String],
        vec![Value::String(caller.to_string())],
    );
    router.deliver_reply(msg, reply).await;
    router.announce_name_change(changed).await;
    Ok(None)
}

async fn request_name(router: &Router, msg: &Message) -> MethodResult {
    let caller = caller(msg);
    let name = arg_str(msg, 0)?;
    let flags: BitFlags<RequestNameFlags> = BitFlags::from_bits_truncate(arg_u32(msg, 1)?);
    if !names::is_valid_well_known_name(name) {
        return Err((
            fdo::ERR_INVALID_ARGS,
            format!("`{name}` is not a valid well-known name"),
        ));
    }

    if let Err(deny) = router.policy().read().await.check_own(caller, name) {
        router.events().publish(BusEvent::PolicyDenied {
            action: "own",
            unique: caller.to_string(),
            detail: deny.detail.clone(),
        });
        return Err((deny.error_name, deny.detail));
    }

    let (reply_code, changed) = router
        .name_registry()
        .write()
        .await
        .request_name(name, caller, flags);

    let reply = router.bus_reply(msg).with_body(
        vec![Type::Uint32],
        vec![Value::Uint32(reply_code as u32)],
    );
    router.deliver_reply(msg, reply).await;
    if let Some(changed) = changed {
        router.announce_name_change(changed).await;
    }
    Ok(None)
}

async fn release_name(router: &Router, msg: &Message) -> MethodResult {
    let caller = caller(msg);
    let name = arg_str(msg, 0)?;
    let (reply_code, changed) = if names::is_valid_well_known_name(name) {
        router
            .name_registry()
            .write()
            .await
            .release_name(name, caller)
    } else {
        (ReleaseNameReply::NonExistent, None)
    };

    let reply = router.bus_reply(msg).with_body(
        vec![Type::Uint32],
        vec![Value::Uint32(reply_code as u32)],
    );
    router.deliver_reply(msg, reply).await;
    if let Some(changed) = changed {
        router.announce_name_change(changed).await;
    }
    Ok(None)
}

async fn get_name_owner(router: &Router, msg: &Message) -> MethodResult {
    let name = arg_str(msg, 0)?;
    let owner = router
        .name_registry()
        .read()
        .await
        .resolve(name)
        .ok_or_else(|| {
            (
                fdo::ERR_NAME_HAS_NO_OWNER,
                format!("`{name}` has no owner"),
            )
        })?;
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::String],
        vec![Value::String(owner)],
    )))
}

async fn list_names(router: &Router, msg: &Message) -> MethodResult {
    let registry = router.name_registry().read().await;
    let mut values = vec![Value::String(fdo::BUS_NAME.to_string())];
    values.extend(registry.unique_names().map(Value::from));
    values.extend(registry.well_known_names().map(Value::from));
    drop(registry);
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Array(Box::new(Type::String))],
        vec![Value::Array(Type::String, values)],
    )))
}

async fn list_queued_owners(router: &Router, msg: &Message) -> MethodResult {
    let name = arg_str(msg, 0)?;
    let registry = router.name_registry().read().await;
    let entry = registry.entry(name).ok_or_else(|| {
        (
            fdo::ERR_NAME_HAS_NO_OWNER,
            format!("`{name}` has no owner"),
        )
    })?;
    let values: Vec<Value> = entry
        .waiting_list()
        .map(|owner| Value::from(owner.unique_name()))
        .collect();
    drop(registry);
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Array(Box::new(Type::String))],
        vec![Value::Array(Type::String, values)],
    )))
}

async fn name_has_owner(router: &Router, msg: &Message) -> MethodResult {
    let name = arg_str(msg, 0)?;
    let has = router.name_registry().read().await.resolve(name).is_some();
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Bool],
        vec![Value::Bool(has)],
    )))
}

async fn add_match(router: &Router, msg: &Message) -> MethodResult {
    let caller = caller(msg);
    let rule: MatchRule = arg_str(msg, 0)?
        .parse()
        .map_err(|e| (fdo::ERR_MATCH_RULE_INVALID, format!("{e}")))?;
    if rule.eavesdrop {
        if let Err(deny) = router.policy().read().await.check_eavesdrop(caller) {
            router.events().publish(BusEvent::PolicyDenied {
                action: "eavesdrop",
                unique: caller.to_string(),
                detail: deny.detail.clone(),
            });
            return Err((deny.error_name, deny.detail));
        }
    }
    router.match_rules().write().await.add(caller, rule);
    Ok(Some(router.bus_reply(msg)))
}

async fn remove_match(router: &Router, msg: &Message) -> MethodResult {
    let caller = caller(msg);
    let rule: MatchRule = arg_str(msg, 0)?
        .parse()
        .map_err(|e| (fdo::ERR_MATCH_RULE_INVALID, format!("{e}")))?;
    if !router.match_rules().write().await.remove(caller, &rule) {
        return Err((
            fdo::ERR_MATCH_RULE_NOT_FOUND,
            "no such match rule".to_string(),
        ));
    }
    Ok(Some(router.bus_reply(msg)))
}

async fn get_connection_unix_user(router: &Router, msg: &Message) -> MethodResult {
    let name = arg_str(msg, 0)?;
    if name == fdo::BUS_NAME {
        let uid = nix::unistd::Uid::current().as_raw();
        return Ok(Some(router.bus_reply(msg).with_body(
            vec![Type::Uint32],
            vec![Value::Uint32(uid)],
        )));
    }
    let owner = router
        .name_registry()
        .read()
        .await
        .resolve(name)
        .ok_or_else(|| {
            (
                fdo::ERR_NAME_HAS_NO_OWNER,
                format!("`{name}` has no owner"),
            )
        })?;
    let uid = router.peer_uid(&owner).await.ok_or_else(|| {
        (
            fdo::ERR_FAILED,
            format!("could not determine the Unix user of `{name}`"),
        )
    })?;
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Uint32],
        vec![Value::Uint32(uid)],
    )))
}

fn features() -> Value {
    Value::Array(Type::String, vec![])
}

fn interfaces() -> Value {
    Value::Array(
        Type::String,
        vec![
            Value::from(fdo::INTERFACE_DBUS),
            Value::from(fdo::INTERFACE_INTROSPECTABLE),
            Value::from(fdo::INTERFACE_PEER),
            Value::from(fdo::INTERFACE_PROPERTIES),
        ],
    )
}

async fn get_property(router: &Router, msg: &Message) -> MethodResult {
    let interface = arg_str(msg, 0)?;
    let property = arg_str(msg, 1)?;
    if interface != fdo::INTERFACE_DBUS {
        return Err((
            fdo::ERR_UNKNOWN_INTERFACE,
            format!("unknown interface `{interface}`"),
        ));
    }
    let value = match property {
        "Features" => features(),
        "Interfaces" => interfaces(),
        _ => {
            return Err((
                fdo::ERR_UNKNOWN_PROPERTY,
                format!("unknown property `{property}`"),
            ))
        }
    };
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Variant],
        vec![Value::Variant(Box::new(value))],
    )))
}

async fn get_all_properties(router: &Router, msg: &Message) -> MethodResult {
    let interface = arg_str(msg, 0)?;
    if interface != fdo::INTERFACE_DBUS {
        return Err((
            fdo::ERR_UNKNOWN_INTERFACE,
            format!("unknown interface `{interface}`"),
        ));
    }
    let entry_ty = Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant));
    let dict = Value::Array(
        entry_ty.clone(),
        vec![
            Value::DictEntry(
                Box::new(Value::String("Features".to_string())),
                Box::new(Value::Variant(Box::new(features()))),
            ),
            Value::DictEntry(
                Box::new(Value::String("Interfaces".to_string())),
                Box::new(Value::Variant(Box::new(interfaces()))),
            ),
        ],
    );
    Ok(Some(router.bus_reply(msg).with_body(
        vec![Type::Array(Box::new(entry_ty))],
        vec![dict],
    )))
}
