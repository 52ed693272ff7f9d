pub mod bus;
pub mod events;
pub mod fdo;
pub mod match_rules;
pub mod name_registry;
pub mod names;
pub mod peer;
pub mod policy;
pub mod router;
pub mod tracing_subscriber;
pub mod wire;
