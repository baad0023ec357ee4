//! Impls - in-process adapters for the ports.
//!
//! Production deployments swap the store and notification transport for
//! database- or bus-backed implementations of the same traits.

pub mod inmem_notification;
pub mod inmem_store;
pub mod static_policy;

pub use self::inmem_notification::{
    InMemoryNotificationCenter, InMemoryNotificationPublisher, InMemoryNotificationSubscriber,
};
pub use self::inmem_store::InMemorySignalStore;
pub use self::static_policy::{StaticPolicyProvider, StaticPolicyProviderBuilder};
