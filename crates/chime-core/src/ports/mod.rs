//! Ports - capability traits for everything outside the core loops.
//!
//! The store is the source of truth and the only synchronization point
//! between processes. Gateway, policy provider, clock and notification
//! transport are swappable adapters.

pub mod clock;
pub mod gateway;
pub mod notification;
pub mod policy_provider;
pub mod signal_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::gateway::DistributionGateway;
pub use self::notification::{
    NoopPublisher, NotificationHandler, NotificationPublisher, NotificationSubscriber,
};
pub use self::policy_provider::DistributionPolicyProvider;
pub use self::signal_store::{SignalSession, SignalStore};
