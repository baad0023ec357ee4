//! App - the loops and APIs built on top of the ports.
//!
//! # Components
//! - **SignalDistributor**: claim ready signals, deliver, settle
//! - **DetachedTaskTracker**: supervises in-flight deliveries for shutdown
//! - **ZombieSignalProcessor**: reclaims timed-out Processing signals
//! - **DeadSignalProcessor**: deletes terminal signals past retention
//! - **SignalSubmitter**: submit / batch submit / cancel
//! - **ServiceBuilder** / **SignalProcessingService**: wiring and hosting

pub mod builder;
pub mod config;
pub mod dead_loop;
pub mod distributor;
pub mod service;
pub mod submission;
pub mod tracker;
pub mod zombie_loop;

pub use self::builder::{BuildError, ServiceBuilder};
pub use self::config::{
    DeadConfig, DistributorConfig, PoliciesConfig, PolicyConfig, ServiceConfig, ZombieConfig,
};
pub use self::dead_loop::DeadSignalProcessor;
pub use self::distributor::SignalDistributor;
pub use self::service::SignalProcessingService;
pub use self::submission::{SignalSubmission, SignalSubmitter};
pub use self::tracker::DetachedTaskTracker;
pub use self::zombie_loop::ZombieSignalProcessor;
