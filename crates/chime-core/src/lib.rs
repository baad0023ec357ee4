//! chime-core
//!
//! Durable delayed-signal delivery: producers submit signals with a fire
//! time, distributors claim due signals from a transactional store and hand
//! them to a gateway, with policy-driven retry and retention.
//!
//! # Modules
//! - **domain**: Signal state machine, DistributionPolicy, errors
//! - **ports**: SignalStore, DistributionGateway, policy provider, Clock, notifications
//! - **app**: distributor, zombie / dead loops, tracker, submitter, service
//! - **impls**: in-memory store, notification center, static policy provider
//! - **observability**: per-state counts

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use crate::app::{
    BuildError, ServiceBuilder, ServiceConfig, SignalProcessingService, SignalSubmission,
    SignalSubmitter,
};
pub use crate::domain::{
    ChimeError, DeliveryError, DistributionPolicy, Signal, SignalKey, SignalState,
};
