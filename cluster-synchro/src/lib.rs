//! The `ClusterSynchro` engine: per-cluster dynamic discovery, resource
//! negotiation, and reconciliation into a pluggable storage backend.

pub mod config;
pub mod discovery;
pub mod health;
pub mod metrics;
pub mod negotiator;
pub mod reconciler;
pub mod runner;
pub mod status;
pub mod storage_factory;
pub mod synchro;

pub use config::SynchroConfig;
pub use negotiator::{DesiredResource, NegotiationRequest, ResolvedStorageConfig, ResourceConfigFactory};
pub use storage_factory::{CollectionResourceStorage, ResourceStorage, StorageFactory, SynchroFactory};
pub use synchro::{ClusterStatusUpdater, ClusterSynchro};
