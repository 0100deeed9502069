//! groupkeeper - diagnosis and repair for group-replicated database clusters
//! running on Kubernetes.
//!
//! groupkeeper observes every member of a replication group, reduces their
//! partial and possibly contradictory views into one cluster verdict, and
//! drives the cluster back to a single-primary, full-quorum configuration:
//! creating the group, admitting and rejoining members, evicting removed
//! ones, rebooting after a complete outage and forcing quorum after a
//! partial one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  operator: kube-runtime controllers over pods and clusters  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  controller: create | join | rejoin | remove | reboot |     │
//! │              force quorum | repair dispatch | reconcile     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  diagnose: cluster verdict   │  monitor: primary tracking   │
//! │  partition: quorum analysis  │  and view notifications      │
//! │  probe: instance/candidate   │                              │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  lock | resilience | registry | gtid                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  db (admin client) | directory (members) | events (sink)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The database admin client, the member directory and the event sink are
//! traits; Kubernetes implementations of the latter two live in
//! [`directory`] and [`events`].
//!
//! # Quick Start
//!
//! ```no_run
//! use groupkeeper::config::OperatorConfig;
//! use groupkeeper::db::AdminConnector;
//! use std::sync::Arc;
//!
//! async fn start(connector: Arc<dyn AdminConnector>) -> groupkeeper::Result<()> {
//!     let config = OperatorConfig::default();
//!     groupkeeper::observability::init(&config.observability)?;
//!
//!     let client = kube::Client::try_default().await?;
//!     groupkeeper::operator::run(client, connector, config, None).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod crd;
pub mod db;
pub mod directory;
pub mod events;
pub mod gtid;
pub mod lock;
pub mod observability;
pub mod registry;
pub mod resilience;

pub mod controller;
pub mod diagnose;
pub mod monitor;
pub mod operator;
pub mod partition;
pub mod probe;

// Re-exports
pub use controller::{ClusterController, RepairOutcome};
pub use error::{ErrorKind, OperatorError, Result};
pub use types::*;
