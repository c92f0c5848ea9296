//! Hemmer Reconcile
//!
//! Reconciliation engine for infrastructure providers whose control plane is
//! asynchronous: a mutation is accepted at once, and the resource reaches its
//! final state minutes later. This crate waits for that state, tells benign
//! errors ("already deleted", "busy, try later") apart from real failures and
//! strings the steps of a lifecycle transition together.
//!
//! # Overview
//!
//! - **State poller** ([`StatePoller`], [`PollSpec`]): polls a refresh
//!   function until a target label is seen, with delay, interval, timeout,
//!   consecutive-target counting and cancellation
//! - **Error classifier** ([`Classifier`], [`ClassificationRule`]): maps
//!   vendor errors matching a status and error code to "not found"
//! - **Orchestrator** ([`Orchestrator`]): precondition waits, busy retries,
//!   unique lookups, status and deletion waits, and compensation
//! - **Operation client** ([`OperationClient`], [`HttpOperationClient`]): the
//!   seam to the control plane
//! - **Resources** ([`resources`]): CSS clusters, Logstash pipelines, IoTDA
//!   batch tasks and DCS diagnosis
//! - **Testing** ([`testing`]): a scripted client and assertions for
//!   paused-clock tests
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_reconcile::{init_logging, ClientConfig, HttpOperationClient};
//! use hemmer_reconcile::resources::css::ClusterOrchestrator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let client = HttpOperationClient::new(ClientConfig::new(
//!         "https://css.eu-west-0.myhuaweicloud.com",
//!         "my-project",
//!     ))?;
//!     let clusters = ClusterOrchestrator::new(client);
//!
//!     let cluster = clusters
//!         .create(serde_json::json!({"cluster": {"name": "logs"}}))
//!         .await?;
//!     tracing::info!(cluster_id = %cluster.id, "Cluster available");
//!     Ok(())
//! }
//! ```
//!
//! # Custom Waits
//!
//! ```ignore
//! use hemmer_reconcile::{PollSpec, PollState, StatePoller};
//!
//! let spec = PollSpec::new(["BUILDING"], ["COMPLETED"]);
//! let state = StatePoller::new("snapshot s-1", spec)
//!     .poll(|| async { Ok(PollState::without_snapshot(read_status().await?)) })
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod query;
pub mod resources;
pub mod testing;
pub mod types;

// Re-export main types at crate root
pub use classify::{check_deleted, classify, ClassificationRule, Classifier};
pub use client::{HttpOperationClient, OperationClient};
pub use config::{
    ClientConfig, ResourceTimeouts, DEFAULT_POLL_DELAY, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT,
};
pub use error::{OperationError, ReconcileError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use orchestrator::{deletion_spec, list_all, Orchestrator, DEFAULT_PAGE_LIMIT, DELETED, PRESENT};
pub use poller::{LabelClass, PollSpec, StatePoller};
pub use query::{path_search, path_str, Query, QueryError};
pub use types::{Method, OperationRequest, PollState};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
