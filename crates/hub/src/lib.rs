//! fleethub hub controllers.
//!
//! - [`status`]: conflict-safe read-mutate-write of status sub-resources
//! - [`clusterset`]: the ManagedClusterSet controller and its membership cache
//! - [`runner`]: worker pool feeding the controller from a work queue

#![forbid(unsafe_code)]

pub mod clusterset;
pub mod config;
pub mod events;
pub mod helpers;
pub mod retry;
pub mod runner;
pub mod status;

pub use clusterset::{ClusterSetController, MembershipCache, SyncContext, SyncOutcome};
pub use config::HubConfig;
pub use events::{LogRecorder, MemoryRecorder};
pub use helpers::{is_csr_in_terminal_state, is_valid_https_url};
pub use retry::RetryPolicy;
pub use runner::Runner;
pub use status::{
    set_condition, update_addon_condition, update_cluster_set_condition, update_member_condition, update_status, StatusMutation,
    StatusUpdate,
};
