//! # Strand Runtime
//!
//! Hosts flows on a node.
//!
//! - [`config`]: layered TOML/environment configuration
//! - [`telemetry`]: `tracing` subscriber installation
//! - [`scheduler`]: bounded worker pool with a parking lot for suspended flows
//! - [`recovery`]: rebuilds in-flight flows from checkpoints at startup
//! - [`node`]: the [`FlowNode`] facade tying the pieces together
//! - [`collaborators`]: default audit, permission and identity handlers

pub mod collaborators;
pub mod config;
pub mod node;
pub mod recovery;
pub mod scheduler;
pub mod task_registry;
pub mod telemetry;

pub use collaborators::{LoggingAuditSink, PermissionTable, StaticIdentity, ALL_PERMISSIONS};
pub use config::{
    CheckpointConfig, ConfigError, LoggingConfig, NodeConfig, NodeSection, SchedulerConfig,
    SnapshotConfig,
};
pub use node::{FlowNode, FlowNodeBuilder, NodeError};
pub use recovery::RecoveryReport;
pub use scheduler::{Scheduler, SchedulerStats};
pub use task_registry::TaskRegistry;
pub use telemetry::init_tracing;
