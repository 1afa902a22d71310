//! Shipwright Core
//!
//! Orchestration for a continuous build/test/release pipeline: remote
//! command execution, git plumbing on remote mirrors, branch lifecycle
//! states, release assembly and test runs against ephemeral instances.
//!
//! ## Key Components
//!
//! - [`RemoteSession`]: marker-delimited command execution over ssh or locally
//! - [`GitOps`]: clone, fetch, merge, tag and push on a remote working copy
//! - [`BranchStateMachine`]: ordered rule table deriving branch states
//! - [`ReleaseAssembler`]: candidate recreation, release and deploy
//! - [`TestRunEngine`]: batched unit, robot and migration tests
//! - [`Orchestrator`]: dispatches queued jobs to the components above

pub mod branch_state;
pub mod build;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod gitops;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod release;
pub mod remote;
pub mod telemetry;
pub mod testrun;
pub mod ticket;

pub use branch_state::{derive_state, BranchStateInputs, BranchStateMachine, CommitFlags, Membership};
pub use build::BranchBuilder;
pub use config::{LockConfig, OrchestratorConfig, SessionConfig, TicketConfig, WorkerConfig};
pub use context::Context;
pub use error::{Result, ShipwrightError};
pub use fetch::{BranchFetcher, FetchSummary};
pub use gitops::{CommitInfo, GitOps, MergeOutcome};
pub use lock::{KeyedLocks, LockGuard};
pub use orchestrator::{DrainReport, JobOutcome, Orchestrator};
pub use queue::{
    EnqueueOutcome, Job, JobId, JobPayload, JobStatus, MemoryTaskQueue, StoreTaskQueue, TaskQueue,
};
pub use release::{CandidateOutcome, HeartbeatReport, ReleaseAssembler, ReleaseOutcome};
pub use remote::{CopyDirection, ExecOptions, ExecOutput, LogSink, RemoteSession, Target};
pub use telemetry::init_tracing;
pub use testrun::{aggregate, TestRunEngine, TestSettings};
pub use ticket::{NoopTicketSystem, RecordingTicketSystem, TicketSystem, WebhookTicketSystem};
