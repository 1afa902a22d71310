//! Shipwright-State: record store for the Shipwright orchestrator
//!
//! This crate holds the persistent entities of the orchestrator (machines,
//! repositories, commits, branches, releases, release items, test runs) and
//! the storage traits the core reads and writes them through. Leases and
//! queued jobs live here too, so several processes sharing one database
//! coordinate through it.
//!
//! ## Key Components
//!
//! - `RecordStore`: the combined async storage contract
//! - `SurrealRecordStore`: SurrealDB backend (in-memory or remote)
//! - `fakes::MemoryRecordStore`: in-memory fake for tests

mod error;
pub mod fakes;
mod handle;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use handle::{SurrealConfig, SurrealHandle};
pub use schema::{
    check_single_new_standard, ApprovalState, Branch, BranchId, BranchState, Commit, DeployStep,
    ItemBranchState, ItemState, JobStatus, Lease, LineKind, LineState, Machine, MachineId,
    MergeConflict, QueuedJob, ReleaseId, ReleaseItem, ReleaseItemBranch, ReleaseItemId,
    ReleaseType, Release, RepoId, Repository, ReviewState, RobotStats, RunState, TestRun,
    TestRunId, TestRunLine, TestRunLineId, TestState, TransportKind,
};
pub use storage_traits::{
    BranchStore, CommitStore, JobStore, LeaseStore, MachineStore, RecordStore, ReleaseStore,
    StorageResult, TestRunStore,
};
pub use surreal_store::SurrealRecordStore;
