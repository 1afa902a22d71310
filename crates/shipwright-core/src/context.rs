//! Shared collaborators handed to every component.

use std::sync::Arc;

use shipwright_state::{Branch, Machine, MachineId, RecordStore, Repository};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::gitops::GitOps;
use crate::lock::KeyedLocks;
use crate::queue::TaskQueue;
use crate::remote::{RemoteSession, Target};
use crate::ticket::TicketSystem;

#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn RecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub tickets: Arc<dyn TicketSystem>,
    pub locks: KeyedLocks,
    pub config: Arc<OrchestratorConfig>,
}

impl Context {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        tickets: Arc<dyn TicketSystem>,
        config: OrchestratorConfig,
    ) -> Self {
        let locks = KeyedLocks::new(config.locks.retry_delay())
            .with_leases(Arc::clone(&store), config.locks.lease_ttl());
        Self {
            store,
            queue,
            tickets,
            locks,
            config: Arc::new(config),
        }
    }

    /// Session on `machine` in `cwd`.
    pub fn session(&self, machine: &Machine, cwd: impl Into<String>) -> RemoteSession {
        RemoteSession::new(
            Target::from_machine(machine),
            cwd,
            self.config.session.clone(),
        )
        .with_lock_retry_delay(self.locks.retry_delay())
    }

    pub async fn machine(&self, id: &MachineId) -> Result<Machine> {
        Ok(self.store.get_machine(id).await?)
    }

    /// Git access to the repository mirror.
    pub async fn mirror(&self, repo: &Repository) -> Result<GitOps> {
        let machine = self.machine(&repo.machine_id).await?;
        Ok(self.git(self.session(&machine, repo.mirror_path.clone())))
    }

    pub fn git(&self, session: RemoteSession) -> GitOps {
        GitOps::new(session, self.locks.clone())
    }

    /// Checkout directory of a branch instance.
    pub fn branch_dir(machine: &Machine, repo: &Repository, branch: &Branch) -> String {
        format!(
            "{}/branches/{}/{}",
            machine.workspace_root.trim_end_matches('/'),
            repo.name,
            branch.instance_name()
        )
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("locks", &self.locks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
