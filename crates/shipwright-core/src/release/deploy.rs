//! Per-machine deploy action set.
//!
//! Mandatory steps run in order and stop at the first failure. Steps of the
//! finally phase (`Start`, `PostHook`) run afterwards regardless; their errors
//! are logged and collected, never returned.

use shipwright_state::{DeployStep, Machine, Release, Repository};
use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::error::{Result, ShipwrightError};
use crate::remote::{shell_quote, ExecOptions, LogSink, RemoteSession};

/// What to deploy.
#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    pub release: &'a Release,
    pub repo: &'a Repository,
    /// Stable commit to ship
    pub sha: &'a str,
    pub log: &'a LogSink,
}

#[derive(Debug, Clone)]
pub struct Deployer {
    ctx: Context,
}

impl Deployer {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Deploy to every machine of the release, one after another.
    pub async fn deploy(&self, req: &DeployRequest<'_>) -> Result<()> {
        for id in &req.release.machine_ids {
            let machine = self.ctx.machine(id).await?;
            self.deploy_machine(req, &machine).await?;
        }
        Ok(())
    }

    fn source_dir(machine: &Machine, release: &Release) -> String {
        format!(
            "{}/releases/{}",
            machine.workspace_root.trim_end_matches('/'),
            release.project_name
        )
    }

    fn settings_path(machine: &Machine, release: &Release) -> String {
        format!(
            "{}/settings/{}",
            machine.workspace_root.trim_end_matches('/'),
            release.project_name
        )
    }

    #[instrument(skip(self, req, machine), fields(machine = %machine.name))]
    pub async fn deploy_machine(&self, req: &DeployRequest<'_>, machine: &Machine) -> Result<()> {
        let session = self
            .ctx
            .session(machine, "/")
            .with_env("PROJECT_NAME", req.release.project_name.clone())
            .with_log(req.log.clone());
        let source = session.with_cwd(Self::source_dir(machine, req.release));

        let (finally, mandatory): (Vec<&DeployStep>, Vec<&DeployStep>) =
            req.release.actions.iter().partition(|s| s.is_finally());

        let mut result = Ok(());
        for step in mandatory {
            info!(step = ?step, "deploy step");
            if let Err(e) = self.run_step(step, req, machine, &session, &source).await {
                result = Err(e);
                break;
            }
        }

        for step in finally {
            info!(step = ?step, "deploy finally step");
            if let Err(e) = self.run_step(step, req, machine, &session, &source).await {
                warn!(step = ?step, error = %e, "finally step failed");
                req.log.push(format!("finally step {step:?} failed: {e}"));
            }
        }
        result
    }

    async fn run_step(
        &self,
        step: &DeployStep,
        req: &DeployRequest<'_>,
        machine: &Machine,
        session: &RemoteSession,
        source: &RemoteSession,
    ) -> Result<()> {
        let cli = &self.ctx.config.tests.instance_cli;
        match step {
            DeployStep::UploadSettings => {
                let path = Self::settings_path(machine, req.release);
                let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("/");
                session.run(&format!("mkdir -p {}", shell_quote(dir))).await?;
                let mut content = format!("PROJECT_NAME={}\n", req.release.project_name);
                if let Some(extra) = &req.release.common_settings {
                    content.push_str(extra);
                    content.push('\n');
                }
                session.write_text(&path, &content).await
            }
            DeployStep::BuildImages => {
                source.run(&format!("{cli} build")).await?;
                Ok(())
            }
            DeployStep::PushImages => {
                let registry = machine.registry.as_deref().ok_or_else(|| {
                    ShipwrightError::Validation(format!(
                        "machine {} has no registry configured",
                        machine.name
                    ))
                })?;
                source
                    .execute(
                        &format!("{cli} docker-registry push"),
                        ExecOptions {
                            env: [("REGISTRY".to_string(), registry.to_string())]
                                .into_iter()
                                .collect(),
                            ..ExecOptions::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            DeployStep::TransferSource => self.transfer_source(req, machine, session).await,
            DeployStep::Stop => {
                source.run(&format!("{cli} down")).await?;
                Ok(())
            }
            DeployStep::Update => {
                for cmd in ["reload", "build", "update"] {
                    source.run(&format!("{cli} {cmd}")).await?;
                }
                Ok(())
            }
            DeployStep::Start => {
                source.run(&format!("{cli} up -d")).await?;
                Ok(())
            }
            DeployStep::PostHook(command) => {
                source.run(command).await?;
                Ok(())
            }
        }
    }

    /// Export the stable commit from the mirror and copy it to the machine.
    async fn transfer_source(
        &self,
        req: &DeployRequest<'_>,
        machine: &Machine,
        session: &RemoteSession,
    ) -> Result<()> {
        let repo_machine = self.ctx.machine(&req.repo.machine_id).await?;
        let mirror = self
            .ctx
            .session(&repo_machine, req.repo.mirror_path.clone())
            .with_log(req.log.clone());
        let export = format!("/tmp/shipwright-export-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = format!(
            "mkdir -p {export} && git archive {} | tar -x -C {export}",
            shell_quote(req.sha)
        );
        if req.release.deploy_git {
            cmd.push_str(&format!(" && cp -a .git {export}/.git"));
        }
        mirror.run(&cmd).await?;

        let local = tempfile::tempdir()?;
        let fetched = mirror.get_tree(&export, local.path()).await;
        mirror.rmifexists(&export).await?;
        fetched?;

        let dest = Self::source_dir(machine, req.release);
        session
            .run(&format!(
                "rm -rf {dest} && mkdir -p {dest}",
                dest = shell_quote(&dest)
            ))
            .await?;
        session.put_tree(local.path(), &dest).await
    }
}
