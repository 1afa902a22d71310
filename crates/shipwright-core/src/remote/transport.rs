//! Transport parameters: how to reach a host for commands and copies.
//!
//! Builds `std::process::Command`s; callers convert them to tokio commands.

use std::path::PathBuf;
use std::process::Command;

use shipwright_state::{Machine, TransportKind};

/// Connection parameters shared by a session and everything derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub user: String,
    pub key: Option<String>,
    pub kind: TransportKind,
}

impl Target {
    pub fn ssh(host: impl Into<String>, user: impl Into<String>, key: Option<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key,
            kind: TransportKind::Ssh,
        }
    }

    pub fn local() -> Self {
        Self {
            host: "localhost".to_string(),
            user: String::new(),
            key: None,
            kind: TransportKind::Local,
        }
    }

    pub fn from_machine(machine: &Machine) -> Self {
        match machine.transport {
            TransportKind::Local => Self::local(),
            TransportKind::Ssh => Self::ssh(
                machine.host.clone(),
                machine.ssh_user.clone(),
                machine.ssh_key.clone(),
            ),
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == TransportKind::Local
    }

    fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// Master connection socket; every ssh/scp for this target reuses it.
    fn control_path(&self) -> PathBuf {
        std::env::temp_dir().join("shipwright-ssh-%r@%h:%p")
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-oStrictHostKeyChecking=no".to_string(),
            "-oBatchMode=yes".to_string(),
            "-oControlMaster=auto".to_string(),
            "-oControlPersist=60".to_string(),
            format!("-oControlPath={}", self.control_path().display()),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    /// Process that reads a script on stdin and executes it.
    pub fn interactive_command(&self) -> Command {
        match self.kind {
            TransportKind::Local => {
                let mut cmd = Command::new("bash");
                cmd.arg("-s");
                cmd
            }
            TransportKind::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-T")
                    .args(self.ssh_options())
                    .arg(self.destination())
                    .arg("bash -s");
                cmd
            }
        }
    }

    /// Copy-channel process for a single file in either direction.
    pub fn copy_command(&self, direction: CopyDirection, local: &str, remote: &str) -> Command {
        match self.kind {
            TransportKind::Local => {
                let mut cmd = Command::new("cp");
                match direction {
                    CopyDirection::Upload => cmd.arg(local).arg(remote),
                    CopyDirection::Download => cmd.arg(remote).arg(local),
                };
                cmd
            }
            TransportKind::Ssh => {
                let mut cmd = Command::new("scp");
                cmd.arg("-q").args(self.ssh_options());
                let remote = format!("{}:{}", self.destination(), remote);
                match direction {
                    CopyDirection::Upload => cmd.arg(local).arg(remote),
                    CopyDirection::Download => cmd.arg(remote).arg(local),
                };
                cmd
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    Upload,
    Download,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ssh_command_uses_key_and_shared_connection() {
        let target = Target::ssh("build1", "deploy", Some("/keys/id".into()));
        let cmd = target.interactive_command();
        assert_eq!(cmd.get_program(), "ssh");
        let a = args(&cmd);
        assert!(a.contains(&"-T".to_string()));
        assert!(a.contains(&"-oStrictHostKeyChecking=no".to_string()));
        assert!(a.contains(&"-oControlMaster=auto".to_string()));
        assert!(a.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert!(a.contains(&"deploy@build1".to_string()));
    }

    #[test]
    fn scp_prefixes_remote_side() {
        let target = Target::ssh("build1", "deploy", None);
        let cmd = target.copy_command(CopyDirection::Download, "/tmp/x", "/srv/x");
        let a = args(&cmd);
        assert_eq!(a[a.len() - 2], "deploy@build1:/srv/x");
        assert_eq!(a[a.len() - 1], "/tmp/x");
    }

    #[test]
    fn local_target_uses_bash_and_cp() {
        let target = Target::local();
        assert_eq!(target.interactive_command().get_program(), "bash");
        let cmd = target.copy_command(CopyDirection::Upload, "/a", "/b");
        assert_eq!(cmd.get_program(), "cp");
        assert_eq!(args(&cmd), vec!["/a", "/b"]);
    }
}
