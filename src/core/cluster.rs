use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;

use crate::config::{ClusterConfig, SshConfig};
use crate::core::logs::LogSink;
use crate::error::{Error, Result};

/// SSH options applied to every remote operation. Host key checking is
/// disabled because cluster nodes are frequently reimaged with fresh keys.
const SSH_OPTIONS: [&str; 5] = [
    "-C",
    "-oStrictHostKeyChecking=no",
    "-oUserKnownHostsFile=/dev/null",
    "-oNumberOfPasswordPrompts=1",
    "-oLogLevel=ERROR",
];

/// Exit codes that suggest the remote helper cache is stale (command not
/// found). Triggers a resync and a single retry.
const RESYNC_EXIT_CODES: [i32; 2] = [2, 127];

/// Fan-out executor for commands and file copies across a named host group.
pub struct ClusterExecutor {
    hosts: Vec<String>,
    control: Vec<String>,
    ssh_user: Option<String>,
    /// Path re-pushed to remote hosts when a command is missing there.
    helper_path: Option<PathBuf>,
    log: LogSink,
}

impl ClusterExecutor {
    /// Build an executor for the named host group (`control` or `compute`).
    pub fn new(
        cluster: &ClusterConfig,
        ssh: &SshConfig,
        host_group: &str,
        log: LogSink,
    ) -> Result<ClusterExecutor> {
        let hosts = cluster
            .group(host_group)
            .ok_or_else(|| Error::PreflightFailed {
                message: format!("The hostgroup {host_group} is not valid!"),
            })?
            .to_vec();
        Ok(ClusterExecutor {
            hosts,
            control: cluster.control.clone(),
            ssh_user: ssh.user.clone(),
            helper_path: None,
            log,
        })
    }

    /// Address every distinct node in the cluster.
    pub fn all_nodes(
        cluster: &ClusterConfig,
        ssh: &SshConfig,
        log: LogSink,
    ) -> ClusterExecutor {
        ClusterExecutor {
            hosts: cluster.all_nodes(),
            control: cluster.control.clone(),
            ssh_user: ssh.user.clone(),
            helper_path: None,
            log,
        }
    }

    /// Register the file re-pushed to hosts whose helper cache is stale.
    pub fn with_helper_path(mut self, path: PathBuf) -> ClusterExecutor {
        self.helper_path = Some(path);
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Hosts other than the local control node.
    pub fn peer_hosts(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|host| !self.control.contains(host))
            .cloned()
            .collect()
    }

    fn ssh_target(&self, host: &str) -> String {
        match &self.ssh_user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Copy a local file to the same path on every host in the group.
    /// Returns the number of hosts that failed.
    pub fn copy_file(&self, local: &Path, remote: &Path) -> usize {
        // A single-node cluster copies locally rather than through scp.
        if self.hosts == self.control {
            let status = Command::new("/bin/cp")
                .arg("-R")
                .arg(local)
                .arg(remote)
                .status();
            return match status {
                Ok(status) if status.success() => 0,
                Ok(status) => {
                    self.log.error(&format!(
                        "local copy of {} failed with {status}",
                        local.display()
                    ));
                    1
                }
                Err(err) => {
                    self.log
                        .error(&format!("local copy of {} failed: {err}", local.display()));
                    1
                }
            };
        }

        let results = self.for_each_host(|executor, host| {
            executor.scp_to_host(host, local, remote).map(|_| ())
        });
        self.count_errors("copy", results)
    }

    /// Run a command on every host in the group, returning the error count.
    /// Exit codes 2 and 127 trigger one helper resync and a retry.
    pub fn run_command(&self, command: &str, arguments: &[String]) -> usize {
        let results = self.for_each_host(|executor, host| {
            let output = executor.ssh_host(host, command, arguments)?;
            if output.status.success() {
                return Ok(());
            }

            let code = output.status.code().unwrap_or(-1);
            if RESYNC_EXIT_CODES.contains(&code) {
                executor.log.warning(&format!(
                    "{host}: `{command}` exited {code}; resyncing helper cache and retrying"
                ));
                executor.resync_host(host)?;
                let retry = executor.ssh_host(host, command, arguments)?;
                if retry.status.success() {
                    return Ok(());
                }
                return Err(Error::Transport {
                    peer: host.to_string(),
                    message: format!(
                        "`{command}` failed after resync with {}",
                        retry.status
                    ),
                });
            }

            Err(Error::Transport {
                peer: host.to_string(),
                message: format!("`{command}` exited {code}"),
            })
        });
        self.count_errors(command, results)
    }

    /// Capture a command's stdout from every host: `(host, Result<stdout>)`.
    pub fn run_command_capture(
        &self,
        command: &str,
        arguments: &[String],
    ) -> Vec<(String, Result<String>)> {
        self.for_each_host(|executor, host| {
            let output = executor.ssh_host(host, command, arguments)?;
            if !output.status.success() {
                return Err(Error::Transport {
                    peer: host.to_string(),
                    message: format!(
                        "`{command}` exited {}: {}",
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }

    /// Copy a file to one specific host.
    pub fn scp_to_host(&self, host: &str, local: &Path, remote: &Path) -> Result<Output> {
        let mut command = Command::new("scp");
        command.args(SSH_OPTIONS).arg("-p").arg(local).arg(format!(
            "{}:{}",
            self.ssh_target(host),
            remote.display()
        ));
        self.capture(host, command)
    }

    /// Pull a file from one specific host.
    pub fn scp_from_host(&self, host: &str, remote: &Path, local: &Path) -> Result<Output> {
        let mut command = Command::new("scp");
        command
            .args(SSH_OPTIONS)
            .arg("-p")
            .arg(format!("{}:{}", self.ssh_target(host), remote.display()))
            .arg(local);
        self.capture(host, command)
    }

    /// Run one command on one host.
    pub fn ssh_host(&self, host: &str, command: &str, arguments: &[String]) -> Result<Output> {
        let mut ssh = Command::new("ssh");
        ssh.args(SSH_OPTIONS)
            .arg(self.ssh_target(host))
            .arg(command)
            .args(arguments);
        self.capture(host, ssh)
    }

    fn capture(&self, host: &str, mut command: Command) -> Result<Output> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.output().map_err(|err| Error::Transport {
            peer: host.to_string(),
            message: err.to_string(),
        })
    }

    fn resync_host(&self, host: &str) -> Result<()> {
        let Some(helper) = &self.helper_path else {
            return Err(Error::Transport {
                peer: host.to_string(),
                message: "no helper path registered for resync".to_string(),
            });
        };
        let output = self.scp_to_host(host, helper, helper)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Transport {
                peer: host.to_string(),
                message: format!("helper resync failed with {}", output.status),
            })
        }
    }

    fn for_each_host<T, F>(&self, operation: F) -> Vec<(String, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&ClusterExecutor, &str) -> Result<T> + Sync,
    {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .hosts
                .iter()
                .map(|host| {
                    let host = host.clone();
                    let operation = &operation;
                    scope.spawn(move || {
                        let result = operation(self, &host);
                        (host, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("cluster worker panicked"))
                .collect()
        })
    }

    fn count_errors<T>(&self, label: &str, results: Vec<(String, Result<T>)>) -> usize {
        let mut errors = 0;
        for (host, result) in results {
            match result {
                Ok(_) => self.log.debug(&format!("{host}: {label} ok")),
                Err(err) => {
                    errors += 1;
                    self.log.error(&format!("{host}: {label} failed: {err}"));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logs::Level;

    fn executor(control: &[&str], compute: &[&str], group: &str) -> ClusterExecutor {
        let cluster = ClusterConfig {
            control: control.iter().map(|s| s.to_string()).collect(),
            compute: compute.iter().map(|s| s.to_string()).collect(),
        };
        let dir = tempfile::TempDir::new().expect("tempdir");
        let log = LogSink::open("cluster-test", &dir.path().join("cli.log"), Level::Debug)
            .expect("log");
        std::mem::forget(dir);
        ClusterExecutor::new(
            &cluster,
            &SshConfig {
                user: Some("firewheel".to_string()),
            },
            group,
            log,
        )
        .expect("group")
    }

    #[test]
    fn unknown_group_is_rejected() {
        let cluster = ClusterConfig {
            control: vec!["head".to_string()],
            compute: vec![],
        };
        let dir = tempfile::TempDir::new().expect("tempdir");
        let log =
            LogSink::open("cluster-test", &dir.path().join("cli.log"), Level::Debug).expect("log");
        assert!(
            ClusterExecutor::new(&cluster, &SshConfig { user: None }, "workers", log).is_err()
        );
    }

    #[test]
    fn ssh_targets_include_configured_user() {
        let executor = executor(&["head"], &["c1"], "compute");
        assert_eq!(executor.ssh_target("c1"), "firewheel@c1");
    }

    #[test]
    fn peer_hosts_exclude_control_nodes() {
        let executor = executor(&["head"], &["head", "c1", "c2"], "compute");
        assert_eq!(executor.peer_hosts(), vec!["c1", "c2"]);
    }

    #[test]
    fn single_node_copy_stays_local() {
        let executor = executor(&["head"], &[], "control");
        let dir = tempfile::TempDir::new().expect("tempdir");
        let source = dir.path().join("artifact.txt");
        let dest = dir.path().join("copied.txt");
        std::fs::write(&source, b"payload").expect("write");

        assert_eq!(executor.copy_file(&source, &dest), 0);
        assert_eq!(std::fs::read(&dest).expect("read copy"), b"payload");
    }
}
