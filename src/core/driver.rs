use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::core::schedule::{DataSpec, EntryPaths, ScheduleEntry, ScheduledItem};
use crate::error::Result;

/// Poll interval used by the blocking process-success helpers.
const STATUS_POLL: Duration = Duration::from_secs(2);

/// Cached status of a process started in the guest.
#[derive(Debug, Clone, Default)]
pub struct ExecStatus {
    pub exited: bool,
    pub exitcode: Option<i64>,
    pub signal: Option<i64>,
    pub stdout: Option<String>,
    pub stdout_trunc: bool,
    pub stderr: Option<String>,
    pub stderr_trunc: bool,
}

/// File write modes supported by guest agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Write,
    Append,
}

impl WriteMode {
    pub fn as_agent_mode(self) -> &'static str {
        match self {
            WriteMode::Write => "w",
            WriteMode::Append => "a",
        }
    }
}

pub fn is_windows(os: &str) -> bool {
    os.to_lowercase().contains("windows")
}

/// Host-side stub for a single VM's in-guest agent. One transport per VM;
/// implementations serialize all operations through an internal mutex.
pub trait GuestDriver: Send {
    /// The virtualization engine this driver speaks to (e.g. `QemuVM`).
    fn engine(&self) -> &'static str;

    /// (Re)open the transport and synchronize; returns the sync token.
    fn connect(&mut self) -> Result<u32>;

    fn close(&mut self);

    /// Round-trip liveness probe; on timeout the transport is quietly
    /// closed and `false` returned.
    fn ping(&mut self, timeout: Duration) -> bool;

    /// Drain the agent buffer until a fresh random token round-trips.
    fn sync(&mut self, timeout: Duration) -> Result<u32>;

    /// Guest wall-clock in seconds since the epoch.
    fn get_time(&mut self) -> Result<i64>;

    /// Set the guest wall-clock to host UTC.
    fn set_time(&mut self) -> Result<()>;

    /// Issue a reboot and reset the output cache. The agent call is
    /// expected to time out rather than answer.
    fn reboot(&mut self) -> Result<()>;

    /// Start a process; `Ok(None)` means the agent reported a failure.
    fn exec(
        &mut self,
        path: &str,
        args: &[String],
        env: &[String],
        input: Option<&str>,
        capture: bool,
    ) -> Result<Option<i64>>;

    /// Poll a process, folding newly captured output into the per-pid cache.
    fn exec_status(&mut self, pid: i64) -> Result<ExecStatus>;

    /// Return and clear the buffered stdout for a pid.
    fn take_stdout(&mut self, pid: i64) -> Result<Option<String>>;

    /// Return and clear the buffered stderr for a pid.
    fn take_stderr(&mut self, pid: i64) -> Result<Option<String>>;

    /// Write string content to a guest path, creating missing parents.
    fn write(&mut self, path: &str, data: &str, mode: WriteMode) -> Result<bool>;

    /// Chunked host-to-guest file transfer with per-chunk verification.
    fn write_from_file(&mut self, path: &str, local: &Path) -> Result<bool>;

    /// Chunked guest-to-host file transfer.
    fn read_file(&mut self, guest_path: &str, host_destination: &Path) -> Result<bool>;

    /// Probe (and cache) the guest operating system name.
    fn get_os(&mut self) -> Result<String>;

    /// Working directories already handed out to entries on this VM.
    fn used_paths_mut(&mut self) -> &mut BTreeSet<String>;

    /// Exit code of a finished process, `None` while it runs.
    fn get_exitcode(&mut self, pid: i64) -> Result<Option<i64>> {
        let status = self.exec_status(pid)?;
        Ok(if status.exited { status.exitcode } else { None })
    }

    /// Block until the process exits and report whether it succeeded.
    fn evaluate_process_success(&mut self, pid: i64) -> bool {
        loop {
            match self.get_exitcode(pid) {
                Ok(Some(code)) => return code == 0,
                Ok(None) => thread::sleep(STATUS_POLL),
                Err(_) => return false,
            }
        }
    }

    /// Create a directory path inside the guest. `Ok(None)` mirrors an
    /// agent-side execution failure.
    fn create_directories(&mut self, directory: &str) -> Result<Option<bool>> {
        let windows = is_windows(&self.get_os()?);
        let pid = if windows {
            let win_path = directory.replace('/', "\\");
            self.exec(
                "cmd",
                &[format!("/c if not exist {win_path} md {win_path}")],
                &[],
                None,
                true,
            )?
        } else {
            self.exec(
                "/bin/bash",
                &[
                    "-c".to_string(),
                    format!("[ -d {directory} ] || mkdir -p {directory}"),
                ],
                &[],
                None,
                true,
            )?
        };
        match pid {
            None => Ok(None),
            Some(pid) => Ok(Some(self.evaluate_process_success(pid))),
        }
    }

    /// Delete a file inside the guest.
    fn delete_file(&mut self, path: &str) -> Result<Option<bool>> {
        let windows = is_windows(&self.get_os()?);
        let pid = if windows {
            let win_path = path.replace('/', "\\");
            self.exec(
                "cmd",
                &[format!("/c if exist {win_path} del /q {win_path}")],
                &[],
                None,
                true,
            )?
        } else {
            self.exec(
                "/bin/bash",
                &["-c".to_string(), format!("rm -rf {path}")],
                &[],
                None,
                true,
            )?
        };
        match pid {
            None => Ok(None),
            Some(pid) => Ok(Some(self.evaluate_process_success(pid))),
        }
    }

    /// Check whether at least one file matching `path` exists in the guest.
    fn file_exists(&mut self, path: &str) -> Result<Option<bool>> {
        let windows = is_windows(&self.get_os()?);
        let pid = if windows {
            let win_path = path.replace('/', "\\");
            self.exec(
                "cmd",
                &[format!("/c if exist {win_path} echo True")],
                &[],
                None,
                true,
            )?
        } else {
            // Wildcards expand in the guest shell, so test each candidate.
            let argument = format!(
                "for i in {path}; \
                 do test -e \"$i\" && echo True && break || echo False && break; done"
            );
            self.exec("/bin/bash", &["-c".to_string(), argument], &[], None, true)?
        };
        let Some(pid) = pid else {
            return Ok(None);
        };
        if !self.evaluate_process_success(pid) {
            return Ok(Some(false));
        }
        let stdout = self.take_stdout(pid)?;
        Ok(Some(
            stdout.map(|out| out.contains("True")).unwrap_or(false),
        ))
    }

    /// List files under `path`, optionally newer than a guest timestamp.
    fn get_files(&mut self, path: &str, since: Option<i64>) -> Result<Option<Vec<String>>> {
        let windows = is_windows(&self.get_os()?);
        let pid = if windows {
            let win_path = path.replace('/', "\\");
            self.exec(
                "cmd",
                &["/c".to_string(), format!("dir /s /b {win_path}")],
                &[],
                None,
                true,
            )?
        } else {
            let mut argument = format!("find {path} -type f");
            if let Some(timestamp) = since {
                argument.push_str(&format!(" -newermt '@{timestamp}'"));
            }
            self.exec("/bin/bash", &["-c".to_string(), argument], &[], None, true)?
        };
        let Some(pid) = pid else {
            return Ok(None);
        };
        if !self.evaluate_process_success(pid) {
            return Ok(None);
        }
        let stdout = self.take_stdout(pid)?.unwrap_or_default();
        let files = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.ends_with("swp"))
            .map(str::to_string)
            .collect();
        Ok(Some(files))
    }

    /// Set the executable flag on a guest file (a no-op on Windows).
    fn make_file_executable(&mut self, path: &str) -> Result<Option<bool>> {
        if is_windows(&self.get_os()?) {
            return Ok(Some(true));
        }
        let pid = self.exec(
            "/bin/bash",
            &[
                "-c".to_string(),
                format!("chmod +x {path} && echo True || echo False"),
            ],
            &[],
            None,
            true,
        )?;
        let Some(pid) = pid else {
            return Ok(None);
        };
        if !self.evaluate_process_success(pid) {
            return Ok(Some(false));
        }
        let stdout = self.take_stdout(pid)?;
        Ok(Some(
            stdout.map(|out| out.contains("True")).unwrap_or(false),
        ))
    }

    /// Compute the guest-side paths and call-script body for an entry.
    /// Idempotent per item; entries without an executable only drop data and
    /// need no paths.
    fn create_paths(&mut self, item: &mut ScheduledItem) -> Result<()> {
        if item.entry.executable.is_none() || item.paths.is_some() {
            return Ok(());
        }
        let windows = is_windows(&self.get_os()?);
        let paths = derive_entry_paths(&item.entry, windows, self.used_paths_mut());
        item.paths = Some(paths);
        Ok(())
    }
}

/// Derive working directory, executable path, reboot sentinel, and call
/// script for an entry, deconflicting the working directory against paths
/// already in use.
pub fn derive_entry_paths(
    entry: &ScheduleEntry,
    windows: bool,
    used_paths: &mut BTreeSet<String>,
) -> EntryPaths {
    let executable = entry.executable.clone().unwrap_or_default();
    let exe_name = executable
        .rsplit('/')
        .next()
        .unwrap_or(&executable)
        .to_string();
    let base = if windows { "/launch" } else { "/var/launch" };

    let desired = format!("{base}/{}/{exe_name}", entry.start_time);
    let working_dir = deconflict_path(used_paths, desired);

    // The executable resolves relative to the working directory only when
    // the entry itself delivers it; otherwise a bare name must come from
    // the guest's PATH.
    let exec_path = if executable.starts_with('/') {
        executable.clone()
    } else {
        let delivered = entry.data.iter().any(|spec| {
            matches!(spec, DataSpec::File { filename, .. } if *filename == executable)
        });
        if delivered {
            format!("{working_dir}/{executable}")
        } else {
            executable.clone()
        }
    };

    let reboot_file = format!("{working_dir}/reboot");
    let call_script = if windows {
        format!("{working_dir}/call_arguments.bat")
    } else {
        format!("{working_dir}/call_arguments.sh")
    };

    let mut call_arguments = if windows {
        format!(
            "@echo off\r\npushd {}\r\n{}",
            working_dir.replace('/', "\\"),
            exec_path.replace('/', "\\")
        )
    } else {
        format!(
            "#!/bin/bash\nCURRENT_DIR=\"$(dirname \"$0\")\"\ncd {working_dir}\n{exec_path}"
        )
    };
    if let Some(arguments) = &entry.arguments {
        call_arguments.push(' ');
        call_arguments.push_str(arguments);
    }
    if windows {
        call_arguments.push_str("\r\nexit /B %ERRORLEVEL%\r\n");
    } else {
        call_arguments.push('\n');
    }

    EntryPaths {
        working_dir,
        exec_path,
        reboot_file,
        call_script,
        call_arguments,
    }
}

/// Append a numeric suffix until the path is unique among `used`.
fn deconflict_path(used: &mut BTreeSet<String>, desired: String) -> String {
    let mut candidate = desired;
    while used.contains(&candidate) {
        let (stem, counter) = match candidate.rsplit_once('_') {
            Some((stem, suffix)) => match suffix.parse::<u64>() {
                Ok(n) => (stem.to_string(), n),
                Err(_) => (candidate.clone(), 0),
            },
            None => (candidate.clone(), 0),
        };
        candidate = format!("{stem}_{}", counter + 1);
    }
    used.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::DataSpec;

    #[test]
    fn posix_paths_and_script_are_derived() {
        let mut used = BTreeSet::new();
        let mut entry = ScheduleEntry::executable("configure.sh", -100);
        entry.arguments = Some("--fast".to_string());
        entry.data = vec![DataSpec::File {
            filename: "configure.sh".to_string(),
            location: "configure.sh".to_string(),
            executable: true,
        }];

        let paths = derive_entry_paths(&entry, false, &mut used);
        assert_eq!(paths.working_dir, "/var/launch/-100/configure.sh");
        assert_eq!(
            paths.exec_path,
            "/var/launch/-100/configure.sh/configure.sh"
        );
        assert_eq!(paths.reboot_file, "/var/launch/-100/configure.sh/reboot");
        assert_eq!(
            paths.call_script,
            "/var/launch/-100/configure.sh/call_arguments.sh"
        );
        assert!(paths.call_arguments.starts_with("#!/bin/bash\n"));
        assert!(paths.call_arguments.contains("cd /var/launch/-100/configure.sh\n"));
        assert!(
            paths
                .call_arguments
                .ends_with("/var/launch/-100/configure.sh/configure.sh --fast\n")
        );
    }

    #[test]
    fn undelivered_relative_executable_uses_guest_path() {
        let mut used = BTreeSet::new();
        let entry = ScheduleEntry::executable("hostname", 5);
        let paths = derive_entry_paths(&entry, false, &mut used);
        assert_eq!(paths.exec_path, "hostname");
    }

    #[test]
    fn absolute_executable_is_kept() {
        let mut used = BTreeSet::new();
        let entry = ScheduleEntry::executable("/usr/bin/env", 5);
        let paths = derive_entry_paths(&entry, false, &mut used);
        assert_eq!(paths.exec_path, "/usr/bin/env");
        assert_eq!(paths.working_dir, "/var/launch/5/env");
    }

    #[test]
    fn working_directories_deconflict_with_numeric_suffixes() {
        let mut used = BTreeSet::new();
        let entry = ScheduleEntry::executable("run.sh", 0);
        let first = derive_entry_paths(&entry, false, &mut used);
        let second = derive_entry_paths(&entry, false, &mut used);
        let third = derive_entry_paths(&entry, false, &mut used);
        assert_eq!(first.working_dir, "/var/launch/0/run.sh");
        assert_eq!(second.working_dir, "/var/launch/0/run.sh_1");
        assert_eq!(third.working_dir, "/var/launch/0/run.sh_2");
    }

    #[test]
    fn windows_script_uses_batch_conventions() {
        let mut used = BTreeSet::new();
        let entry = ScheduleEntry::executable("setup.bat", 10);
        let paths = derive_entry_paths(&entry, true, &mut used);
        assert_eq!(paths.working_dir, "/launch/10/setup.bat");
        assert_eq!(paths.call_script, "/launch/10/setup.bat/call_arguments.bat");
        assert!(paths.call_arguments.starts_with("@echo off\r\n"));
        assert!(paths.call_arguments.contains("pushd \\launch\\10\\setup.bat\r\n"));
        assert!(paths.call_arguments.ends_with("exit /B %ERRORLEVEL%\r\n"));
    }
}
