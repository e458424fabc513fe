use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use firewheel::Config;
use firewheel::core::coordination::{Coordination, MemoryCoordination};
use firewheel::core::driver::{ExecStatus, GuestDriver, WriteMode};
use firewheel::core::handler::{DriverFactory, Supervisor, SupervisorConfig};
use firewheel::core::schedule::{EventQueue, ScheduleEntry, ScheduleEvent, PRIORITY_MIN};
use firewheel::core::schedule_store::{MemoryScheduleDb, ScheduleSource};

/// One recorded in-guest execution.
#[derive(Debug, Clone)]
struct ExecRecord {
    vm: String,
    path: String,
    at: Instant,
    at_unix: u64,
}

#[derive(Default)]
struct GuestState {
    executions: Vec<ExecRecord>,
    next_pid: i64,
}

/// An in-memory guest whose agent always succeeds instantly.
struct FakeDriver {
    vm: String,
    state: Arc<Mutex<GuestState>>,
    used_paths: BTreeSet<String>,
}

impl GuestDriver for FakeDriver {
    fn engine(&self) -> &'static str {
        "FakeVM"
    }

    fn connect(&mut self) -> firewheel::Result<u32> {
        Ok(1)
    }

    fn close(&mut self) {}

    fn ping(&mut self, _timeout: Duration) -> bool {
        true
    }

    fn sync(&mut self, _timeout: Duration) -> firewheel::Result<u32> {
        Ok(1)
    }

    fn get_time(&mut self) -> firewheel::Result<i64> {
        Ok(0)
    }

    fn set_time(&mut self) -> firewheel::Result<()> {
        Ok(())
    }

    fn reboot(&mut self) -> firewheel::Result<()> {
        Ok(())
    }

    fn exec(
        &mut self,
        path: &str,
        _args: &[String],
        _env: &[String],
        _input: Option<&str>,
        _capture: bool,
    ) -> firewheel::Result<Option<i64>> {
        let mut state = self.state.lock().expect("guest state poisoned");
        state.next_pid += 1;
        let pid = state.next_pid;
        state.executions.push(ExecRecord {
            vm: self.vm.clone(),
            path: path.to_string(),
            at: Instant::now(),
            at_unix: firewheel::core::logs::unix_timestamp_seconds(),
        });
        Ok(Some(pid))
    }

    fn exec_status(&mut self, _pid: i64) -> firewheel::Result<ExecStatus> {
        Ok(ExecStatus {
            exited: true,
            exitcode: Some(0),
            ..ExecStatus::default()
        })
    }

    fn take_stdout(&mut self, _pid: i64) -> firewheel::Result<Option<String>> {
        Ok(None)
    }

    fn take_stderr(&mut self, _pid: i64) -> firewheel::Result<Option<String>> {
        Ok(None)
    }

    fn write(&mut self, _path: &str, _data: &str, _mode: WriteMode) -> firewheel::Result<bool> {
        Ok(true)
    }

    fn write_from_file(&mut self, _path: &str, _local: &Path) -> firewheel::Result<bool> {
        Ok(true)
    }

    fn read_file(&mut self, _guest: &str, _host: &Path) -> firewheel::Result<bool> {
        Ok(true)
    }

    fn get_os(&mut self) -> firewheel::Result<String> {
        Ok("Ubuntu".to_string())
    }

    fn used_paths_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.used_paths
    }

    // The fake guest either created files on request or pretends they do
    // not exist; both keep the supervisor's retry loops quiet.
    fn create_directories(&mut self, _directory: &str) -> firewheel::Result<Option<bool>> {
        Ok(Some(true))
    }

    fn delete_file(&mut self, _path: &str) -> firewheel::Result<Option<bool>> {
        Ok(Some(true))
    }

    fn file_exists(&mut self, _path: &str) -> firewheel::Result<Option<bool>> {
        Ok(Some(false))
    }

    fn make_file_executable(&mut self, _path: &str) -> firewheel::Result<Option<bool>> {
        Ok(Some(true))
    }
}

struct FakeFactory {
    vm: String,
    state: Arc<Mutex<GuestState>>,
}

impl DriverFactory for FakeFactory {
    fn connect(&self) -> firewheel::Result<Box<dyn GuestDriver>> {
        Ok(Box::new(FakeDriver {
            vm: self.vm.clone(),
            state: Arc::clone(&self.state),
            used_paths: BTreeSet::new(),
        }))
    }
}

fn test_config(tempdir: &TempDir) -> Config {
    let config_path = tempdir.path().join("firewheel.toml");
    fs::write(
        &config_path,
        format!(
            "[logging]\nlevel = \"DEBUG\"\nroot_dir = \"{root}\"\n\
             [cluster]\ncontrol = [\"localhost\"]\n\
             [minimega]\nfiles_dir = \"{root}/files\"\n",
            root = tempdir.path().display()
        ),
    )
    .expect("write config");
    Config::load(&config_path).expect("load config")
}

struct RunningSupervisor {
    queue: Arc<EventQueue>,
    handle: thread::JoinHandle<firewheel::Result<i32>>,
}

fn spawn_supervisor(
    name: &str,
    config: &Config,
    coordination: Arc<MemoryCoordination>,
    schedule: Arc<MemoryScheduleDb>,
    guest_state: Arc<Mutex<GuestState>>,
) -> RunningSupervisor {
    let supervisor = Supervisor::new(
        SupervisorConfig::from_json(&format!(
            "{{\"vm_name\": \"{name}\", \"vm_uuid\": \"uuid-{name}\", \
             \"engine\": \"FakeVM\", \"path\": \"/tmp/{name}.sock\"}}"
        ))
        .expect("vm config"),
        config.clone(),
        coordination as Arc<dyn Coordination>,
        schedule as Arc<dyn ScheduleSource>,
        None,
        Arc::new(FakeFactory {
            vm: name.to_string(),
            state: guest_state,
        }),
        // Keep every jittered sleep in the tens of milliseconds.
        0.01,
        Duration::from_secs(1),
    )
    .expect("supervisor");

    let queue = supervisor.event_queue();
    let handle = thread::spawn(move || supervisor.run());
    RunningSupervisor { queue, handle }
}

fn stop(running: RunningSupervisor) -> i32 {
    running.queue.push(PRIORITY_MIN, ScheduleEvent::Exit(0));
    running
        .handle
        .join()
        .expect("supervisor thread panicked")
        .expect("supervisor failed")
}

#[test]
fn negative_time_preload_then_start_barrier() {
    let tempdir = TempDir::new().expect("tempdir");
    let config = test_config(&tempdir);
    let coordination = Arc::new(MemoryCoordination::new());
    let schedule = Arc::new(MemoryScheduleDb::new());
    let guest_state = Arc::new(Mutex::new(GuestState::default()));

    // Two VMs, each with one configuration entry and one post-start entry.
    for vm in ["vm-a", "vm-b"] {
        schedule.put(
            vm,
            &[
                ScheduleEntry::executable("setup.sh", -1),
                ScheduleEntry::executable("measure.sh", 2),
            ],
        );
    }

    let supervisors: Vec<RunningSupervisor> = ["vm-a", "vm-b"]
        .iter()
        .map(|vm| {
            spawn_supervisor(
                vm,
                &config,
                Arc::clone(&coordination),
                Arc::clone(&schedule),
                Arc::clone(&guest_state),
            )
        })
        .collect();

    // Wait for the barrier to trip and the positive-time entries to fire.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let fired = {
            let state = guest_state.lock().expect("guest state poisoned");
            state
                .executions
                .iter()
                .filter(|record| record.path.contains("/2/measure.sh/"))
                .count()
        };
        if fired == 2 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "positive-time entries never fired"
        );
        thread::sleep(Duration::from_millis(100));
    }

    let stamp = coordination.start_time().expect("start time elected");
    let executions = guest_state
        .lock()
        .expect("guest state poisoned")
        .executions
        .clone();

    for vm in ["vm-a", "vm-b"] {
        let setup: Vec<&ExecRecord> = executions
            .iter()
            .filter(|r| r.vm == vm && r.path.contains("/-1/setup.sh/"))
            .collect();
        let measure: Vec<&ExecRecord> = executions
            .iter()
            .filter(|r| r.vm == vm && r.path.contains("/2/measure.sh/"))
            .collect();
        assert_eq!(setup.len(), 1, "{vm} ran its configuration entry once");
        assert_eq!(measure.len(), 1, "{vm} ran its post-start entry once");
        assert!(setup[0].at < measure[0].at);

        // The post-start entry fired no earlier than start + 2 seconds
        // (whole-second clocks allow one second of slack).
        assert!(
            measure[0].at_unix + 1 >= stamp + 2,
            "{vm} fired at {} but the barrier stamped {stamp}",
            measure[0].at_unix
        );
    }

    // The barrier tripped exactly once: the mappings are both configured.
    for vm in ["vm-a", "vm-b"] {
        let mapping = coordination
            .mapping(&format!("uuid-{vm}"))
            .expect("mapping exists");
        assert_eq!(mapping.state, "configured");
    }

    for supervisor in supervisors {
        assert_eq!(stop(supervisor), 0);
    }
}

#[test]
fn empty_schedule_promotes_to_configured_at_time_zero() {
    let tempdir = TempDir::new().expect("tempdir");
    let config = test_config(&tempdir);
    let coordination = Arc::new(MemoryCoordination::new());
    let schedule = Arc::new(MemoryScheduleDb::new());
    let guest_state = Arc::new(Mutex::new(GuestState::default()));

    let running = spawn_supervisor(
        "vm-empty",
        &config,
        Arc::clone(&coordination),
        Arc::clone(&schedule),
        guest_state,
    );

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(mapping) = coordination.mapping("uuid-vm-empty") {
            if mapping.state == "configured" {
                assert_eq!(mapping.current_time, 0);
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "empty schedule never promoted the VM"
        );
        thread::sleep(Duration::from_millis(50));
    }

    // Being the only VM, it elected the start time itself.
    assert!(coordination.start_time().is_some());
    assert_eq!(stop(running), 0);
}
