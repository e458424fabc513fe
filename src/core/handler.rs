use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::core::coordination::{Coordination, VmMapping};
use crate::core::driver::{is_windows, GuestDriver, WriteMode};
use crate::core::logs::{unix_timestamp_seconds, JsonLog, LogSink};
use crate::core::qga::connect_driver;
use crate::core::schedule::{
    DataSpec, EventQueue, ScheduleEvent, ScheduledItem, REBOOT_EXIT_CODE,
};
use crate::core::schedule_store::ScheduleSource;
use crate::core::store::FileStore;
use crate::core::updater::{ScheduleUpdater, UpdaterContext};
use crate::error::{Error, Result};

/// Sentinel for "no schedule time observed yet".
const INITIAL_TIME: i64 = i64::MIN + 1;

/// Attempts to stage one file into the guest before giving up.
const LOAD_ATTEMPTS: usize = 10;

/// Startup configuration handed to each supervisor process as JSON argv.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    pub vm_name: String,
    pub vm_uuid: String,
    pub engine: String,
    /// Path to the guest-agent transport (virtio-serial socket).
    pub path: PathBuf,
    #[serde(default)]
    pub control_ip: Option<String>,
    /// Committed vcpus on this host, used for the load-balance factor.
    #[serde(default)]
    pub vcpu_commit: u32,
}

impl SupervisorConfig {
    pub fn from_json(raw: &str) -> Result<SupervisorConfig> {
        serde_json::from_str(raw).map_err(|err| Error::PreflightFailed {
            message: format!("Malformed supervisor configuration: {err}"),
        })
    }
}

/// Creates driver connections for one VM; reconnects go through the same
/// factory.
pub trait DriverFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn GuestDriver>>;
}

/// Factory dispatching on the VM's virtualization engine.
pub struct EngineDriverFactory {
    engine: String,
    socket_path: PathBuf,
    windows_eof_heuristic: bool,
    log: LogSink,
}

impl EngineDriverFactory {
    pub fn new(
        engine: &str,
        socket_path: &Path,
        windows_eof_heuristic: bool,
        log: LogSink,
    ) -> EngineDriverFactory {
        EngineDriverFactory {
            engine: engine.to_string(),
            socket_path: socket_path.to_path_buf(),
            windows_eof_heuristic,
            log,
        }
    }
}

impl DriverFactory for EngineDriverFactory {
    fn connect(&self) -> Result<Box<dyn GuestDriver>> {
        connect_driver(
            &self.engine,
            &self.socket_path,
            self.windows_eof_heuristic,
            self.log.clone(),
        )
    }
}

type SharedDriver = Arc<Mutex<Box<dyn GuestDriver>>>;

/// Context shared with worker threads.
struct WorkerContext {
    vm_name: String,
    driver: SharedDriver,
    factory: Arc<dyn DriverFactory>,
    store: Option<Arc<FileStore>>,
    log: LogSink,
    json_log: JsonLog,
    load_balance_factor: f64,
    windows: bool,
    transfer_root: PathBuf,
}

impl WorkerContext {
    /// Re-establish the driver connection, retrying forever with jittered
    /// sleeps.
    fn reconnect(&self) {
        loop {
            self.log.info("Resetting driver connection");
            match self.factory.connect() {
                Ok(fresh) => {
                    let mut driver = self.driver.lock().expect("driver mutex poisoned");
                    driver.close();
                    *driver = fresh;
                    return;
                }
                Err(err) => {
                    self.log.error(&format!("driver connect failed: {err}"));
                    let jitter = rand::thread_rng().gen_range(3..=10) as f64;
                    sleep_scaled(self.load_balance_factor, jitter);
                }
            }
        }
    }

    fn sleep(&self, seconds: f64) {
        sleep_scaled(self.load_balance_factor, seconds);
    }
}

fn sleep_scaled(load_balance_factor: f64, seconds: f64) {
    thread::sleep(Duration::from_secs_f64(
        (load_balance_factor * seconds).max(0.0),
    ));
}

/// The per-VM supervisor: owns one driver connection, runs the schedule
/// updater, and executes that VM's schedule.
pub struct Supervisor {
    config: SupervisorConfig,
    app_config: Config,
    coordination: Arc<dyn Coordination>,
    schedule: Arc<dyn ScheduleSource>,
    store: Option<Arc<FileStore>>,
    factory: Arc<dyn DriverFactory>,
    queue: Arc<EventQueue>,
    log: LogSink,
    json_log: JsonLog,
    load_balance_factor: f64,
    check_interval: Duration,

    driver: Option<SharedDriver>,
    target_os: String,
    state: Option<String>,
    current_time: i64,
    experiment_start_time: Option<u64>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        app_config: Config,
        coordination: Arc<dyn Coordination>,
        schedule: Arc<dyn ScheduleSource>,
        store: Option<Arc<FileStore>>,
        factory: Arc<dyn DriverFactory>,
        load_balance_factor: f64,
        check_interval: Duration,
    ) -> Result<Supervisor> {
        let log_dir = app_config.logging.vmr_log_path();
        let log = LogSink::open(
            &config.vm_name,
            &log_dir.join(format!("{}.log", config.vm_name)),
            crate::core::logs::Level::parse(&app_config.logging.level),
        )?;
        let json_log = JsonLog::open(&log_dir.join(format!("{}.json", config.vm_name)))?;

        log.info("Starting RESOURCE HANDLER");
        log.info(&format!("Using load_balance_factor of {load_balance_factor}"));

        Ok(Supervisor {
            config,
            app_config,
            coordination,
            schedule,
            store,
            factory,
            queue: Arc::new(EventQueue::new()),
            log,
            json_log,
            load_balance_factor,
            check_interval,
            driver: None,
            target_os: String::new(),
            state: None,
            current_time: INITIAL_TIME,
            experiment_start_time: None,
        })
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Handle to the supervisor's event queue. Tests inject `Exit` events
    /// through it to stop the dispatch loop.
    pub fn event_queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    /// Connect, synchronize the guest, start the updater, and run the main
    /// dispatch loop. Returns the process exit code.
    pub fn run(mut self) -> Result<i32> {
        self.connect_first();
        self.set_state("configuring");

        // The updater is held back until the guest is reachable.
        let updater = ScheduleUpdater::spawn(UpdaterContext {
            vm_name: self.config.vm_name.clone(),
            queue: Arc::clone(&self.queue),
            schedule: Arc::clone(&self.schedule),
            coordination: Arc::clone(&self.coordination),
            store: self.store.clone(),
            log: self.log.clone(),
            load_balance_factor: self.load_balance_factor,
            interval: self.check_interval,
        });

        let driver = Arc::clone(self.driver.as_ref().expect("connected"));
        self.target_os = {
            let mut driver = driver.lock().expect("driver mutex poisoned");
            driver.get_os().unwrap_or_default()
        };
        let context = self.worker_context(is_windows(&self.target_os));

        // Windows accepts agent connections before the system is usable;
        // modifying its disk too early causes corruption.
        if context.windows {
            context.sleep(10.0);
        }

        self.log.info("Setting time");
        {
            let mut driver = driver.lock().expect("driver mutex poisoned");
            if let Err(err) = driver.set_time() {
                self.log.error(&format!("unable to set guest time: {err}"));
            }
        }
        self.log.info("Done setting time");

        let exit_code = self.dispatch_loop(&context);
        updater.stop();
        if let Some(driver) = &self.driver {
            driver.lock().expect("driver mutex poisoned").close();
        }
        exit_code
    }

    fn connect_first(&mut self) {
        loop {
            self.log.info("New driver connection");
            match self.factory.connect() {
                Ok(driver) => {
                    self.driver = Some(Arc::new(Mutex::new(driver)));
                    return;
                }
                Err(err) => {
                    self.log.error(&format!("driver connect failed: {err}"));
                    let jitter = rand::thread_rng().gen_range(3..=10) as f64;
                    sleep_scaled(self.load_balance_factor, jitter);
                }
            }
        }
    }

    fn worker_context(&self, windows: bool) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            vm_name: self.config.vm_name.clone(),
            driver: Arc::clone(self.driver.as_ref().expect("connected")),
            factory: Arc::clone(&self.factory),
            store: self.store.clone(),
            log: self.log.clone(),
            json_log: self.json_log.clone(),
            load_balance_factor: self.load_balance_factor,
            windows,
            transfer_root: self.app_config.logging.root_dir.clone(),
        })
    }

    fn dispatch_loop(&mut self, context: &Arc<WorkerContext>) -> Result<i32> {
        self.preload_files(context);

        loop {
            let events = self.get_events();

            let mut workers: Vec<JoinHandle<()>> = Vec::new();
            let (reboot_tx, reboot_rx) = mpsc::channel::<ScheduledItem>();

            for event in events {
                match event {
                    ScheduleEvent::ExperimentStartTimeSet(timestamp) => {
                        self.log.debug("PROCESSING EXPERIMENT START EVENT");
                        self.experiment_start_time = Some(timestamp);
                    }
                    ScheduleEvent::EmptySchedule => {
                        // No negative-time work at all: pass the barrier now.
                        self.log.debug("PROCESSING NO SCHEDULE EVENT");
                        self.current_time = 0;
                        self.set_current_time(0);
                        self.set_state("configured");
                    }
                    ScheduleEvent::NewItem(item) => {
                        self.log.debug("PROCESSING NEW ITEM EVENT");
                        if let Some(exit) =
                            self.dispatch_new_item(context, item, &reboot_tx, &mut workers)?
                        {
                            return Ok(exit);
                        }
                    }
                    ScheduleEvent::Transfer(item) => {
                        self.dispatch_transfer(context, item);
                    }
                    ScheduleEvent::Exit(code) => {
                        self.log.debug(&format!("Exiting: {code}"));
                        return Ok(code);
                    }
                }
            }

            for worker in workers {
                let _ = worker.join();
            }

            // All workers have joined, so the reboot channel is quiet.
            let reboots: Vec<ScheduledItem> = reboot_rx.try_iter().collect();
            if !reboots.is_empty() {
                self.log.debug("Reboot has been requested");
                reboot_vm(context);
                for item in reboots {
                    self.log.debug(&format!(
                        "Putting vm_resource back in event queue: {:?}",
                        item.entry.executable
                    ));
                    let priority = item.entry.start_time;
                    self.queue.push(priority, ScheduleEvent::NewItem(item));
                }
            }
        }
    }

    fn dispatch_new_item(
        &mut self,
        context: &Arc<WorkerContext>,
        mut item: ScheduledItem,
        reboot_tx: &Sender<ScheduledItem>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<Option<i32>> {
        {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            if let Err(err) = driver.create_paths(&mut item) {
                self.log.error(&format!("failed to derive entry paths: {err}"));
            }
        }

        let loaded = load_files_in_target(context, &mut item);
        if !loaded {
            self.log.error(&format!(
                "Unable to load files into the VM: {:?}",
                item.entry.executable
            ));
            // Helpers that push files opt out of failing the whole VM.
            if !item.entry.ignore_failure {
                self.set_state("FAILED");
                return Ok(Some(1));
            }
        }

        if item.entry.executable.is_none() {
            return Ok(None);
        }

        let start_time = item.entry.start_time;
        if start_time < 0 {
            // Rate limit thread creation by a small random delay.
            context.sleep(rand::thread_rng().gen_range(1..=5) as f64);
            let context = Arc::clone(context);
            let reboot_tx = reboot_tx.clone();
            workers.push(thread::spawn(move || {
                run_vm_resource(&context, item, Some(reboot_tx));
            }));
        } else {
            let Some(experiment_start) = self.experiment_start_time else {
                self.log.error(
                    "Processing positive time vm_resource but no experiment start time!",
                );
                return Ok(None);
            };
            let runtime = experiment_start as i64 + start_time;
            let delay = (runtime - unix_timestamp_seconds() as i64).max(0) as u64;
            self.log.debug(&format!(
                "The entry {:?} with start time {start_time} will start in {delay} seconds",
                item.entry.executable
            ));
            // Positive-time entries may run long; they are not joined.
            let context = Arc::clone(context);
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(delay));
                run_vm_resource(&context, item, None);
            });
        }
        Ok(None)
    }

    fn dispatch_transfer(&mut self, context: &Arc<WorkerContext>, item: ScheduledItem) {
        let start_time = item.entry.start_time;
        let delay = if start_time < 0 {
            0
        } else {
            let Some(experiment_start) = self.experiment_start_time else {
                self.log.error(
                    "Processing positive time file transfer but no experiment start time!",
                );
                return;
            };
            let runtime = experiment_start as i64 + start_time;
            (runtime - unix_timestamp_seconds() as i64).max(0) as u64
        };

        for spec in item.entry.data {
            let DataSpec::Transfer {
                location,
                interval,
                destination,
            } = spec
            else {
                continue;
            };
            let context = Arc::clone(context);
            thread::spawn(move || {
                if delay > 0 {
                    thread::sleep(Duration::from_secs(delay));
                }
                transfer_data(&context, &location, interval, destination.as_deref());
            });
        }
    }

    /// Drain all events whose adjusted start time has been reached, blocking
    /// while the queue is empty or only future events remain unreachable.
    fn get_events(&mut self) -> Vec<ScheduleEvent> {
        let queue = Arc::clone(&self.queue);
        let mut events: Vec<ScheduleEvent> = Vec::new();

        queue.wait_process(|pending| {
            if pending.is_empty() && events.is_empty() {
                // An exhausted all-negative schedule means configuration is
                // complete.
                if self.current_time < 0 && self.current_time > INITIAL_TIME {
                    self.current_time = 0;
                    self.set_current_time(0);
                    self.set_state("configured");
                }
                self.log.debug("Event queue is empty, WAITING");
                return None;
            }

            let mut time_updated = false;
            let mut keep: Vec<(i64, ScheduleEvent)> = Vec::new();
            let mut wait_for_start = false;

            for (start_time, event) in pending.drain(..) {
                if wait_for_start {
                    keep.push((start_time, event));
                    continue;
                }
                // Barrier and sentinel events bypass all time checks.
                if matches!(
                    event,
                    ScheduleEvent::ExperimentStartTimeSet(_) | ScheduleEvent::EmptySchedule
                ) {
                    events.push(event);
                    continue;
                }

                if !time_updated && start_time > self.current_time {
                    self.current_time = start_time;
                    time_updated = true;
                    self.set_current_time(start_time);
                }

                if start_time > self.current_time {
                    // Beyond the cursor: hand back what we have so far.
                    keep.push((start_time, event));
                    continue;
                }

                if start_time > 0 && self.experiment_start_time.is_none() {
                    // All negative-time work is done; publish readiness and
                    // wait for the barrier to release.
                    keep.push((start_time, event));
                    self.set_state("configured");
                    self.current_time = 0;
                    self.set_current_time(0);
                    wait_for_start = true;
                    continue;
                }

                events.push(event);
            }

            *pending = keep;
            if events.is_empty() {
                self.log.debug("WAITING FOR START TIME");
                None
            } else {
                Some(())
            }
        });

        events
    }

    /// Stage every already-queued entry into the guest before execution
    /// begins, minimizing after-boot disk alterations (Windows dislikes
    /// early writes especially).
    fn preload_files(&mut self, context: &Arc<WorkerContext>) {
        let queue = Arc::clone(&self.queue);
        queue.wait_process(|pending| {
            if pending.is_empty() {
                return None;
            }
            for (_, event) in pending.iter_mut() {
                let ScheduleEvent::NewItem(item) = event else {
                    continue;
                };
                {
                    let mut driver = context.driver.lock().expect("driver mutex poisoned");
                    if let Err(err) = driver.create_paths(item) {
                        context
                            .log
                            .error(&format!("error deriving paths during preload: {err}"));
                    }
                }
                load_files_in_target(context, item);

                if item.entry.executable.is_some() {
                    if let Some(paths) = item.paths.clone() {
                        if item.entry.data.is_empty() {
                            context.log.info("creating directory since no file data");
                            ensure_directories(context, &paths.working_dir);
                        }
                        loop {
                            let written = {
                                let mut driver =
                                    context.driver.lock().expect("driver mutex poisoned");
                                driver
                                    .write(
                                        &paths.call_script,
                                        &paths.call_arguments,
                                        WriteMode::Write,
                                    )
                                    .unwrap_or(false)
                            };
                            if written {
                                break;
                            }
                            context.log.error("WRITE FAILED WHEN WRITING CALL ARGS");
                            context.reconnect();
                        }
                        loop {
                            let done = {
                                let mut driver =
                                    context.driver.lock().expect("driver mutex poisoned");
                                driver.make_file_executable(&paths.call_script)
                            };
                            match done {
                                Ok(Some(_)) => break,
                                _ => context.reconnect(),
                            }
                        }
                    }
                }
                item.preloaded = true;
            }
            Some(())
        });
        self.log.info("Done preloading files");
    }

    fn set_state(&mut self, state: &str) {
        if self.state.as_deref() == Some(state) {
            return;
        }
        self.log.debug(&format!("SETTING STATE: {state}"));
        let outcome = self
            .coordination
            .set_vm_state(&self.config.vm_uuid, state)
            .or_else(|err| {
                if matches!(err, Error::OutOfRange { .. }) {
                    // First contact: the launcher has not registered us yet.
                    self.coordination.set_vm_mapping(VmMapping {
                        server_uuid: self.config.vm_uuid.clone(),
                        server_name: self.config.vm_name.clone(),
                        control_ip: self.config.control_ip.clone(),
                        state: state.to_string(),
                        current_time: 0,
                    })
                } else {
                    Err(err)
                }
            });
        match outcome {
            Ok(()) => self.state = Some(state.to_string()),
            Err(err) => {
                self.log
                    .error(&format!("Error setting VM state to {state}: {err}"));
                return;
            }
        }

        // The last VM to configure elects the experiment start time.
        if state == "configured" && self.experiment_start_time.is_none() {
            match self.coordination.count_not_ready() {
                Ok(0) => {
                    self.log.debug("SETTING EXPERIMENT START TIME");
                    if let Err(err) = self.coordination.add_experiment_start_time() {
                        self.log
                            .error(&format!("Unable to set the start time: {err}"));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    self.log
                        .error(&format!("unable to count not-ready VMs: {err}"));
                }
            }
        }
    }

    fn set_current_time(&mut self, time: i64) {
        if let Err(err) = self.coordination.set_vm_time(&self.config.vm_uuid, time) {
            self.log
                .error(&format!("Error setting VM time to {time}: {err}"));
        }
    }
}

/// Create a guest directory, reconnecting until it succeeds.
fn ensure_directories(context: &WorkerContext, directory: &str) {
    loop {
        let created = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.create_directories(directory)
        };
        match created {
            Ok(Some(true)) => return,
            _ => {
                context
                    .log
                    .error("Unable to create directories while loading files into VM");
                context.reconnect();
            }
        }
    }
}

/// Stage an entry's data files and call script into the guest. Returns
/// whether everything required is in place.
fn load_files_in_target(context: &WorkerContext, item: &mut ScheduledItem) -> bool {
    if item.entry.data.is_empty() || item.reboot || item.preloaded {
        return true;
    }

    if let Some(paths) = &item.paths {
        ensure_directories(context, &paths.working_dir.clone());
    }

    let data = item.entry.data.clone();
    for spec in data {
        match spec {
            DataSpec::File {
                filename,
                location,
                executable,
            } => {
                let Some(target) = resolve_target(context, item, &location) else {
                    return false;
                };
                let Some(local_path) = fetch_with_retries(context, &filename) else {
                    context.log.error(&format!(
                        "Attempted {LOAD_ATTEMPTS} times to get file: {filename}"
                    ));
                    return false;
                };
                if !write_guest_file(context, &target, &local_path) {
                    return false;
                }
                if executable {
                    let mut driver = context.driver.lock().expect("driver mutex poisoned");
                    let _ = driver.make_file_executable(&target);
                }
            }
            DataSpec::Content {
                content,
                location,
                executable,
            } => {
                let Some(target) = resolve_target(context, item, &location) else {
                    return false;
                };
                let exists = {
                    let mut driver = context.driver.lock().expect("driver mutex poisoned");
                    driver.file_exists(&target).ok().flatten().unwrap_or(false)
                };
                if !exists {
                    let parent = parent_of(&target);
                    if let Some(parent) = parent {
                        let created = {
                            let mut driver =
                                context.driver.lock().expect("driver mutex poisoned");
                            let present =
                                driver.file_exists(&parent).ok().flatten().unwrap_or(false);
                            if present {
                                Some(true)
                            } else {
                                driver.create_directories(&parent).ok().flatten()
                            }
                        };
                        if created != Some(true) {
                            context
                                .log
                                .error(&format!("Unable to create directory: {parent}"));
                            return false;
                        }
                    }
                    let body = if context.windows {
                        content.replace('\n', "\r\n")
                    } else {
                        content.clone()
                    };
                    context.log.debug(&format!("Writing content to {target}"));
                    loop {
                        let written = {
                            let mut driver =
                                context.driver.lock().expect("driver mutex poisoned");
                            driver.write(&target, &body, WriteMode::Write).unwrap_or(false)
                        };
                        if written {
                            break;
                        }
                        context.log.error("UNABLE TO WRITE CONTENT");
                        context.reconnect();
                    }
                    if executable {
                        let mut driver = context.driver.lock().expect("driver mutex poisoned");
                        let _ = driver.make_file_executable(&target);
                    }
                }
            }
            _ => {
                context
                    .log
                    .error("Data entry for schedule entry is not a file or content");
                return false;
            }
        }
    }
    true
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rsplit_once('/')
        .map(|(parent, _)| {
            if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            }
        })
        .filter(|parent| parent != path)
}

fn resolve_target(
    context: &WorkerContext,
    item: &ScheduledItem,
    location: &str,
) -> Option<String> {
    if location.starts_with('/') {
        return Some(location.to_string());
    }
    if item.entry.executable.is_none() {
        context
            .log
            .error("Files require absolute paths unless they are for a vm_resource");
        return None;
    }
    let paths = item.paths.as_ref()?;
    Some(format!("{}/{location}", paths.working_dir))
}

fn fetch_with_retries(context: &WorkerContext, filename: &str) -> Option<PathBuf> {
    let store = context.store.as_ref()?;
    let mut attempts = 1;
    while attempts < LOAD_ATTEMPTS {
        match store.get_path(filename) {
            Ok(path) => return Some(path),
            Err(err) => {
                context
                    .log
                    .error(&format!("Unable to get file: {filename} ({err})"));
                attempts += 1;
                context.sleep(2.0);
            }
        }
    }
    None
}

fn write_guest_file(context: &WorkerContext, target: &str, local: &Path) -> bool {
    let mut attempts = 1;
    while attempts < LOAD_ATTEMPTS {
        let exists = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.file_exists(target)
        };
        match exists {
            Ok(Some(true)) => return true,
            Ok(_) => {
                context
                    .log
                    .debug(&format!("Writing file from: {} to {target}", local.display()));
                let written = {
                    let mut driver = context.driver.lock().expect("driver mutex poisoned");
                    driver.write_from_file(target, local)
                };
                match written {
                    Ok(true) => return true,
                    Ok(false) => {
                        context.log.error("UNABLE TO WRITE FILE");
                    }
                    Err(err) => {
                        context.log.error(&format!(
                            "Unable to reach the driver, reconnecting: {err}"
                        ));
                        attempts += 1;
                        context.sleep(2.0);
                        context.reconnect();
                    }
                }
            }
            Err(err) => {
                context
                    .log
                    .error(&format!("Unable to reach the driver, reconnecting: {err}"));
                attempts += 1;
                context.sleep(2.0);
                context.reconnect();
            }
        }
    }
    false
}

/// Execute one schedule entry in the guest, streaming output and collecting
/// reboot requests.
fn run_vm_resource(
    context: &WorkerContext,
    mut item: ScheduledItem,
    reboot_tx: Option<Sender<ScheduledItem>>,
) {
    let Some(paths) = item.paths.clone() else {
        context.log.error("entry reached execution without derived paths");
        return;
    };

    if !item.reboot {
        if item.entry.data.is_empty() && !item.preloaded {
            // No data means the working directory was never created.
            context.log.info("FILES NOT PRELOADED, CREATING DIRS");
            ensure_directories(context, &paths.working_dir);
        }
        if !item.preloaded {
            context.log.info("FILES NOT PRELOADED, WRITING CALL ARGS");
            loop {
                let written = {
                    let mut driver = context.driver.lock().expect("driver mutex poisoned");
                    driver
                        .write(&paths.call_script, &paths.call_arguments, WriteMode::Write)
                        .unwrap_or(false)
                };
                if written {
                    break;
                }
                context.log.error("WRITE FAILED WHEN WRITING CALL ARGS");
                context.sleep(1.0);
            }
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            let _ = driver.make_file_executable(&paths.call_script);
        }
    } else {
        // Re-run after a reboot: clear the flag and the sentinel file.
        item.reboot = false;
        loop {
            let deleted = {
                let mut driver = context.driver.lock().expect("driver mutex poisoned");
                driver.delete_file(&paths.reboot_file)
            };
            match deleted {
                Ok(Some(true)) => break,
                Ok(Some(false)) | Ok(None) => {
                    context.log.error("Unable to delete reboot file");
                    context.reconnect();
                }
                Err(_) => context.reconnect(),
            }
        }
    }

    let executable = item.entry.executable.clone().unwrap_or_default();
    let exitcode = loop {
        let started = Instant::now();
        context
            .log
            .info(&format!("CALL ARGS: {}", paths.call_script));
        let pid = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver
                .exec(&paths.call_script, &[], &[], None, true)
                .unwrap_or(None)
        };
        let Some(pid) = pid else {
            context.log.info("No PID, resetting driver");
            context.reconnect();
            continue;
        };
        context.log.info(&format!("PID returned: {pid}"));

        let mut exitcode = None;
        let mut transport_failed = false;
        while exitcode.is_none() {
            print_output(context, &executable, pid);
            context.sleep(2.0);
            let polled = {
                let mut driver = context.driver.lock().expect("driver mutex poisoned");
                driver.get_exitcode(pid)
            };
            match polled {
                Ok(code) => exitcode = code,
                Err(err) => {
                    context.log.error(&format!(
                        "FAILED: Unable to get exitcode of running process; \
                         retry command ({err})"
                    ));
                    transport_failed = true;
                    break;
                }
            }
        }
        if transport_failed {
            context.reconnect();
            continue;
        }
        let exitcode = exitcode.expect("loop exits with a code");
        let elapsed = started.elapsed().as_secs_f64();
        if exitcode != 0 {
            context.log.warning(&format!(
                "{executable} ({pid}) exited after {elapsed:.5} seconds with code: {exitcode}"
            ));
        } else {
            context.log.debug(&format!(
                "{executable} ({pid}) exited after {elapsed:.5} seconds with code: {exitcode}"
            ));
        }

        // Powershell dying within two seconds is almost always a stillborn
        // session rather than a real run.
        if executable.to_lowercase().contains("powershell") && elapsed < 2.0 {
            context
                .log
                .error("Powershell took less than two seconds, retrying");
            context.sleep(5.0);
            continue;
        }

        print_output(context, &executable, pid);
        break exitcode;
    };

    let need_reboot = if exitcode == REBOOT_EXIT_CODE {
        context.log.info("Rebooting based on exit code");
        true
    } else {
        check_for_reboot(context, &paths.reboot_file)
    };

    if need_reboot {
        item.reboot = true;
        match reboot_tx {
            Some(tx) => {
                let _ = tx.send(item);
            }
            None => context.log.error(
                "Can not handle reboots since the queue was not passed to the \
                 vm_resource runner",
            ),
        }
    }
}

fn check_for_reboot(context: &WorkerContext, reboot_file: &str) -> bool {
    loop {
        let checked = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.file_exists(reboot_file)
        };
        match checked {
            Ok(Some(need_reboot)) => return need_reboot,
            _ => {
                context
                    .log
                    .error("Unable to check existence of the reboot file");
                context.reconnect();
                context.sleep(1.0);
            }
        }
    }
}

fn print_output(context: &WorkerContext, executable: &str, pid: i64) {
    let (stdout, stderr) = {
        let mut driver = context.driver.lock().expect("driver mutex poisoned");
        (
            driver.take_stdout(pid).unwrap_or(None),
            driver.take_stderr(pid).unwrap_or(None),
        )
    };
    for (stream, name) in [(stdout, "stdout"), (stderr, "stderr")] {
        let Some(output) = stream else {
            continue;
        };
        context.log.info(&output);
        context.json_log.record(json!({
            "name": executable,
            "pid": pid,
            "fd": name,
        }));
        context.json_log.record_output(&output);
    }
}

/// Reboot the guest and wait until the driver can reach it again.
fn reboot_vm(context: &WorkerContext) {
    context.log.debug("Rebooting");
    let outcome = {
        let mut driver = context.driver.lock().expect("driver mutex poisoned");
        driver.reboot()
    };
    if let Err(err) = outcome {
        context.log.error(&format!("reboot command failed: {err}"));
        let sleep = rand::thread_rng().gen_range(25..=45) as f64;
        context.sleep(sleep);
    }
    if context.windows {
        // Reconnecting to Windows too soon after a reboot request wedges the
        // agent.
        let sleep = rand::thread_rng().gen_range(25..=45) as f64;
        context.log.info(&format!("Windows sleep: {sleep} seconds"));
        context.sleep(sleep);
    }
    context.reconnect();
}

/// Pull files from the guest, widening permissions so operators can read
/// them without root, optionally repeating on an interval.
fn transfer_data(
    context: &WorkerContext,
    location: &str,
    interval: Option<u64>,
    destination: Option<&str>,
) {
    let destination_root = match destination {
        Some(destination) => PathBuf::from(destination),
        None => context.transfer_root.join("transfers"),
    };
    let local_root = destination_root.join(&context.vm_name);

    if !location.starts_with('/') && !(context.windows && location.get(1..2) == Some(":")) {
        context.log.error(&format!(
            "Transfer paths must be absolute! Cannot transfer: {location}"
        ));
        return;
    }

    let mut local_time: Option<i64> = None;
    loop {
        let exists = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.file_exists(location)
        };
        let exists = match exists {
            Ok(Some(exists)) => exists,
            _ => {
                let Some(interval) = interval else {
                    return;
                };
                context.log.debug(&format!(
                    "An error occurred checking if {location} exists; reconnecting \
                     and retrying in {interval} seconds"
                ));
                context.reconnect();
                thread::sleep(Duration::from_secs(interval));
                continue;
            }
        };

        if !exists {
            let Some(interval) = interval else {
                return;
            };
            context.log.debug(&format!(
                "The file {location} was not found, sleeping for {interval} seconds"
            ));
            thread::sleep(Duration::from_secs(interval));
            continue;
        }

        let filenames = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.get_files(location, local_time)
        };
        let Ok(Some(filenames)) = filenames else {
            context
                .log
                .error(&format!("Unable to list files at location: {location}"));
            return;
        };
        if !filenames.is_empty() {
            context.log.debug(&format!("Getting files: {filenames:?}"));
        }

        for filename in filenames {
            let relative = if context.windows {
                filename.replace('\\', "/").replace(':', "")
            } else {
                filename.trim_start_matches('/').to_string()
            };
            let local_path = local_root.join(relative);
            let pulled = {
                let mut driver = context.driver.lock().expect("driver mutex poisoned");
                driver.read_file(&filename, &local_path)
            };
            if !matches!(pulled, Ok(true)) || !local_path.exists() {
                continue;
            }
            widen_permissions(context, &local_path, &destination_root);
        }

        let Some(interval) = interval else {
            return;
        };
        // Only newer files are pulled on the next round.
        local_time = {
            let mut driver = context.driver.lock().expect("driver mutex poisoned");
            driver.get_time().ok()
        };
        thread::sleep(Duration::from_secs(interval));
    }
}

/// Relax permissions on a pulled file and its parents up to the transfer
/// root so non-root operators can read them.
fn widen_permissions(context: &WorkerContext, file: &Path, stop_at: &Path) {
    let mut touched = file.to_path_buf();
    loop {
        let mode = if touched.is_dir() { 0o777 } else { 0o666 };
        if let Err(err) =
            std::fs::set_permissions(&touched, std::fs::Permissions::from_mode(mode))
        {
            context.log.debug(&format!(
                "could not change permissions for {}: {err}",
                touched.display()
            ));
        }
        let Some(parent) = touched.parent() else {
            return;
        };
        if parent == stop_at || parent == Path::new("/") {
            return;
        }
        touched = parent.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_config_parses_argv_json() {
        let raw = "{\"vm_name\": \"vm-0\", \"vm_uuid\": \"abc-123\", \
                   \"engine\": \"QemuVM\", \"path\": \"/tmp/qga.sock\"}";
        let config = SupervisorConfig::from_json(raw).expect("parse");
        assert_eq!(config.vm_name, "vm-0");
        assert_eq!(config.vm_uuid, "abc-123");
        assert_eq!(config.engine, "QemuVM");
        assert_eq!(config.path, PathBuf::from("/tmp/qga.sock"));
        assert_eq!(config.vcpu_commit, 0);
    }

    #[test]
    fn malformed_supervisor_config_is_rejected() {
        assert!(SupervisorConfig::from_json("{\"vm_name\": \"x\"}").is_err());
    }

    #[test]
    fn parent_paths_resolve() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(parent_of("/a"), Some("/".to_string()));
        assert_eq!(parent_of("relative"), None);
    }
}
