use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::logs::{unix_timestamp_seconds, LogSink};
use crate::core::schedule::ScheduleEntry;
use crate::error::{Error, Result};

/// Upper bound on a single request or response frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Logical databases served by one coordination process.
pub const DATABASES: [&str; 2] = ["prod", "test"];

/// States in which a VM does not count against the readiness barrier.
pub const READY_STATES: [&str; 2] = ["N/A", "configured"];

/// Registry record for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMapping {
    pub server_uuid: String,
    pub server_name: String,
    #[serde(default)]
    pub control_ip: Option<String>,
    pub state: String,
    #[serde(default)]
    pub current_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    db: String,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
enum Request {
    GetInfo,
    SetVmMapping { mapping: VmMapping },
    SetVmStateByUuid { server_uuid: String, state: String },
    SetVmTimeByUuid { server_uuid: String, current_time: i64 },
    GetVmMappingByUuid { server_uuid: String },
    ListVmMappings,
    CountVmMappingsNotReady,
    DestroyVmMappingByUuid { server_uuid: String },
    DestroyAllVmMappings,
    SetExperimentLaunchTime { timestamp: u64 },
    GetExperimentLaunchTime,
    SetExperimentStartTime { timestamp: u64 },
    GetExperimentStartTime,
    InitializeExperimentStartTime,
    PutSchedule { name: String, entries: Vec<ScheduleEntry> },
    GetSchedule { name: String },
    ExtendSchedule { name: String, entries: Vec<ScheduleEntry> },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
enum Response {
    Ok,
    Info {
        version: String,
        uptime_seconds: u64,
        experiment_running: bool,
    },
    Mapping {
        mapping: VmMapping,
    },
    Count {
        count: usize,
    },
    /// Header for a streamed listing: `count` mapping frames follow.
    Listing {
        count: usize,
    },
    Time {
        timestamp: u64,
    },
    Schedule {
        entries: Vec<ScheduleEntry>,
    },
    Error {
        code: ErrorCode,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ErrorCode {
    OutOfRange,
    Internal,
}

/// In-memory state of one logical database.
#[derive(Debug, Default)]
pub struct Db {
    vm_mappings: BTreeMap<String, VmMapping>,
    not_ready_vmms: BTreeSet<String>,
    /// Only the first submitted start time is ever served.
    experiment_start_times: Vec<u64>,
    experiment_launch_time: Option<u64>,
    schedules: BTreeMap<String, Vec<ScheduleEntry>>,
}

impl Db {
    fn update_not_ready(&mut self, uuid: &str, state: &str) {
        if READY_STATES.contains(&state) {
            self.not_ready_vmms.remove(uuid);
        } else {
            self.not_ready_vmms.insert(uuid.to_string());
        }
    }

    pub fn set_mapping(&mut self, mapping: VmMapping) -> VmMapping {
        self.update_not_ready(&mapping.server_uuid, &mapping.state);
        self.vm_mappings
            .insert(mapping.server_uuid.clone(), mapping.clone());
        mapping
    }

    pub fn set_state(&mut self, uuid: &str, state: &str) -> Option<VmMapping> {
        if !self.vm_mappings.contains_key(uuid) {
            return None;
        }
        self.update_not_ready(uuid, state);
        let mapping = self.vm_mappings.get_mut(uuid)?;
        mapping.state = state.to_string();
        Some(mapping.clone())
    }

    pub fn set_time(&mut self, uuid: &str, current_time: i64) -> Option<VmMapping> {
        let mapping = self.vm_mappings.get_mut(uuid)?;
        mapping.current_time = current_time;
        Some(mapping.clone())
    }

    pub fn not_ready_count(&self) -> usize {
        self.not_ready_vmms.len()
    }

    pub fn destroy(&mut self, uuid: &str) {
        self.not_ready_vmms.remove(uuid);
        self.vm_mappings.remove(uuid);
    }

    pub fn destroy_all(&mut self) {
        self.vm_mappings.clear();
        self.not_ready_vmms.clear();
    }

    pub fn set_start_time(&mut self, timestamp: u64) -> u64 {
        self.experiment_start_times.push(timestamp);
        self.experiment_start_times[0]
    }

    pub fn start_time(&self) -> Option<u64> {
        self.experiment_start_times.first().copied()
    }

    pub fn initialize_start_time(&mut self) {
        self.experiment_launch_time = None;
        self.experiment_start_times.clear();
    }
}

/// Runtime options for the coordination server process.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub hostname: String,
    pub port: u16,
    pub pidfile: PathBuf,
    pub logfile: PathBuf,
}

struct PidfileGuard {
    path: PathBuf,
}

impl Drop for PidfileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Run the coordination service until the process is terminated.
pub fn serve(options: &ServerOptions, log: LogSink) -> Result<()> {
    for parent in [options.pidfile.parent(), options.logfile.parent()]
        .into_iter()
        .flatten()
    {
        fs::create_dir_all(parent).map_err(|err| Error::PreflightFailed {
            message: format!(
                "Failed to prepare server directory {}: {err}",
                parent.display()
            ),
        })?;
    }

    let listener = TcpListener::bind((options.hostname.as_str(), options.port)).map_err(|err| {
        Error::PreflightFailed {
            message: format!(
                "Coordination server failed to bind {}:{}: {err}. \
                 Another server may be bound to that address.",
                options.hostname, options.port
            ),
        }
    })?;

    fs::write(&options.pidfile, format!("{}\n", std::process::id())).map_err(|err| {
        Error::PreflightFailed {
            message: format!(
                "Failed to write server pidfile {}: {err}",
                options.pidfile.display()
            ),
        }
    })?;
    let _guard = PidfileGuard {
        path: options.pidfile.clone(),
    };

    let mut dbs: HashMap<String, Arc<Mutex<Db>>> = HashMap::new();
    for name in DATABASES {
        dbs.insert(name.to_string(), Arc::new(Mutex::new(Db::default())));
    }
    let dbs = Arc::new(dbs);
    let started = Instant::now();

    log.info(&format!(
        "listening on {}:{}",
        options.hostname, options.port
    ));

    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                log.debug(&format!("connection from {addr}"));
                let dbs = Arc::clone(&dbs);
                let log = log.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &dbs, started, &log) {
                        log.debug(&format!("connection from {addr} ended: {err}"));
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log.error(&format!("accept failed: {err}"));
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    dbs: &HashMap<String, Arc<Mutex<Db>>>,
    started: Instant,
    log: &LogSink,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(MAX_FRAME_SIZE as u64)
            .read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: RequestEnvelope = match serde_json::from_str(trimmed) {
            Ok(envelope) => envelope,
            Err(err) => {
                write_frame(
                    &mut writer,
                    &Response::Error {
                        code: ErrorCode::Internal,
                        detail: format!("malformed request: {err}"),
                    },
                )?;
                continue;
            }
        };

        let Some(db_handle) = dbs.get(&envelope.db) else {
            write_frame(
                &mut writer,
                &Response::Error {
                    code: ErrorCode::OutOfRange,
                    detail: format!("unknown database `{}`", envelope.db),
                },
            )?;
            continue;
        };

        // GetInfo reads the production database regardless of the request's
        // db, so it must not run while holding the request db's lock.
        if matches!(envelope.request, Request::GetInfo) {
            let experiment_running = dbs
                .get("prod")
                .map(|handle| {
                    handle
                        .lock()
                        .expect("db mutex poisoned")
                        .experiment_launch_time
                        .is_some()
                })
                .unwrap_or(false);
            write_frame(
                &mut writer,
                &Response::Info {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_seconds: started.elapsed().as_secs(),
                    experiment_running,
                },
            )?;
            continue;
        }

        // ListVMMappings streams a snapshot taken under the lock but
        // serialized outside it; everything else answers in one frame.
        if matches!(envelope.request, Request::ListVmMappings) {
            let snapshot: Vec<VmMapping> = {
                let db = db_handle.lock().expect("db mutex poisoned");
                db.vm_mappings.values().cloned().collect()
            };
            write_frame(
                &mut writer,
                &Response::Listing {
                    count: snapshot.len(),
                },
            )?;
            for mapping in snapshot {
                write_frame(&mut writer, &Response::Mapping { mapping })?;
            }
            continue;
        }

        let response = {
            let mut db = db_handle.lock().expect("db mutex poisoned");
            dispatch(&envelope.request, &mut db, log)
        };
        write_frame(&mut writer, &response)?;
    }
}

fn dispatch(request: &Request, db: &mut Db, log: &LogSink) -> Response {
    match request {
        Request::GetInfo => unreachable!("handled before the db lock is taken"),
        Request::SetVmMapping { mapping } => Response::Mapping {
            mapping: db.set_mapping(mapping.clone()),
        },
        Request::SetVmStateByUuid { server_uuid, state } => {
            match db.set_state(server_uuid, state) {
                Some(mapping) => Response::Mapping { mapping },
                None => Response::Error {
                    code: ErrorCode::OutOfRange,
                    detail: format!("No vm_mapping found for {server_uuid}"),
                },
            }
        }
        Request::SetVmTimeByUuid {
            server_uuid,
            current_time,
        } => match db.set_time(server_uuid, *current_time) {
            Some(mapping) => Response::Mapping { mapping },
            None => Response::Error {
                code: ErrorCode::Internal,
                detail: format!("No vm_mapping found for {server_uuid}"),
            },
        },
        Request::GetVmMappingByUuid { server_uuid } => {
            match db.vm_mappings.get(server_uuid) {
                Some(mapping) => Response::Mapping {
                    mapping: mapping.clone(),
                },
                None => Response::Error {
                    code: ErrorCode::OutOfRange,
                    detail: format!("No vm_mapping found for {server_uuid}"),
                },
            }
        }
        Request::ListVmMappings => unreachable!("handled by the streaming path"),
        Request::CountVmMappingsNotReady => Response::Count {
            count: db.not_ready_count(),
        },
        Request::DestroyVmMappingByUuid { server_uuid } => {
            db.destroy(server_uuid);
            Response::Ok
        }
        Request::DestroyAllVmMappings => {
            db.destroy_all();
            Response::Ok
        }
        Request::SetExperimentLaunchTime { timestamp } => {
            db.experiment_launch_time = Some(*timestamp);
            Response::Time {
                timestamp: *timestamp,
            }
        }
        Request::GetExperimentLaunchTime => match db.experiment_launch_time {
            Some(timestamp) => Response::Time { timestamp },
            None => Response::Error {
                code: ErrorCode::OutOfRange,
                detail: "No launch time available yet.".to_string(),
            },
        },
        Request::SetExperimentStartTime { timestamp } => Response::Time {
            timestamp: db.set_start_time(*timestamp),
        },
        Request::GetExperimentStartTime => match db.start_time() {
            Some(timestamp) => Response::Time { timestamp },
            None => Response::Error {
                code: ErrorCode::OutOfRange,
                detail: "No start time available yet.".to_string(),
            },
        },
        Request::InitializeExperimentStartTime => {
            db.initialize_start_time();
            Response::Ok
        }
        Request::PutSchedule { name, entries } => {
            log.debug(&format!(
                "schedule put for {name}: {} entries",
                entries.len()
            ));
            db.schedules.insert(name.clone(), entries.clone());
            Response::Ok
        }
        Request::GetSchedule { name } => Response::Schedule {
            entries: db.schedules.get(name).cloned().unwrap_or_default(),
        },
        Request::ExtendSchedule { name, entries } => {
            db.schedules
                .entry(name.clone())
                .or_default()
                .extend(entries.iter().cloned());
            Response::Ok
        }
    }
}

fn write_frame(writer: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload)?;
    writer.flush()
}

/// Client side of the coordination protocol. One connection, requests
/// serialized by caller threads through a mutex.
pub struct CoordinationClient {
    stream: Mutex<ClientStream>,
    db: String,
    address: String,
}

struct ClientStream {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl CoordinationClient {
    /// Connect to `hostname:port` and address the named logical database.
    pub fn connect(hostname: &str, port: u16, db: &str) -> Result<CoordinationClient> {
        let address = format!("{hostname}:{port}");
        let stream = TcpStream::connect((hostname, port)).map_err(|err| Error::Transport {
            peer: address.clone(),
            message: err.to_string(),
        })?;
        stream
            .set_read_timeout(Some(Duration::from_secs(60)))
            .map_err(|err| Error::Transport {
                peer: address.clone(),
                message: err.to_string(),
            })?;
        let reader = BufReader::new(stream.try_clone().map_err(|err| Error::Transport {
            peer: address.clone(),
            message: err.to_string(),
        })?);
        Ok(CoordinationClient {
            stream: Mutex::new(ClientStream {
                reader,
                writer: stream,
            }),
            db: db.to_string(),
            address,
        })
    }

    fn transport_error(&self, err: impl std::fmt::Display) -> Error {
        Error::Transport {
            peer: self.address.clone(),
            message: err.to_string(),
        }
    }

    fn roundtrip(&self, request: Request) -> Result<Response> {
        let envelope = RequestEnvelope {
            db: self.db.clone(),
            request,
        };
        let mut payload = serde_json::to_vec(&envelope).map_err(|err| self.transport_error(err))?;
        payload.push(b'\n');

        let mut stream = self.stream.lock().expect("client stream poisoned");
        stream
            .writer
            .write_all(&payload)
            .map_err(|err| self.transport_error(err))?;
        stream.writer.flush().map_err(|err| self.transport_error(err))?;
        Self::read_response(&mut stream, &self.address)
    }

    fn read_response(stream: &mut ClientStream, address: &str) -> Result<Response> {
        let mut line = String::new();
        let read = stream
            .reader
            .read_line(&mut line)
            .map_err(|err| Error::Transport {
                peer: address.to_string(),
                message: err.to_string(),
            })?;
        if read == 0 {
            return Err(Error::Transport {
                peer: address.to_string(),
                message: "server closed the connection".to_string(),
            });
        }
        serde_json::from_str(line.trim()).map_err(|err| Error::Transport {
            peer: address.to_string(),
            message: format!("malformed response: {err}"),
        })
    }

    fn expect_ok(&self, response: Response) -> Result<()> {
        match response {
            Response::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    fn unexpected(&self, response: Response) -> Error {
        match response {
            Response::Error {
                code: ErrorCode::OutOfRange,
                detail,
            } => Error::OutOfRange { detail },
            Response::Error {
                code: ErrorCode::Internal,
                detail,
            } => Error::Internal { detail },
            other => Error::Internal {
                detail: format!("unexpected response: {other:?}"),
            },
        }
    }

    pub fn get_info(&self) -> Result<(String, u64, bool)> {
        match self.roundtrip(Request::GetInfo)? {
            Response::Info {
                version,
                uptime_seconds,
                experiment_running,
            } => Ok((version, uptime_seconds, experiment_running)),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn set_vm_mapping(&self, mapping: VmMapping) -> Result<VmMapping> {
        match self.roundtrip(Request::SetVmMapping { mapping })? {
            Response::Mapping { mapping } => Ok(mapping),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn set_vm_state_by_uuid(&self, uuid: &str, state: &str) -> Result<VmMapping> {
        match self.roundtrip(Request::SetVmStateByUuid {
            server_uuid: uuid.to_string(),
            state: state.to_string(),
        })? {
            Response::Mapping { mapping } => Ok(mapping),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn set_vm_time_by_uuid(&self, uuid: &str, current_time: i64) -> Result<VmMapping> {
        match self.roundtrip(Request::SetVmTimeByUuid {
            server_uuid: uuid.to_string(),
            current_time,
        })? {
            Response::Mapping { mapping } => Ok(mapping),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn get_vm_mapping_by_uuid(&self, uuid: &str) -> Result<VmMapping> {
        match self.roundtrip(Request::GetVmMappingByUuid {
            server_uuid: uuid.to_string(),
        })? {
            Response::Mapping { mapping } => Ok(mapping),
            other => Err(self.unexpected(other)),
        }
    }

    /// Collect the streamed listing into a vector.
    pub fn list_vm_mappings(&self) -> Result<Vec<VmMapping>> {
        let mut stream = self.stream.lock().expect("client stream poisoned");
        let envelope = RequestEnvelope {
            db: self.db.clone(),
            request: Request::ListVmMappings,
        };
        let mut payload = serde_json::to_vec(&envelope).map_err(|err| self.transport_error(err))?;
        payload.push(b'\n');
        stream
            .writer
            .write_all(&payload)
            .map_err(|err| self.transport_error(err))?;

        let count = match Self::read_response(&mut stream, &self.address)? {
            Response::Listing { count } => count,
            other => {
                drop(stream);
                return Err(self.unexpected(other));
            }
        };
        let mut mappings = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::read_response(&mut stream, &self.address)? {
                Response::Mapping { mapping } => mappings.push(mapping),
                other => {
                    drop(stream);
                    return Err(self.unexpected(other));
                }
            }
        }
        Ok(mappings)
    }

    pub fn count_vm_mappings_not_ready(&self) -> Result<usize> {
        match self.roundtrip(Request::CountVmMappingsNotReady)? {
            Response::Count { count } => Ok(count),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn destroy_vm_mapping_by_uuid(&self, uuid: &str) -> Result<()> {
        let response = self.roundtrip(Request::DestroyVmMappingByUuid {
            server_uuid: uuid.to_string(),
        })?;
        self.expect_ok(response)
    }

    pub fn destroy_all_vm_mappings(&self) -> Result<()> {
        let response = self.roundtrip(Request::DestroyAllVmMappings)?;
        self.expect_ok(response)
    }

    pub fn set_experiment_launch_time(&self, timestamp: u64) -> Result<u64> {
        match self.roundtrip(Request::SetExperimentLaunchTime { timestamp })? {
            Response::Time { timestamp } => Ok(timestamp),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn get_experiment_launch_time(&self) -> Result<u64> {
        match self.roundtrip(Request::GetExperimentLaunchTime)? {
            Response::Time { timestamp } => Ok(timestamp),
            other => Err(self.unexpected(other)),
        }
    }

    /// Submit a start time; the first submission wins and is returned.
    pub fn set_experiment_start_time(&self, timestamp: u64) -> Result<u64> {
        match self.roundtrip(Request::SetExperimentStartTime { timestamp })? {
            Response::Time { timestamp } => Ok(timestamp),
            other => Err(self.unexpected(other)),
        }
    }

    /// Submit "now" as the start time.
    pub fn add_experiment_start_time(&self) -> Result<u64> {
        self.set_experiment_start_time(unix_timestamp_seconds())
    }

    pub fn get_experiment_start_time(&self) -> Result<u64> {
        match self.roundtrip(Request::GetExperimentStartTime)? {
            Response::Time { timestamp } => Ok(timestamp),
            other => Err(self.unexpected(other)),
        }
    }

    /// Start time if one has been elected, without treating absence as an
    /// error.
    pub fn try_experiment_start_time(&self) -> Result<Option<u64>> {
        match self.get_experiment_start_time() {
            Ok(timestamp) => Ok(Some(timestamp)),
            Err(Error::OutOfRange { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Seconds elapsed since the experiment start, or `None` before the
    /// start time exists or is reached.
    pub fn experiment_time_since_start(&self) -> Result<Option<u64>> {
        let Some(start) = self.try_experiment_start_time()? else {
            return Ok(None);
        };
        let now = unix_timestamp_seconds();
        Ok(now.checked_sub(start))
    }

    pub fn initialize_experiment_start_time(&self) -> Result<()> {
        let response = self.roundtrip(Request::InitializeExperimentStartTime)?;
        self.expect_ok(response)
    }

    pub fn put_schedule(&self, name: &str, entries: &[ScheduleEntry]) -> Result<()> {
        let response = self.roundtrip(Request::PutSchedule {
            name: name.to_string(),
            entries: entries.to_vec(),
        })?;
        self.expect_ok(response)
    }

    pub fn get_schedule(&self, name: &str) -> Result<Vec<ScheduleEntry>> {
        match self.roundtrip(Request::GetSchedule {
            name: name.to_string(),
        })? {
            Response::Schedule { entries } => Ok(entries),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn extend_schedule(&self, name: &str, entries: &[ScheduleEntry]) -> Result<()> {
        let response = self.roundtrip(Request::ExtendSchedule {
            name: name.to_string(),
            entries: entries.to_vec(),
        })?;
        self.expect_ok(response)
    }
}

/// The coordination operations the supervisor stack depends on, kept narrow
/// so tests can run against an in-process implementation.
pub trait Coordination: Send + Sync {
    fn set_vm_mapping(&self, mapping: VmMapping) -> Result<()>;
    fn set_vm_state(&self, uuid: &str, state: &str) -> Result<()>;
    fn set_vm_time(&self, uuid: &str, current_time: i64) -> Result<()>;
    fn count_not_ready(&self) -> Result<usize>;
    fn add_experiment_start_time(&self) -> Result<u64>;
    fn try_experiment_start_time(&self) -> Result<Option<u64>>;
    fn experiment_time_since_start(&self) -> Result<Option<u64>>;
}

impl Coordination for CoordinationClient {
    fn set_vm_mapping(&self, mapping: VmMapping) -> Result<()> {
        CoordinationClient::set_vm_mapping(self, mapping).map(|_| ())
    }

    fn set_vm_state(&self, uuid: &str, state: &str) -> Result<()> {
        self.set_vm_state_by_uuid(uuid, state).map(|_| ())
    }

    fn set_vm_time(&self, uuid: &str, current_time: i64) -> Result<()> {
        self.set_vm_time_by_uuid(uuid, current_time).map(|_| ())
    }

    fn count_not_ready(&self) -> Result<usize> {
        self.count_vm_mappings_not_ready()
    }

    fn add_experiment_start_time(&self) -> Result<u64> {
        CoordinationClient::add_experiment_start_time(self)
    }

    fn try_experiment_start_time(&self) -> Result<Option<u64>> {
        CoordinationClient::try_experiment_start_time(self)
    }

    fn experiment_time_since_start(&self) -> Result<Option<u64>> {
        CoordinationClient::experiment_time_since_start(self)
    }
}

/// In-process coordination state with the same barrier semantics as the
/// server, for tests and single-host dry runs.
#[derive(Default)]
pub struct MemoryCoordination {
    db: Mutex<Db>,
}

impl MemoryCoordination {
    pub fn new() -> MemoryCoordination {
        MemoryCoordination::default()
    }

    pub fn start_time(&self) -> Option<u64> {
        self.db.lock().expect("db poisoned").start_time()
    }

    pub fn mapping(&self, uuid: &str) -> Option<VmMapping> {
        self.db
            .lock()
            .expect("db poisoned")
            .vm_mappings
            .get(uuid)
            .cloned()
    }
}

impl Coordination for MemoryCoordination {
    fn set_vm_mapping(&self, mapping: VmMapping) -> Result<()> {
        self.db.lock().expect("db poisoned").set_mapping(mapping);
        Ok(())
    }

    fn set_vm_state(&self, uuid: &str, state: &str) -> Result<()> {
        self.db
            .lock()
            .expect("db poisoned")
            .set_state(uuid, state)
            .map(|_| ())
            .ok_or_else(|| Error::OutOfRange {
                detail: format!("No vm_mapping found for {uuid}"),
            })
    }

    fn set_vm_time(&self, uuid: &str, current_time: i64) -> Result<()> {
        self.db
            .lock()
            .expect("db poisoned")
            .set_time(uuid, current_time)
            .map(|_| ())
            .ok_or_else(|| Error::Internal {
                detail: format!("No vm_mapping found for {uuid}"),
            })
    }

    fn count_not_ready(&self) -> Result<usize> {
        Ok(self.db.lock().expect("db poisoned").not_ready_count())
    }

    fn add_experiment_start_time(&self) -> Result<u64> {
        Ok(self
            .db
            .lock()
            .expect("db poisoned")
            .set_start_time(unix_timestamp_seconds()))
    }

    fn try_experiment_start_time(&self) -> Result<Option<u64>> {
        Ok(self.db.lock().expect("db poisoned").start_time())
    }

    fn experiment_time_since_start(&self) -> Result<Option<u64>> {
        let Some(start) = self.db.lock().expect("db poisoned").start_time() else {
            return Ok(None);
        };
        Ok(unix_timestamp_seconds().checked_sub(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(uuid: &str, state: &str) -> VmMapping {
        VmMapping {
            server_uuid: uuid.to_string(),
            server_name: format!("vm-{uuid}"),
            control_ip: None,
            state: state.to_string(),
            current_time: 0,
        }
    }

    #[test]
    fn readiness_tracks_state_transitions() {
        let mut db = Db::default();
        db.set_mapping(mapping("a", "uninitialized"));
        db.set_mapping(mapping("b", "configuring"));
        assert_eq!(db.not_ready_count(), 2);

        db.set_state("a", "configured").expect("known uuid");
        assert_eq!(db.not_ready_count(), 1);

        db.set_state("b", "configured").expect("known uuid");
        assert_eq!(db.not_ready_count(), 0);

        // A regression back out of a ready state re-enters the barrier.
        db.set_state("b", "FAILED").expect("known uuid");
        assert_eq!(db.not_ready_count(), 1);
    }

    #[test]
    fn unknown_uuid_state_change_is_rejected() {
        let mut db = Db::default();
        assert!(db.set_state("ghost", "configured").is_none());
        assert!(db.set_time("ghost", 5).is_none());
    }

    #[test]
    fn destroy_is_idempotent_for_unknown_uuids() {
        let mut db = Db::default();
        db.set_mapping(mapping("a", "configuring"));
        db.destroy("ghost");
        db.destroy("a");
        db.destroy("a");
        assert_eq!(db.not_ready_count(), 0);
        assert!(db.vm_mappings.is_empty());
    }

    #[test]
    fn start_time_is_first_wins_until_initialized() {
        let mut db = Db::default();
        assert_eq!(db.set_start_time(100), 100);
        assert_eq!(db.set_start_time(200), 100);
        assert_eq!(db.start_time(), Some(100));

        db.initialize_start_time();
        assert_eq!(db.start_time(), None);
        assert_eq!(db.set_start_time(300), 300);
    }

    #[test]
    fn ready_state_strings_match_barrier_rules() {
        let mut db = Db::default();
        db.set_mapping(mapping("a", "N/A"));
        assert_eq!(db.not_ready_count(), 0);
    }

    #[test]
    fn request_frames_round_trip() {
        let envelope = RequestEnvelope {
            db: "prod".to_string(),
            request: Request::SetVmStateByUuid {
                server_uuid: "abc".to_string(),
                state: "configured".to_string(),
            },
        };
        let encoded = serde_json::to_string(&envelope).expect("encode");
        assert!(encoded.contains("\"request\":\"set_vm_state_by_uuid\""));
        let decoded: RequestEnvelope = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.db, "prod");
        assert!(matches!(
            decoded.request,
            Request::SetVmStateByUuid { .. }
        ));
    }
}
