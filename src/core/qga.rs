use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use serde_json::{json, Value};

use crate::core::driver::{ExecStatus, GuestDriver, WriteMode, is_windows};
use crate::core::logs::LogSink;
use crate::error::{Error, Result};

/// Chunk size for host-to-guest file writes. Values between 100 KiB and
/// 1 MiB measure significantly faster than anything outside that range.
const WRITE_CHUNK_SIZE: usize = 1_024_000;

/// Attempts per chunk before a file write is abandoned.
const WRITE_CHUNK_ATTEMPTS: usize = 30;

/// Attempts to probe the guest OS before giving up.
const OS_PROBE_ATTEMPTS: usize = 120;

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const FILE_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the driver matching a VM's virtualization engine.
pub fn connect_driver(
    engine: &str,
    socket_path: &Path,
    windows_eof_heuristic: bool,
    log: LogSink,
) -> Result<Box<dyn GuestDriver>> {
    match engine {
        "QemuVM" => Ok(Box::new(QemuGuestAgentDriver::connect_new(
            socket_path,
            windows_eof_heuristic,
            log,
        )?)),
        other => Err(Error::SupervisorFailed {
            vm: socket_path.display().to_string(),
            message: format!("no driver available for engine `{other}`"),
        }),
    }
}

/// Driver for the QEMU Guest Agent reached over a virtio-serial socket.
pub struct QemuGuestAgentDriver {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
    log: LogSink,
    windows_eof_heuristic: bool,
    target_os: Option<String>,
    used_paths: BTreeSet<String>,
    output_cache: HashMap<i64, ExecStatus>,
}

impl QemuGuestAgentDriver {
    pub fn connect_new(
        socket_path: &Path,
        windows_eof_heuristic: bool,
        log: LogSink,
    ) -> Result<QemuGuestAgentDriver> {
        let mut driver = QemuGuestAgentDriver {
            socket_path: socket_path.to_path_buf(),
            stream: None,
            log,
            windows_eof_heuristic,
            target_os: None,
            used_paths: BTreeSet::new(),
            output_cache: HashMap::new(),
        };
        driver.connect()?;
        Ok(driver)
    }

    fn transport_error(&self, message: impl std::fmt::Display) -> Error {
        Error::Transport {
            peer: self.socket_path.display().to_string(),
            message: message.to_string(),
        }
    }

    fn open_stream(&mut self) -> Result<()> {
        self.log.debug(&format!(
            "Connecting to QGA on socket: {}",
            self.socket_path.display()
        ));
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|err| self.transport_error(err))?;
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    /// Issue one agent command and return its `return` value. Asynchronous
    /// event lines interleaved in the stream are skipped.
    fn command(
        &mut self,
        name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let socket = self.socket_path.display().to_string();
        let Some(reader) = self.stream.as_mut() else {
            return Err(Error::Transport {
                peer: socket,
                message: "not connected".to_string(),
            });
        };

        let mut request = json!({ "execute": name });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut payload = request.to_string();
        payload.push('\n');

        reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|err| Error::Transport {
                peer: socket.clone(),
                message: err.to_string(),
            })?;
        reader
            .get_mut()
            .write_all(payload.as_bytes())
            .map_err(|err| Error::Transport {
                peer: socket.clone(),
                message: err.to_string(),
            })?;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    return Err(Error::Transport {
                        peer: socket,
                        message: "agent closed the transport".to_string(),
                    });
                }
                Ok(_) => {}
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    let _ = reader.get_ref().set_read_timeout(None);
                    return Err(Error::Timeout {
                        operation: format!("QGA `{name}`"),
                        seconds: timeout.map(|t| t.as_secs()).unwrap_or(0),
                    });
                }
                Err(err) => {
                    return Err(Error::Transport {
                        peer: socket,
                        message: err.to_string(),
                    });
                }
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(frame) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            if let Some(result) = frame.get("return") {
                let _ = reader.get_ref().set_read_timeout(None);
                return Ok(result.clone());
            }
            if let Some(error) = frame.get("error") {
                let _ = reader.get_ref().set_read_timeout(None);
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown agent error");
                return Err(Error::Internal {
                    detail: format!("{name}: {desc}"),
                });
            }
            // Anything else is an asynchronous event; keep draining.
        }
    }

    fn store_captured_output(&mut self, pid: i64, output: &Value) {
        let cache = self.output_cache.entry(pid).or_default();
        if let Some(exited) = output.get("exited").and_then(Value::as_bool) {
            cache.exited = exited;
        }
        if let Some(exitcode) = output.get("exitcode").and_then(Value::as_i64) {
            cache.exitcode = Some(exitcode);
        }
        if let Some(signal) = output.get("signal").and_then(Value::as_i64) {
            cache.signal = Some(signal);
        }
        if let Some(data) = output.get("out-data").and_then(Value::as_str) {
            if let Ok(decoded) = BASE64.decode(data) {
                cache
                    .stdout
                    .get_or_insert_with(String::new)
                    .push_str(&String::from_utf8_lossy(&decoded));
            }
        }
        if output.get("out-truncated").and_then(Value::as_bool) == Some(true) {
            cache.stdout_trunc = true;
        }
        if let Some(data) = output.get("err-data").and_then(Value::as_str) {
            if let Ok(decoded) = BASE64.decode(data) {
                cache
                    .stderr
                    .get_or_insert_with(String::new)
                    .push_str(&String::from_utf8_lossy(&decoded));
            }
        }
        if output.get("err-truncated").and_then(Value::as_bool) == Some(true) {
            cache.stderr_trunc = true;
        }
    }

    fn file_open(&mut self, path: &str, mode: &str) -> Result<i64> {
        // Recovering from a timeout that lands between the open and the
        // handle delivery is painful, so the open runs without one.
        let handle = self.command("guest-file-open", Some(json!({"path": path, "mode": mode})), None)?;
        handle.as_i64().ok_or_else(|| Error::Internal {
            detail: "guest-file-open returned a non-integer handle".to_string(),
        })
    }

    fn file_close(&mut self, handle: i64) {
        let _ = self.command("guest-file-close", Some(json!({"handle": handle})), None);
    }

    fn file_write_chunk(&mut self, handle: i64, content: &[u8]) -> Result<()> {
        let encoded = BASE64.encode(content);
        let result = self.command(
            "guest-file-write",
            Some(json!({
                "handle": handle,
                "buf-b64": encoded,
                "count": content.len(),
            })),
            Some(FILE_WRITE_TIMEOUT),
        )?;
        let count = result
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Internal {
                detail: "file write returned no byte count".to_string(),
            })?;
        if count as usize != content.len() {
            return Err(Error::Internal {
                detail: format!(
                    "file write returned size {count} but {} bytes were sent",
                    content.len()
                ),
            });
        }
        Ok(())
    }
}

impl GuestDriver for QemuGuestAgentDriver {
    fn engine(&self) -> &'static str {
        "QemuVM"
    }

    fn connect(&mut self) -> Result<u32> {
        self.open_stream()?;
        match self.sync(DEFAULT_SYNC_TIMEOUT) {
            Ok(token) => {
                self.log.debug(&format!("Synced: {token}"));
                Ok(token)
            }
            Err(err) => {
                self.log.error("Error while syncing");
                self.close();
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn ping(&mut self, timeout: Duration) -> bool {
        match self.command("guest-ping", None, Some(timeout)) {
            Ok(_) => true,
            Err(_) => {
                // A dead transport is quietly discarded; callers reconnect.
                self.close();
                false
            }
        }
    }

    fn sync(&mut self, timeout: Duration) -> Result<u32> {
        if !self.ping(DEFAULT_PING_TIMEOUT) {
            return Err(self.transport_error("QEMU Guest Agent not alive yet"));
        }
        let token: u32 = rand::thread_rng().r#gen();
        let result = self.command("guest-sync", Some(json!({"id": token})), Some(timeout))?;
        match result.as_u64() {
            Some(echoed) if echoed == u64::from(token) => Ok(token),
            other => {
                self.log.warning(&format!(
                    "expected sync token {token} but received {other:?}"
                ));
                Err(self.transport_error("sync token mismatch"))
            }
        }
    }

    fn get_time(&mut self) -> Result<i64> {
        let nanos = self
            .command("guest-get-time", None, Some(STATUS_TIMEOUT))?
            .as_i64()
            .ok_or_else(|| Error::Internal {
                detail: "guest-get-time returned a non-integer".to_string(),
            })?;
        Ok(nanos / 1_000_000_000)
    }

    fn set_time(&mut self) -> Result<()> {
        let now_nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as i64)
            .unwrap_or(0);
        self.command("guest-set-time", Some(json!({"time": now_nanos})), None)?;
        Ok(())
    }

    fn reboot(&mut self) -> Result<()> {
        self.output_cache.clear();
        match self.command(
            "guest-shutdown",
            Some(json!({"mode": "reboot"})),
            Some(REBOOT_TIMEOUT),
        ) {
            // Shutdown does not answer; a timeout is the expected outcome.
            Ok(_) | Err(Error::Timeout { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn exec(
        &mut self,
        path: &str,
        args: &[String],
        env: &[String],
        input: Option<&str>,
        capture: bool,
    ) -> Result<Option<i64>> {
        let mut options = json!({
            "path": path,
            "capture-output": capture,
        });
        if !args.is_empty() {
            options["arg"] = json!(args);
        }
        if !env.is_empty() {
            for pair in env {
                if pair.splitn(2, '=').count() != 2 {
                    self.log.error(
                        "env entries must be KEY=VALUE pairs, e.g. [\"PATH=/bin\"]",
                    );
                    return Ok(None);
                }
            }
            options["env"] = json!(env);
        }
        if let Some(input) = input {
            options["input-data"] = json!(BASE64.encode(input.as_bytes()));
        }

        self.log.debug(&format!("Starting guest-exec for: {options}"));
        let result = match self.command("guest-exec", Some(options), Some(STATUS_TIMEOUT)) {
            Ok(result) => result,
            Err(err) => {
                self.log.error(&format!("Unable to call guest-exec: {err}"));
                return Ok(None);
            }
        };
        match result.get("pid").and_then(Value::as_i64) {
            Some(pid) => {
                self.log.debug(&format!("guest-exec pid: {pid}"));
                Ok(Some(pid))
            }
            None => {
                self.log
                    .warning(&format!("guest-exec returned no pid: {result}"));
                Ok(None)
            }
        }
    }

    fn exec_status(&mut self, pid: i64) -> Result<ExecStatus> {
        if let Some(cached) = self.output_cache.get(&pid) {
            if cached.exited {
                return Ok(cached.clone());
            }
        }
        let result = self.command(
            "guest-exec-status",
            Some(json!({"pid": pid})),
            Some(STATUS_TIMEOUT),
        )?;
        self.store_captured_output(pid, &result);
        Ok(self
            .output_cache
            .get(&pid)
            .cloned()
            .unwrap_or_default())
    }

    fn take_stdout(&mut self, pid: i64) -> Result<Option<String>> {
        let status = self.exec_status(pid)?;
        if status.stdout.is_some() {
            if let Some(cache) = self.output_cache.get_mut(&pid) {
                cache.stdout = None;
            }
        }
        Ok(status.stdout)
    }

    fn take_stderr(&mut self, pid: i64) -> Result<Option<String>> {
        let status = self.exec_status(pid)?;
        if status.stderr.is_some() {
            if let Some(cache) = self.output_cache.get_mut(&pid) {
                cache.stderr = None;
            }
        }
        Ok(status.stderr)
    }

    fn write(&mut self, path: &str, data: &str, mode: WriteMode) -> Result<bool> {
        let handle = match self.file_open(path, mode.as_agent_mode()) {
            Ok(handle) => handle,
            Err(err) => {
                self.log.debug(&format!("guest-file-open failed: {err}"));
                return Ok(false);
            }
        };
        let outcome = self.file_write_chunk(handle, data.as_bytes());
        self.file_close(handle);
        match outcome {
            Ok(()) => Ok(true),
            Err(err) => {
                self.log.error(&format!("Error writing file: {err}"));
                Ok(false)
            }
        }
    }

    fn write_from_file(&mut self, path: &str, local: &Path) -> Result<bool> {
        let mut file = fs::File::open(local).map_err(|err| Error::Transport {
            peer: local.display().to_string(),
            message: err.to_string(),
        })?;
        let handle = self.file_open(path, "w")?;

        let mut buffer = vec![0u8; WRITE_CHUNK_SIZE];
        let mut eof = false;
        while !eof {
            let read = file.read(&mut buffer).map_err(|err| {
                self.file_close(handle);
                Error::Transport {
                    peer: local.display().to_string(),
                    message: err.to_string(),
                }
            })?;
            eof = read < WRITE_CHUNK_SIZE;

            let mut attempt = 1;
            loop {
                match self.file_write_chunk(handle, &buffer[..read]) {
                    Ok(()) => break,
                    Err(err) if attempt < WRITE_CHUNK_ATTEMPTS => {
                        self.log
                            .debug(&format!("chunk write attempt {attempt} failed: {err}"));
                        attempt += 1;
                    }
                    Err(err) => {
                        self.log.error(&format!(
                            "FILE WRITE WITH CHUNK FAILED: {}: {err}",
                            local.display()
                        ));
                        self.file_close(handle);
                        return Ok(false);
                    }
                }
            }
        }

        self.file_close(handle);
        Ok(true)
    }

    fn read_file(&mut self, guest_path: &str, host_destination: &Path) -> Result<bool> {
        let handle = match self.file_open(guest_path, "rb") {
            Ok(handle) => handle,
            Err(err) => {
                self.log.debug(&format!("guest-file-open failed: {err}"));
                return Ok(false);
            }
        };

        let parent = host_destination.parent().map(Path::to_path_buf);
        let lockfile = host_destination.with_file_name(format!(
            "{}-lock",
            host_destination
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        let outcome = (|| -> Result<bool> {
            if let Some(parent) = &parent {
                fs::create_dir_all(parent).map_err(|err| Error::Transport {
                    peer: parent.display().to_string(),
                    message: err.to_string(),
                })?;
            }
            if host_destination.exists() {
                // An earlier copy would otherwise be appended to.
                let _ = fs::remove_file(host_destination);
            }
            // The lock file keeps readers away from a partially written copy.
            let _ = fs::File::create(&lockfile);

            self.log
                .debug(&format!("Starting to read file {guest_path}"));
            let mut last_chunk: Option<Vec<u8>> = None;
            loop {
                let result =
                    self.command("guest-file-read", Some(json!({"handle": handle})), None)?;
                let count = result
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Internal {
                        detail: "file read returned no byte count".to_string(),
                    })?;

                let encoded = result.get("buf-b64").and_then(Value::as_str);
                if encoded.is_none() && count == 0 {
                    // Empty file; nothing to keep.
                    return Ok(true);
                }
                let encoded = encoded.ok_or_else(|| Error::Internal {
                    detail: format!("unable to get read data for {guest_path}"),
                })?;
                let content = BASE64.decode(encoded).map_err(|err| Error::Internal {
                    detail: format!("undecodable read data: {err}"),
                })?;
                if count as usize != content.len() {
                    return Err(Error::Internal {
                        detail: format!(
                            "file read returned size {count} but {} bytes arrived",
                            content.len()
                        ),
                    });
                }

                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(host_destination)
                    .map_err(|err| Error::Transport {
                        peer: host_destination.display().to_string(),
                        message: err.to_string(),
                    })?;
                file.write_all(&content).map_err(|err| Error::Transport {
                    peer: host_destination.display().to_string(),
                    message: err.to_string(),
                })?;

                if result.get("eof").and_then(Value::as_bool) == Some(true) {
                    self.log.debug("Returning due to EOF");
                    return Ok(true);
                }

                // QGA misses EOF on Windows guests; two identical
                // consecutive chunks are assumed to be the end of the file.
                if self.windows_eof_heuristic
                    && last_chunk.as_deref() == Some(content.as_slice())
                {
                    let os = self.get_os()?;
                    self.log.debug(
                        "Found two consecutive identical chunks; likely a missed EOF",
                    );
                    if is_windows(&os) {
                        return Ok(true);
                    }
                }
                last_chunk = Some(content);
            }
        })();

        self.file_close(handle);
        let _ = fs::remove_file(&lockfile);

        match outcome {
            Ok(done) => Ok(done),
            Err(err) => {
                self.log.error(&format!("Error reading from file: {err}"));
                if let Some(parent) = &parent {
                    remove_empty_parents(parent);
                }
                Ok(false)
            }
        }
    }

    fn get_os(&mut self) -> Result<String> {
        if let Some(os) = &self.target_os {
            return Ok(os.clone());
        }
        let mut attempts = 1;
        loop {
            self.log
                .debug(&format!("Getting OS info attempt={attempts}"));
            let info = self.command("guest-get-osinfo", None, Some(STATUS_TIMEOUT))?;
            let name = info
                .get("name")
                .or_else(|| info.get("kernel-release"))
                .or_else(|| info.get("version"))
                .and_then(Value::as_str);
            if let Some(name) = name {
                self.target_os = Some(name.to_string());
                return Ok(name.to_string());
            }
            if attempts > OS_PROBE_ATTEMPTS {
                return Err(self.transport_error("unable to get OS info"));
            }
            attempts += 1;
        }
    }

    fn used_paths_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.used_paths
    }
}

/// Remove `directory` and any parents that become empty.
fn remove_empty_parents(directory: &Path) {
    let mut current = Some(directory.to_path_buf());
    while let Some(dir) = current {
        if fs::remove_dir(&dir).is_err() {
            // Not empty (or gone); stop walking up.
            return;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use super::*;
    use crate::core::logs::Level;

    /// A minimal in-process guest agent good enough to drive the protocol.
    fn spawn_fake_agent(socket: PathBuf) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let listener = UnixListener::bind(&socket).expect("bind agent socket");
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;

            let mut guest_file: Vec<u8> = Vec::new();
            let mut read_offset = 0usize;
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    return;
                }
                let request: Value = match serde_json::from_str(line.trim()) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let execute = request["execute"].as_str().unwrap_or_default();
                let args = &request["arguments"];
                let response = match execute {
                    "guest-ping" => json!({"return": {}}),
                    "guest-sync" => json!({"return": args["id"]}),
                    "guest-get-osinfo" => json!({"return": {"name": "Ubuntu"}}),
                    "guest-get-time" => json!({"return": 1_700_000_000_000_000_000i64}),
                    "guest-exec" => json!({"return": {"pid": 4242}}),
                    "guest-exec-status" => json!({"return": {
                        "exited": true,
                        "exitcode": 0,
                        "out-data": BASE64.encode(b"hello from guest\n"),
                    }}),
                    "guest-file-open" => json!({"return": 7}),
                    "guest-file-write" => {
                        let content = BASE64
                            .decode(args["buf-b64"].as_str().unwrap_or_default())
                            .unwrap_or_default();
                        guest_file.extend_from_slice(&content);
                        json!({"return": {"count": content.len()}})
                    }
                    "guest-file-read" => {
                        let chunk: Vec<u8> =
                            guest_file[read_offset..].iter().take(8).copied().collect();
                        read_offset += chunk.len();
                        let eof = read_offset >= guest_file.len();
                        json!({"return": {
                            "count": chunk.len(),
                            "buf-b64": BASE64.encode(&chunk),
                            "eof": eof,
                        }})
                    }
                    "guest-file-close" => json!({"return": {}}),
                    _ => json!({"error": {"desc": "unknown command"}}),
                };
                let mut payload = response.to_string();
                payload.push('\n');
                if writer.write_all(payload.as_bytes()).is_err() {
                    return;
                }
            }
        })
    }

    fn driver_fixture() -> (tempfile::TempDir, QemuGuestAgentDriver) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let socket = dir.path().join("qga.sock");
        let agent = spawn_fake_agent(socket.clone());
        // Give the listener a moment to bind.
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let log = LogSink::open("qga-test", &dir.path().join("driver.log"), Level::Debug)
            .expect("log");
        let driver =
            QemuGuestAgentDriver::connect_new(&socket, true, log).expect("connect");
        std::mem::forget(agent);
        (dir, driver)
    }

    #[test]
    fn connect_syncs_with_random_token() {
        let (_dir, mut driver) = driver_fixture();
        assert!(driver.ping(Duration::from_secs(2)));
        driver.sync(Duration::from_secs(2)).expect("sync");
    }

    #[test]
    fn exec_and_status_decode_cached_output() {
        let (_dir, mut driver) = driver_fixture();
        let pid = driver
            .exec("/bin/echo", &["hello".to_string()], &[], None, true)
            .expect("exec")
            .expect("pid");
        assert_eq!(pid, 4242);

        let status = driver.exec_status(pid).expect("status");
        assert!(status.exited);
        assert_eq!(status.exitcode, Some(0));

        let stdout = driver.take_stdout(pid).expect("stdout");
        assert_eq!(stdout.as_deref(), Some("hello from guest\n"));
        // The stream drains on read.
        assert_eq!(driver.take_stdout(pid).expect("stdout"), None);
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let (dir, mut driver) = driver_fixture();
        let local = dir.path().join("payload.bin");
        fs::write(&local, b"0123456789abcdef0123").expect("write local");

        assert!(
            driver
                .write_from_file("/tmp/payload.bin", &local)
                .expect("write_from_file")
        );

        let pulled = dir.path().join("out/payload.bin");
        assert!(
            driver
                .read_file("/tmp/payload.bin", &pulled)
                .expect("read_file")
        );
        assert_eq!(fs::read(&pulled).expect("read"), b"0123456789abcdef0123");
        // The read lock sentinel is released.
        assert!(!dir.path().join("out/payload.bin-lock").exists());
    }

    #[test]
    fn guest_time_is_reported_in_seconds() {
        let (_dir, mut driver) = driver_fixture();
        assert_eq!(driver.get_time().expect("time"), 1_700_000_000);
    }

    #[test]
    fn os_probe_is_cached() {
        let (_dir, mut driver) = driver_fixture();
        assert_eq!(driver.get_os().expect("os"), "Ubuntu");
        assert_eq!(driver.target_os.as_deref(), Some("Ubuntu"));
    }
}
