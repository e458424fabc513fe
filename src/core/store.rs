use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::core::cluster::ClusterExecutor;
use crate::core::logs::LogSink;
use crate::error::{Error, Result};

/// Store name for disk images.
pub const IMAGE_STORE: &str = "images";
/// Store name for VM resource files.
pub const VM_RESOURCE_STORE: &str = "vm_resources";

/// Compression extensions recognized by the stores.
const COMPRESSED_EXTENSIONS: [&str; 4] = [".xz", ".tar.gz", ".tar", ".tgz"];

const BROADCAST_ATTEMPTS: usize = 10;
const BROADCAST_BACKOFF: Duration = Duration::from_millis(500);
const LOCK_POLL: Duration = Duration::from_millis(250);
/// Polls before the lock wait starts warning (five minutes at 250 ms).
const LOCK_WARN_POLLS: usize = 1200;

/// One replica entry reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub host: String,
    pub name: String,
    pub size: u64,
}

/// A replicated, content-addressed cache of files shared by every host in
/// the cluster. Two instances share the mechanism: one for disk images
/// (optionally compressed) and one for VM resource files.
pub struct FileStore {
    store: String,
    cache: PathBuf,
    decompress: bool,
    executor: ClusterExecutor,
    head_node: Option<String>,
    log: LogSink,
}

impl FileStore {
    /// The image store: large files, decompressed on fetch.
    pub fn images(config: &Config, log: LogSink) -> Result<FileStore> {
        FileStore::new(config, IMAGE_STORE, true, log)
    }

    /// The VM resource store: small files served verbatim.
    pub fn vm_resources(config: &Config, log: LogSink) -> Result<FileStore> {
        FileStore::new(config, VM_RESOURCE_STORE, false, log)
    }

    pub fn new(config: &Config, store: &str, decompress: bool, log: LogSink) -> Result<FileStore> {
        let cache = config.minimega.files_dir.join(store);
        fs::create_dir_all(&cache).map_err(|source| Error::CreateDir {
            path: cache.clone(),
            source,
        })?;
        let executor =
            ClusterExecutor::all_nodes(&config.cluster, &config.ssh, log.clone());
        Ok(FileStore {
            store: store.to_string(),
            cache,
            decompress,
            executor,
            head_node: config.cluster.head_node().map(str::to_string),
            log,
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }

    /// Strip a recognized compression extension, if any.
    pub fn strip_extension(filename: &str) -> &str {
        for extension in COMPRESSED_EXTENSIONS {
            if let Some(stripped) = filename.strip_suffix(extension) {
                return stripped;
            }
        }
        filename
    }

    /// The local cache path a file will occupy (after decompression when
    /// this store decompresses).
    pub fn file_path(&self, filename: &str) -> PathBuf {
        let name = if self.decompress {
            Self::strip_extension(filename)
        } else {
            filename
        };
        self.cache.join(name)
    }

    /// Whether the file is already cached locally.
    pub fn check_path(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    /// Ensure `filename` is cached locally and return its path, fetching
    /// from the head node when absent. Concurrent fetchers coordinate
    /// through the `-lock` sentinel directory beside the cache path.
    pub fn get_path(&self, filename: &str) -> Result<PathBuf> {
        let host_path = self.file_path(filename);
        if host_path.exists() {
            self.wait_for_lock(&host_path);
            return Ok(host_path);
        }

        match FileLock::acquire(&host_path) {
            Some(lock) => {
                let outcome = self.fetch_locked(filename, &host_path);
                drop(lock);
                outcome?;
            }
            None => {
                // Someone else is fetching; block until their lock clears.
                self.log
                    .debug(&format!("Waiting for another fetch of {filename}"));
                self.wait_for_lock(&host_path);
                if !host_path.exists() {
                    return Err(self.not_found(filename));
                }
            }
        }
        Ok(host_path)
    }

    fn fetch_locked(&self, filename: &str, host_path: &Path) -> Result<()> {
        if self.decompress && filename.ends_with(".xz") {
            let compressed = compressed_sibling(host_path, "xz");
            self.fetch_from_head(filename, &compressed)?;
            self.unpack_xz(&compressed, host_path, filename)?;
        } else if self.decompress && is_tarball(filename) {
            let compressed = compressed_sibling(host_path, "tgz");
            self.fetch_from_head(filename, &compressed)?;
            self.unpack_tar(&compressed, host_path, filename)?;
        } else {
            self.fetch_from_head(filename, host_path)?;
        }

        // Disk images can reference a backing file; pull the whole chain.
        if let Some(backing) = self.backing_file(host_path)? {
            self.log
                .debug(&format!("Downloading backing file: \"{backing}\""));
            self.get_path(&backing)?;
        }
        Ok(())
    }

    fn fetch_from_head(&self, filename: &str, destination: &Path) -> Result<()> {
        if destination.exists() {
            return Ok(());
        }
        // A compressed original already in the local cache (a fresh add, or
        // this host being the head node) needs no network hop.
        let local_original = self.cache.join(filename);
        if local_original.exists() {
            fs::copy(&local_original, destination).map_err(|err| Error::Transport {
                peer: "local".to_string(),
                message: format!("staging {filename} for unpack: {err}"),
            })?;
            return Ok(());
        }
        let Some(head) = self.head_node.as_deref() else {
            return Err(self.not_found(filename));
        };
        let remote = self.cache.join(filename);
        self.log.debug(&format!("Getting file: {filename}"));
        let output = self.executor.scp_from_host(head, &remote, destination)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = fs::remove_file(destination);
            if stderr.to_lowercase().contains("no such file") {
                return Err(self.not_found(filename));
            }
            return Err(Error::Transport {
                peer: head.to_string(),
                message: format!("fetch of {filename} failed: {}", stderr.trim()),
            });
        }
        Ok(())
    }

    fn unpack_xz(&self, compressed: &Path, target: &Path, filename: &str) -> Result<()> {
        let result = (|| -> io::Result<()> {
            let mut reader = xz2::read::XzDecoder::new(File::open(compressed)?);
            let mut writer = File::create(target)?;
            io::copy(&mut reader, &mut writer)?;
            writer.flush()
        })();
        match result {
            Ok(()) => {
                let _ = fs::remove_file(compressed);
                Ok(())
            }
            Err(err) => Err(self.decompress_error(compressed, target, filename, err)),
        }
    }

    fn unpack_tar(&self, compressed: &Path, target: &Path, filename: &str) -> Result<()> {
        let destination = target.parent().unwrap_or(&self.cache).to_path_buf();
        let result = (|| -> io::Result<()> {
            let file = File::open(compressed)?;
            if filename.ends_with(".tar") {
                tar::Archive::new(file).unpack(&destination)
            } else {
                tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(&destination)
            }
        })();
        match result {
            Ok(()) => {
                let _ = fs::remove_file(compressed);
                Ok(())
            }
            Err(err) => Err(self.decompress_error(compressed, target, filename, err)),
        }
    }

    fn decompress_error(
        &self,
        compressed: &Path,
        target: &Path,
        filename: &str,
        err: io::Error,
    ) -> Error {
        self.log
            .error(&format!("Unable to decompress file: {filename}: {err}"));
        for stale in [compressed, target] {
            let _ = fs::remove_file(stale);
        }
        Error::Decompress {
            name: filename.to_string(),
            message: err.to_string(),
        }
    }

    /// Inspect a cached qcow2 image for a backing file reference.
    fn backing_file(&self, path: &Path) -> Result<Option<String>> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("qcow2") {
            return Ok(None);
        }
        let output = Command::new("qemu-img")
            .arg("info")
            .arg("--output=json")
            .arg("--force-share")
            .arg(path)
            .output()
            .map_err(|err| Error::Transport {
                peer: "qemu-img".to_string(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            self.log.warning(&format!(
                "qemu-img info failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
            return Ok(None);
        }
        let info: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|err| Error::Internal {
                detail: format!("unparseable qemu-img info output: {err}"),
            })?;
        let backing = info
            .get("backing-filename")
            .and_then(|value| value.as_str())
            .map(|backing| {
                let backing_path = Path::new(backing);
                backing_path
                    .strip_prefix(&self.cache)
                    .unwrap_or(backing_path)
                    .to_string_lossy()
                    .into_owned()
            });
        Ok(backing)
    }

    /// Add a file to the store and broadcast it to every peer cache.
    pub fn add(&self, path: &Path, force: bool) -> Result<()> {
        let filename = basename(path);
        if force {
            if let Err(err) = self.remove(&filename) {
                self.log.debug(&format!(
                    "remove of {filename} before add reported: {err}"
                ));
            }
        }

        let host_path = self.cache.join(&filename);
        copy_preserving_mtime(path, &host_path).map_err(|err| Error::Transport {
            peer: "local".to_string(),
            message: format!("adding {filename} to {}: {err}", self.store),
        })?;
        self.broadcast(&filename)
    }

    /// Add a file from in-memory content.
    pub fn add_content(
        &self,
        filename: &str,
        content: &[u8],
        force: bool,
        broadcast: bool,
    ) -> Result<()> {
        if force {
            if let Err(err) = self.remove(filename) {
                self.log.debug(&format!(
                    "remove of {filename} before add reported: {err}"
                ));
            }
        }
        let host_path = self.cache.join(filename);
        fs::write(&host_path, content).map_err(|err| Error::Transport {
            peer: "local".to_string(),
            message: format!("adding {filename} to {}: {err}", self.store),
        })?;
        if broadcast {
            self.broadcast(filename)?;
        }
        Ok(())
    }

    /// Add a (possibly compressed) image: cache the original, force a local
    /// decompression, then broadcast the decompressed result.
    pub fn add_image(&self, path: &Path, force: bool) -> Result<()> {
        self.add(path, force)?;
        let filename = basename(path);
        let expected = Self::strip_extension(&filename);
        if expected != filename && force {
            if let Err(err) = self.remove(expected) {
                self.log
                    .debug(&format!("remove of {expected} before add reported: {err}"));
            }
        }
        let local = self.get_path(&filename)?;
        self.broadcast(&basename(&local))
    }

    /// Download an image over HTTP into the store, verifying its SHA-1 when
    /// one is supplied, then broadcast it.
    pub fn add_image_from_url(&self, url: &str, expected_sha1: Option<&str>) -> Result<()> {
        let filename = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::PreflightFailed {
                message: format!("Cannot derive an image name from `{url}`."),
            })?
            .to_string();

        let staging = self.cache.join(format!("{filename}.part"));
        let response = ureq::get(url).call().map_err(|err| Error::Transport {
            peer: url.to_string(),
            message: err.to_string(),
        })?;

        let mut reader = response.into_reader();
        let mut writer = File::create(&staging).map_err(|err| Error::Transport {
            peer: "local".to_string(),
            message: format!("staging download of {filename}: {err}"),
        })?;
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer).map_err(|err| {
                let _ = fs::remove_file(&staging);
                Error::Transport {
                    peer: url.to_string(),
                    message: err.to_string(),
                }
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer.write_all(&buffer[..read]).map_err(|err| {
                let _ = fs::remove_file(&staging);
                Error::Transport {
                    peer: "local".to_string(),
                    message: err.to_string(),
                }
            })?;
        }
        drop(writer);

        if let Some(expected) = expected_sha1 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = fs::remove_file(&staging);
                return Err(Error::Inconsistent {
                    name: filename,
                    message: format!("downloaded hash {actual} does not match {expected}"),
                });
            }
        }

        let final_path = self.cache.join(&filename);
        fs::rename(&staging, &final_path).map_err(|err| Error::Transport {
            peer: "local".to_string(),
            message: format!("finalizing download of {filename}: {err}"),
        })?;
        self.broadcast(&filename)
    }

    /// Delete a file locally and on every peer.
    pub fn remove(&self, filename: &str) -> Result<()> {
        let host_path = self.cache.join(filename);
        match fs::remove_file(&host_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::Transport {
                    peer: "local".to_string(),
                    message: format!("removing {filename} from {}: {err}", self.store),
                });
            }
        }
        let mut errors = 0usize;
        for host in self.executor.peer_hosts() {
            let outcome = self.executor.ssh_host(
                &host,
                "rm",
                &["-f".to_string(), host_path.display().to_string()],
            );
            match outcome {
                Ok(output) if output.status.success() => {}
                Ok(_) | Err(_) => errors += 1,
            }
        }
        if errors > 0 {
            return Err(Error::Inconsistent {
                name: filename.to_string(),
                message: format!("{errors} host(s) failed to remove the file"),
            });
        }
        Ok(())
    }

    /// SHA-1 of the cached file, or an empty string when not cached.
    pub fn hash(&self, filename: &str) -> String {
        let host_path = self.cache.join(basename(Path::new(filename)));
        if !host_path.exists() {
            return String::new();
        }
        hash_file(&host_path).unwrap_or_default()
    }

    /// Upload date (seconds since epoch) of the cached file.
    pub fn upload_date(&self, filename: &str) -> Option<u64> {
        let host_path = self.cache.join(basename(Path::new(filename)));
        let metadata = fs::metadata(host_path).ok()?;
        let modified = metadata.modified().ok()?;
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|duration| duration.as_secs())
    }

    /// Size in bytes of the single store entry for `filename`.
    pub fn size(&self, filename: &str) -> Result<u64> {
        let entries = self.list(&basename(Path::new(filename)))?;
        let mut local: Vec<&StoreEntry> =
            entries.iter().filter(|entry| entry.host == "local").collect();
        if local.is_empty() {
            // Fall back to any replica when the local cache is cold.
            local = entries.iter().collect();
        }
        match local.first() {
            Some(entry) if local.len() == 1 => Ok(entry.size),
            Some(_) => Err(Error::Inconsistent {
                name: filename.to_string(),
                message: "number of files does not equal 1".to_string(),
            }),
            None => Err(self.not_found(filename)),
        }
    }

    /// Enumerate replicas matching `pattern` (shell-style `*` wildcard)
    /// across the local cache and every peer.
    pub fn list(&self, pattern: &str) -> Result<Vec<StoreEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.cache).map_err(|err| Error::Transport {
            peer: "local".to_string(),
            message: format!("listing {}: {err}", self.store),
        })? {
            let entry = entry.map_err(|err| Error::Transport {
                peer: "local".to_string(),
                message: err.to_string(),
            })?;
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !pattern_matches(pattern, &name) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(StoreEntry {
                host: "local".to_string(),
                name,
                size,
            });
        }

        let listing_cmd = format!(
            "find {} -maxdepth 1 -type f -printf '%f %s\\n' 2>/dev/null || true",
            shell_quote(&self.cache.display().to_string())
        );
        for host in self.executor.peer_hosts() {
            let output = self.executor.ssh_host(
                &host,
                "sh",
                &["-c".to_string(), listing_cmd.clone()],
            )?;
            if !output.status.success() {
                return Err(Error::Transport {
                    peer: host.clone(),
                    message: format!(
                        "listing failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            for line in stdout.lines() {
                let Some((name, size)) = line.rsplit_once(' ') else {
                    continue;
                };
                if !pattern_matches(pattern, name) {
                    continue;
                }
                entries.push(StoreEntry {
                    host: host.clone(),
                    name: name.to_string(),
                    size: size.parse().unwrap_or(0),
                });
            }
        }
        Ok(entries)
    }

    /// Distinct file names matching `pattern` across all replicas.
    pub fn list_distinct(&self, pattern: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list(pattern)?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Push a cached file to every peer and verify the caches converge:
    /// every peer holds exactly one entry of the local size and none is
    /// still mid-transfer.
    pub fn broadcast(&self, filename: &str) -> Result<()> {
        let peers = self.executor.peer_hosts();
        if peers.is_empty() {
            return Ok(());
        }

        let local_path = self.cache.join(filename);
        let local_size = fs::metadata(&local_path)
            .map_err(|_| self.not_found(filename))?
            .len();
        let part_path = self.cache.join(format!("{filename}.part"));

        for attempt in 0..BROADCAST_ATTEMPTS {
            match self.push_to_peers(&peers, &local_path, &part_path) {
                Ok(()) => {}
                Err(err) => {
                    self.log.debug(&format!(
                        "broadcast: attempt={attempt}, file={filename}, error={err}"
                    ));
                    thread::sleep(BROADCAST_BACKOFF);
                    continue;
                }
            }

            self.wait_for_peer_transfers(&peers, &part_path);

            if self.peers_consistent(&peers, &local_path, local_size)? {
                return Ok(());
            }
            thread::sleep(BROADCAST_BACKOFF);
        }

        Err(Error::Inconsistent {
            name: filename.to_string(),
            message: format!("peers diverged after {BROADCAST_ATTEMPTS} attempts"),
        })
    }

    fn push_to_peers(&self, peers: &[String], local: &Path, part: &Path) -> Result<()> {
        for host in peers {
            // A visible `.part` means another transfer is already in flight.
            let probe = self.executor.ssh_host(
                host,
                "test",
                &["-e".to_string(), part.display().to_string()],
            )?;
            if probe.status.success() {
                self.log
                    .debug(&format!("{host}: transfer already in flight, waiting"));
                continue;
            }

            let copy = self.executor.scp_to_host(host, local, part)?;
            if !copy.status.success() {
                return Err(Error::Transport {
                    peer: host.clone(),
                    message: format!(
                        "push failed: {}",
                        String::from_utf8_lossy(&copy.stderr).trim()
                    ),
                });
            }
            let rename = self.executor.ssh_host(
                host,
                "mv",
                &[
                    "-f".to_string(),
                    part.display().to_string(),
                    local.display().to_string(),
                ],
            )?;
            if !rename.status.success() {
                return Err(Error::Transport {
                    peer: host.clone(),
                    message: "rename after push failed".to_string(),
                });
            }
        }
        Ok(())
    }

    fn wait_for_peer_transfers(&self, peers: &[String], part: &Path) {
        loop {
            let mut transferring = false;
            for host in peers {
                let probe = self.executor.ssh_host(
                    host,
                    "test",
                    &["-e".to_string(), part.display().to_string()],
                );
                if matches!(probe, Ok(output) if output.status.success()) {
                    transferring = true;
                    break;
                }
            }
            if !transferring {
                return;
            }
            thread::sleep(LOCK_POLL);
        }
    }

    fn peers_consistent(&self, peers: &[String], path: &Path, size: u64) -> Result<bool> {
        for host in peers {
            let output = self.executor.ssh_host(
                host,
                "stat",
                &[
                    "--format=%s".to_string(),
                    path.display().to_string(),
                ],
            )?;
            if !output.status.success() {
                return Ok(false);
            }
            let reported: u64 = String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0);
            if reported != size {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn wait_for_lock(&self, path: &Path) {
        let lock_path = lock_path(path);
        let mut polls = 0usize;
        while lock_path.exists() {
            if polls % 20 == 0 {
                self.log
                    .debug(&format!("Waiting for lock on: {}", path.display()));
            }
            if polls >= LOCK_WARN_POLLS && polls % 20 == 0 {
                self.log.warning(&format!(
                    "Have been waiting for the lock on {} for more than five minutes. \
                     An earlier fetch may have failed without releasing it.",
                    path.display()
                ));
            }
            thread::sleep(LOCK_POLL);
            polls += 1;
        }
    }

    fn not_found(&self, filename: &str) -> Error {
        Error::NotFound {
            store: self.store.clone(),
            name: filename.to_string(),
        }
    }
}

/// Scoped sentinel-directory lock beside a cache path. Released on drop on
/// every success and failure path.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock; `None` when another holder already has it.
    pub fn acquire(target: &Path) -> Option<FileLock> {
        let path = lock_path(target);
        match fs::create_dir(&path) {
            Ok(()) => Some(FileLock { path }),
            Err(_) => None,
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push("-lock");
    PathBuf::from(name)
}

fn compressed_sibling(target: &Path, extension: &str) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn is_tarball(filename: &str) -> bool {
    filename.ends_with(".tar.gz") || filename.ends_with(".tar") || filename.ends_with(".tgz")
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}

/// SHA-1 over the full bytes of a file.
pub fn hash_file(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).ok()?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Some(hex::encode(hasher.finalize()))
}

/// Copy `source` to `destination` keeping the source's modification time,
/// which the stores use as the upload date.
fn copy_preserving_mtime(source: &Path, destination: &Path) -> io::Result<()> {
    fs::copy(source, destination)?;
    let metadata = fs::metadata(source)?;
    let modified = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let times = [
        libc::timeval {
            tv_sec: modified.as_secs() as libc::time_t,
            tv_usec: modified.subsec_micros() as libc::suseconds_t,
        },
        libc::timeval {
            tv_sec: modified.as_secs() as libc::time_t,
            tv_usec: modified.subsec_micros() as libc::suseconds_t,
        },
    ];
    let c_path = std::ffi::CString::new(destination.as_os_str().as_encoded_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let rc = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Match `pattern` against `name` where `*` matches any run of characters.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CONFIG_FILE_NAME};
    use crate::core::logs::Level;

    fn single_node_store(decompress: bool) -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let files_dir = dir.path().join("files");
        let config_body = format!(
            "[cluster]\ncontrol = [\"head\"]\ncompute = [\"head\"]\n\
             [minimega]\nfiles_dir = \"{}\"\n",
            files_dir.display()
        );
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, config_body).expect("write config");
        let config = Config::load(&config_path).expect("load config");
        let log = LogSink::open("store-test", &dir.path().join("store.log"), Level::Debug)
            .expect("log");
        let store = FileStore::new(&config, VM_RESOURCE_STORE, decompress, log).expect("store");
        (dir, store)
    }

    #[test]
    fn strip_extension_handles_known_suffixes() {
        assert_eq!(FileStore::strip_extension("disk.qcow2.xz"), "disk.qcow2");
        assert_eq!(FileStore::strip_extension("bundle.tar.gz"), "bundle");
        assert_eq!(FileStore::strip_extension("bundle.tgz"), "bundle");
        assert_eq!(FileStore::strip_extension("bundle.tar"), "bundle");
        assert_eq!(FileStore::strip_extension("plain.bin"), "plain.bin");
    }

    #[test]
    fn pattern_matching_supports_wildcards() {
        assert!(pattern_matches("*.qcow2", "ubuntu.qcow2"));
        assert!(pattern_matches("", "anything"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("*.xz", "ubuntu.qcow2"));
        assert!(pattern_matches("a*c*e", "abcde"));
    }

    #[test]
    fn add_then_get_round_trips_with_upload_date() {
        let (dir, store) = single_node_store(false);
        let source = dir.path().join("resource.sh");
        fs::write(&source, b"#!/bin/bash\necho hi\n").expect("write source");

        store.add(&source, true).expect("add");
        let cached = store.get_path("resource.sh").expect("get");
        assert_eq!(fs::read(cached).expect("read"), b"#!/bin/bash\necho hi\n");

        let source_mtime = fs::metadata(&source)
            .and_then(|m| m.modified())
            .expect("mtime");
        let source_secs = source_mtime
            .duration_since(std::time::UNIX_EPOCH)
            .expect("epoch")
            .as_secs();
        assert_eq!(store.upload_date("resource.sh"), Some(source_secs));
    }

    #[test]
    fn double_add_of_identical_content_is_stable() {
        let (dir, store) = single_node_store(false);
        let source = dir.path().join("resource.sh");
        fs::write(&source, b"payload").expect("write source");

        store.add(&source, true).expect("first add");
        let first_date = store.upload_date("resource.sh").expect("date");
        store.add(&source, true).expect("second add");
        let second_date = store.upload_date("resource.sh").expect("date");
        assert_eq!(first_date, second_date);
    }

    #[test]
    fn missing_file_reports_not_found() {
        let (_dir, store) = single_node_store(false);
        assert!(matches!(
            store.get_path("absent.bin"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn hash_matches_known_sha1() {
        let (dir, store) = single_node_store(false);
        let source = dir.path().join("hashed.txt");
        fs::write(&source, b"abc").expect("write source");
        store.add(&source, true).expect("add");
        // SHA-1("abc")
        assert_eq!(store.hash("hashed.txt"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn held_lock_is_observed_by_acquirers() {
        let (dir, _store) = single_node_store(false);
        let target = dir.path().join("files").join(VM_RESOURCE_STORE).join("big.bin");
        let lock = FileLock::acquire(&target).expect("lock");
        assert!(FileLock::acquire(&target).is_none());
        drop(lock);
        assert!(FileLock::acquire(&target).is_some());
    }

    #[test]
    fn xz_decompression_failure_cleans_up() {
        let (dir, store) = single_node_store(true);
        let cache = dir.path().join("files").join(VM_RESOURCE_STORE);
        let compressed = cache.join("broken.bin.xz");
        fs::write(&compressed, b"this is not xz data").expect("write bogus");

        let target = cache.join("broken.bin");
        let err = store
            .unpack_xz(&compressed, &target, "broken.bin.xz")
            .expect_err("must fail");
        assert!(matches!(err, Error::Decompress { .. }));
        assert!(!compressed.exists());
        assert!(!target.exists());
    }

    #[test]
    fn listing_filters_by_pattern() {
        let (dir, store) = single_node_store(false);
        for name in ["a.qcow2", "b.qcow2", "notes.txt"] {
            let source = dir.path().join(name);
            fs::write(&source, b"x").expect("write");
            store.add(&source, true).expect("add");
        }
        let names = store.list_distinct("*.qcow2").expect("list");
        assert_eq!(names, vec!["a.qcow2".to_string(), "b.qcow2".to_string()]);
    }
}
