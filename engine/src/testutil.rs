//! Test doubles: an in-memory remote endpoint and a sleeper that records
//! instead of blocking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{EndpointConfig, Timeouts};
use crate::connection::{Connector, RemoteFs};
use crate::error::EngineError;
use crate::listing::ListedEntry;
use crate::model::EntryKind;
use crate::paths::{remote_ancestors, remote_parent};
use crate::retry::Sleeper;

/// Records requested delays without sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

#[derive(Debug)]
struct MemoryState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    modified: HashMap<String, DateTime<Utc>>,
    structured: bool,
    size_supported: bool,
    retrieve_failures: HashMap<String, u32>,
    store_failures: HashMap<String, u32>,
    size_lies: HashMap<String, u32>,
    resets: HashMap<String, u32>,
    size_queries: u32,
    stores: Vec<String>,
    closes: u32,
}

/// In-memory endpoint. Clones share the same tree, so a test keeps one
/// handle to inspect what a run did through another. Each handle stands for
/// one connection: once severed it fails every call, while other handles
/// (and new ones from `MemoryConnector`) keep working.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<MemoryState>>,
    severed: bool,
}

fn norm(path: &str) -> String {
    remote_ancestors(path).pop().unwrap_or_default()
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Empty tree with structured listings and SIZE support.
    pub fn new() -> Self {
        MemoryFs {
            state: Arc::new(Mutex::new(MemoryState {
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                modified: HashMap::new(),
                structured: true,
                size_supported: true,
                retrieve_failures: HashMap::new(),
                store_failures: HashMap::new(),
                size_lies: HashMap::new(),
                resets: HashMap::new(),
                size_queries: 0,
                stores: Vec::new(),
                closes: 0,
            })),
            severed: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Add a file, creating its parent directories.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) -> &Self {
        let path = norm(path);
        let mut state = self.lock();
        if let Some(parent) = remote_parent(&path) {
            for dir in remote_ancestors(parent) {
                state.dirs.insert(dir);
            }
        }
        state.files.insert(path, content.into());
        drop(state);
        self
    }

    /// Add a directory and its parents.
    pub fn add_dir(&self, path: &str) -> &Self {
        let mut state = self.lock();
        for dir in remote_ancestors(path) {
            state.dirs.insert(dir);
        }
        drop(state);
        self
    }

    pub fn set_modified(&self, path: &str, when: DateTime<Utc>) {
        self.lock().modified.insert(norm(path), when);
    }

    /// Switch between MLSD-style and NLST-style listings.
    pub fn set_structured_listing(&self, structured: bool) {
        self.lock().structured = structured;
    }

    pub fn set_size_supported(&self, supported: bool) {
        self.lock().size_supported = supported;
    }

    /// Make the next `times` retrievals of `path` break mid-stream.
    pub fn fail_retrieve(&self, path: &str, times: u32) {
        self.lock().retrieve_failures.insert(norm(path), times);
    }

    /// Make the next `times` stores to `path` fail.
    pub fn fail_store(&self, path: &str, times: u32) {
        self.lock().store_failures.insert(norm(path), times);
    }

    /// Make the next `times` size queries for `path` report a wrong size.
    pub fn misreport_size(&self, path: &str, times: u32) {
        self.lock().size_lies.insert(norm(path), times);
    }

    /// Make the next `times` retrievals of `path` reset the connection that
    /// issued them; that handle then fails every later call.
    pub fn reset_on_retrieve(&self, path: &str, times: u32) {
        self.lock().resets.insert(norm(path), times);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&norm(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(&norm(path))
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn size_queries(&self) -> u32 {
        self.lock().size_queries
    }

    /// Paths stored so far, one per successful store call.
    pub fn stores(&self) -> Vec<String> {
        self.lock().stores.clone()
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    fn alive(&self, path: &str) -> Result<(), EngineError> {
        if self.severed {
            Err(EngineError::transfer(path, "broken pipe"))
        } else {
            Ok(())
        }
    }
}

fn take_fault(faults: &mut HashMap<String, u32>, path: &str) -> bool {
    match faults.get_mut(path) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn exists_as_dir(state: &MemoryState, path: &str) -> bool {
    path.is_empty() || state.dirs.contains(path)
}

impl RemoteFs for MemoryFs {
    fn supports_structured_listing(&self) -> bool {
        self.lock().structured
    }

    fn is_directory(&mut self, path: &str) -> Result<bool, EngineError> {
        self.alive(path)?;
        let state = self.lock();
        Ok(exists_as_dir(&state, &norm(path)))
    }

    fn list(&mut self, path: &str) -> Result<Vec<ListedEntry>, EngineError> {
        self.alive(path)?;
        let path = norm(path);
        let state = self.lock();
        if !exists_as_dir(&state, &path) {
            return Err(EngineError::transfer(&path, "550 No such directory"));
        }
        let is_child = |candidate: &str| remote_parent(candidate).unwrap_or("") == path;
        let name_of = |candidate: &str| candidate.rsplit('/').next().unwrap_or(candidate).to_string();

        let mut entries: Vec<ListedEntry> = state
            .dirs
            .iter()
            .filter(|d| is_child(d.as_str()))
            .map(|d| ListedEntry {
                name: name_of(d.as_str()),
                kind: EntryKind::Directory,
                size: state.structured.then_some(0),
                modified: None,
            })
            .chain(state.files.iter().filter(|(f, _)| is_child(f.as_str())).map(|(f, data)| {
                ListedEntry {
                    name: name_of(f.as_str()),
                    kind: EntryKind::File,
                    size: state.structured.then_some(data.len() as u64),
                    modified: state
                        .structured
                        .then(|| state.modified.get(f).copied())
                        .flatten(),
                }
            }))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn size(&mut self, path: &str) -> Result<Option<u64>, EngineError> {
        self.alive(path)?;
        let path = norm(path);
        let mut state = self.lock();
        state.size_queries += 1;
        if !state.size_supported {
            return Ok(None);
        }
        let Some(len) = state.files.get(&path).map(|d| d.len() as u64) else {
            return Ok(None);
        };
        if take_fault(&mut state.size_lies, &path) {
            return Ok(Some(len + 1));
        }
        Ok(Some(len))
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, EngineError> {
        self.alive(path)?;
        let path = norm(path);
        let mut state = self.lock();
        let data = state
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| EngineError::transfer(&path, "550 No such file"))?;
        if take_fault(&mut state.resets, &path) {
            drop(state);
            self.severed = true;
            return Err(EngineError::transfer(&path, "connection reset by peer"));
        }
        if take_fault(&mut state.retrieve_failures, &path) {
            sink.write_all(&data[..data.len() / 2])
                .map_err(|e| EngineError::transfer(&path, e))?;
            return Err(EngineError::transfer(&path, "connection reset by peer"));
        }
        sink.write_all(&data).map_err(|e| EngineError::transfer(&path, e))?;
        Ok(data.len() as u64)
    }

    fn store(&mut self, source: &mut dyn Read, path: &str) -> Result<u64, EngineError> {
        self.alive(path)?;
        let path = norm(path);
        let mut data = Vec::new();
        source
            .read_to_end(&mut data)
            .map_err(|e| EngineError::transfer(&path, e))?;

        let mut state = self.lock();
        if take_fault(&mut state.store_failures, &path) {
            return Err(EngineError::transfer(&path, "426 Connection closed; transfer aborted"));
        }
        let parent = remote_parent(&path).unwrap_or("").to_string();
        if !exists_as_dir(&state, &parent) {
            return Err(EngineError::transfer(&path, "553 Parent directory missing"));
        }
        let len = data.len() as u64;
        state.files.insert(path.clone(), data);
        state.stores.push(path);
        Ok(len)
    }

    fn make_dir(&mut self, path: &str) -> Result<(), EngineError> {
        self.alive(path)?;
        let path = norm(path);
        let mut state = self.lock();
        let parent = remote_parent(&path).unwrap_or("").to_string();
        if state.files.contains_key(&path) || !exists_as_dir(&state, &parent) {
            return Err(EngineError::transfer(&path, "550 Create directory operation failed"));
        }
        state.dirs.insert(path);
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.alive("")?;
        self.lock().closes += 1;
        Ok(())
    }
}

/// Hands out `MemoryFs` handles by host name, failing scripted attempts.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    endpoints: Mutex<HashMap<String, MemoryFs>>,
    failures: Mutex<HashMap<String, u32>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&self, host: &str, fs: MemoryFs) {
        self.endpoints.lock().unwrap().insert(host.to_string(), fs);
    }

    /// Fail the next `times` connection attempts to `host`.
    pub fn fail_connects(&self, host: &str, times: u32) {
        self.failures.lock().unwrap().insert(host.to_string(), times);
    }

    pub fn connect_attempts(&self, host: &str) -> u32 {
        self.attempts.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryFs;

    fn connect(
        &self,
        endpoint: &EndpointConfig,
        _timeouts: &Timeouts,
    ) -> Result<MemoryFs, EngineError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(endpoint.host.clone())
            .or_insert(0) += 1;

        let refused = |reason: &str| EngineError::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            reason: reason.to_string(),
        };
        if take_fault(&mut self.failures.lock().unwrap(), &endpoint.host) {
            return Err(refused("connection refused"));
        }
        self.endpoints
            .lock()
            .unwrap()
            .get(&endpoint.host)
            .cloned()
            .ok_or_else(|| refused("unknown host"))
    }
}
