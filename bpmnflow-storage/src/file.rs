//! File-backed durable store.
//!
//! Layout under the store directory:
//!
//! ```text
//! <dir>/<instance_id>/events.log     framed event records
//! <dir>/<instance_id>/snapshot.json  latest snapshot
//! <dir>/<instance_id>/meta.json      version, committed log length, snapshot checksum
//! ```
//!
//! `meta.json` is the commit point. It is replaced atomically (write to a
//! temporary file, then rename) by `save_snapshot`, after the appended log
//! bytes and the snapshot are synced. Readers ignore log bytes past the
//! committed length, so an append never becomes visible without its
//! snapshot save. Version claims live in memory only: a crash or a rollback
//! releases them, and the next append overwrites the uncommitted bytes.
//!
//! Access to one instance is serialized within the process. Two processes
//! writing the same directory are not coordinated.

use crate::error::StorageError;
use crate::record::{decode_all, EventRecord};
use crate::snapshot::SnapshotMeta;
use crate::store::{stamp, DurableStore, ReadResult, VersionState};
use bpmnflow_core::{PersistedEvent, Snapshot, TimeUuid, TimeUuidGenerator};
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOG_FILE: &str = "events.log";
const SNAPSHOT_FILE: &str = "snapshot.json";
const META_FILE: &str = "meta.json";

/// Committed state of one instance directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileMeta {
    version: Option<u64>,
    log_len: u64,
    record_count: u64,
    last_key: Option<TimeUuid>,
    snapshot: Option<SnapshotMeta>,
}

/// Log position after an append that awaits its snapshot save.
#[derive(Debug, Clone, Copy)]
struct FileClaim {
    log_len: u64,
    record_count: u64,
    last_key: Option<TimeUuid>,
}

/// Durable store writing one directory per instance.
pub struct FileStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    claims: DashMap<String, FileClaim>,
    clock: TimeUuidGenerator,
}

impl FileStore {
    /// Opens or creates a store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        tracing::debug!("Opened file store at {:?}", dir);
        Ok(Self {
            dir,
            locks: DashMap::new(),
            claims: DashMap::new(),
            clock: TimeUuidGenerator::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists instances that have a committed state.
    pub fn instance_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().join(META_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    fn instance_dir(&self, instance_id: &str) -> Result<PathBuf, StorageError> {
        let valid = !instance_id.is_empty()
            && instance_id != "."
            && instance_id != ".."
            && !instance_id.contains(['/', '\\']);
        if !valid {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid instance id '{}'", instance_id),
            )));
        }
        Ok(self.dir.join(instance_id))
    }

    fn load_meta(&self, dir: &Path) -> Result<FileMeta, StorageError> {
        match fs::read(dir.join(META_FILE)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn version_state(&self, instance_id: &str, meta: &FileMeta) -> VersionState {
        VersionState {
            version: meta.version,
            claimed: self.claims.contains_key(instance_id),
        }
    }

    fn save_meta(&self, dir: &Path, meta: &FileMeta) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(meta)?;
        write_atomic(&dir.join(META_FILE), &data)
    }

    fn read_log(&self, dir: &Path, meta: &FileMeta) -> Result<Vec<EventRecord>, StorageError> {
        if meta.log_len == 0 {
            return Ok(Vec::new());
        }
        let mut file = File::open(dir.join(LOG_FILE))?;
        let mut data = Vec::with_capacity(meta.log_len as usize);
        Read::by_ref(&mut file)
            .take(meta.log_len)
            .read_to_end(&mut data)?;
        if (data.len() as u64) < meta.log_len {
            return Err(StorageError::Corruption {
                offset: data.len() as u64,
                reason: format!("log shorter than committed length {}", meta.log_len),
            });
        }

        let records = decode_all(&data)?;
        if records.len() as u64 != meta.record_count {
            return Err(StorageError::Corruption {
                offset: meta.log_len,
                reason: format!(
                    "expected {} records, found {}",
                    meta.record_count,
                    records.len()
                ),
            });
        }
        Ok(records)
    }

    /// Loads the snapshot if it is present and intact.
    fn read_snapshot(&self, dir: &Path, meta: &SnapshotMeta) -> Option<Snapshot> {
        let data = match fs::read(dir.join(SNAPSHOT_FILE)) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Snapshot in {:?} unreadable: {}", dir, e);
                return None;
            }
        };
        if !meta.verify(&data) {
            tracing::warn!(
                "Snapshot in {:?} failed checksum verification; replaying full history",
                dir
            );
            return None;
        }
        match serde_json::from_slice(&data) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Snapshot in {:?} does not parse: {}", dir, e);
                None
            }
        }
    }
}

impl DurableStore for FileStore {
    fn read(&self, instance_id: &str) -> Result<ReadResult, StorageError> {
        let dir = self.instance_dir(instance_id)?;
        let lock = self.lock(instance_id);
        let _guard = lock.lock();

        let meta = self.load_meta(&dir)?;
        let events: Vec<PersistedEvent> = self
            .read_log(&dir, &meta)?
            .into_iter()
            .map(|r| r.event)
            .collect();

        let snapshot = meta
            .snapshot
            .as_ref()
            .and_then(|m| self.read_snapshot(&dir, m).map(|s| (s, m.boundary)));

        let result = match snapshot {
            Some((snapshot, boundary)) => ReadResult {
                version: meta.version,
                snapshot: Some(snapshot),
                timeuuid: boundary,
                events: events
                    .into_iter()
                    .filter(|e| boundary.map_or(true, |b| e.timeuuid > b))
                    .collect(),
            },
            None => ReadResult {
                version: meta.version,
                snapshot: None,
                timeuuid: None,
                events,
            },
        };
        Ok(result)
    }

    fn append(
        &self,
        instance_id: &str,
        expected: Option<u64>,
        events: &mut [PersistedEvent],
    ) -> Result<bool, StorageError> {
        let dir = self.instance_dir(instance_id)?;
        let lock = self.lock(instance_id);
        let _guard = lock.lock();

        let meta = self.load_meta(&dir)?;
        let state = self.version_state(instance_id, &meta);
        if !state.can_append(expected) {
            tracing::debug!(
                "Append to {} rejected: expected {:?}, stored {:?}",
                instance_id,
                expected,
                state
            );
            return Ok(false);
        }
        fs::create_dir_all(&dir)?;

        let last_key = stamp(&self.clock, meta.last_key, events);
        let mut buf = BytesMut::new();
        for (i, event) in events.iter().enumerate() {
            EventRecord::new(meta.record_count + i as u64, event.clone()).encode_into(&mut buf)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOG_FILE))?;
        // Drop bytes of an append that never committed.
        file.set_len(meta.log_len)?;
        file.seek(SeekFrom::Start(meta.log_len))?;
        file.write_all(&buf)?;
        file.sync_data()?;

        self.claims.insert(
            instance_id.to_string(),
            FileClaim {
                log_len: meta.log_len + buf.len() as u64,
                record_count: meta.record_count + events.len() as u64,
                last_key,
            },
        );

        tracing::debug!(
            "Appended {} events to {} ({} bytes)",
            events.len(),
            instance_id,
            buf.len()
        );
        Ok(true)
    }

    fn save_snapshot(
        &self,
        instance_id: &str,
        version: u64,
        snapshot: Option<&Snapshot>,
        boundary: Option<TimeUuid>,
    ) -> Result<bool, StorageError> {
        let dir = self.instance_dir(instance_id)?;
        let lock = self.lock(instance_id);
        let _guard = lock.lock();

        let mut meta = self.load_meta(&dir)?;
        let state = self.version_state(instance_id, &meta);
        let claim = match self.claims.get(instance_id) {
            Some(claim) if state.can_save(version) => *claim,
            _ => {
                tracing::debug!(
                    "Snapshot of {} at version {} rejected: stored {:?}",
                    instance_id,
                    version,
                    state
                );
                return Ok(false);
            }
        };

        meta.snapshot = match snapshot {
            Some(snapshot) => {
                let data = serde_json::to_vec_pretty(snapshot)?;
                write_atomic(&dir.join(SNAPSHOT_FILE), &data)?;
                Some(SnapshotMeta::for_bytes(&data, boundary))
            }
            None => None,
        };
        meta.version = Some(version);
        meta.log_len = claim.log_len;
        meta.record_count = claim.record_count;
        meta.last_key = claim.last_key;
        self.save_meta(&dir, &meta)?;
        self.claims.remove(instance_id);

        tracing::debug!("Saved snapshot of {} at version {}", instance_id, version);
        Ok(true)
    }

    fn rollback(&self, instance_id: &str) -> Result<(), StorageError> {
        let dir = self.instance_dir(instance_id)?;
        let lock = self.lock(instance_id);
        let _guard = lock.lock();

        if self.claims.remove(instance_id).is_none() {
            return Ok(());
        }
        let meta = self.load_meta(&dir)?;
        match OpenOptions::new().write(true).open(dir.join(LOG_FILE)) {
            Ok(file) => {
                file.set_len(meta.log_len)?;
                file.sync_data()?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(
            "Rolled back {} to committed log length {}",
            instance_id,
            meta.log_len
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
