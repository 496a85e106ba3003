//! File-backed store
//!
//! One JSON document per record. Writes go to a temporary sibling and are
//! renamed into place; exclusive inserts hard-link the temporary file so a
//! concurrent writer in another process sees either nothing or the whole
//! document.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tracing::warn;

use super::{blocks_restart, PendingSignal, SharedStore, Store, StoreError, StoreResult};
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::namespace::{DEFAULT_NAMESPACE, NAMESPACE_FILE};
use crate::schedule::ScheduleRecord;

const INSTANCES_DIR: &str = "instances";
const SIGNALS_DIR: &str = "signals";
const VERSIONS_DIR: &str = "versions";
const SCHEDULES_DIR: &str = "schedules";
const CLAIMS_DIR: &str = "claims";

/// Store rooted at `<root>/<namespace>/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    namespace: String,
}

impl FileStore {
    /// Open the store for a registered namespace.
    ///
    /// The `default` namespace is created on first use; any other namespace
    /// must have been registered first.
    pub fn open(root: impl AsRef<Path>, namespace: &str) -> StoreResult<Self> {
        let dir = root.as_ref().join(namespace);
        if namespace != DEFAULT_NAMESPACE && !dir.join(NAMESPACE_FILE).is_file() {
            return Err(StoreError::NamespaceNotFound(namespace.to_string()));
        }
        for sub in [
            INSTANCES_DIR,
            SIGNALS_DIR,
            VERSIONS_DIR,
            SCHEDULES_DIR,
            CLAIMS_DIR,
        ] {
            std::fs::create_dir_all(dir.join(sub))?;
        }
        Ok(Self {
            dir,
            namespace: namespace.to_string(),
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespace directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(INSTANCES_DIR)
            .join(format!("{instance_id}.json"))
    }

    fn signal_dir(&self, instance_id: &str) -> PathBuf {
        self.dir.join(SIGNALS_DIR).join(instance_id)
    }

    fn claim_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(CLAIMS_DIR).join(format!("{run_id}.json"))
    }

    fn version_path(&self, key: &str) -> PathBuf {
        self.dir.join(VERSIONS_DIR).join(format!("{key}.json"))
    }

    fn schedule_path(&self, schedule_id: &str) -> PathBuf {
        self.dir
            .join(SCHEDULES_DIR)
            .join(format!("{schedule_id}.json"))
    }
}

// =========================================================================
// Document helpers
// =========================================================================

fn temp_sibling(path: &Path) -> PathBuf {
    path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()))
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Replace `path` atomically.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let tmp = temp_sibling(path);
    fs::write(&tmp, encode(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Publish `path` only if it does not exist yet. Returns false if it did.
async fn insert_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<bool> {
    let tmp = temp_sibling(path);
    fs::write(&tmp, encode(value)?).await?;
    let linked = fs::hard_link(&tmp, path).await;
    let _ = fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// `.json` documents in `dir`, sorted by file name.
async fn json_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Load every document in `dir`, skipping unreadable ones.
async fn load_all<T: DeserializeOwned>(dir: &Path) -> StoreResult<Vec<T>> {
    let mut values = Vec::new();
    for path in json_files(dir).await? {
        match read_json(&path).await {
            Ok(Some(value)) => values.push(value),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
        }
    }
    Ok(values)
}

#[async_trait]
impl Store for FileStore {
    async fn create_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        let path = self.instance_path(&record.instance_id);
        if insert_json(&path, record).await? {
            return Ok(());
        }

        match read_json::<InstanceRecord>(&path).await? {
            Some(existing) if blocks_restart(&existing) => Err(StoreError::AlreadyExists {
                instance_id: record.instance_id.clone(),
                status: existing.status,
            }),
            _ => {
                self.clear_signals(&record.instance_id).await?;
                write_json(&path, record).await
            }
        }
    }

    async fn save_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        write_json(&self.instance_path(&record.instance_id), record).await
    }

    async fn load_instance(&self, instance_id: &str) -> StoreResult<Option<InstanceRecord>> {
        read_json(&self.instance_path(instance_id)).await
    }

    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let mut records: Vec<InstanceRecord> = load_all(&self.dir.join(INSTANCES_DIR)).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete_instance(&self, instance_id: &str) -> StoreResult<bool> {
        self.clear_signals(instance_id).await?;
        if let Some(record) = self.load_instance(instance_id).await? {
            remove_if_exists(&self.claim_path(&record.run_id)).await?;
        }
        remove_if_exists(&self.instance_path(instance_id)).await
    }

    async fn claim_instance(&self, instance_id: &str, run_id: &str) -> StoreResult<bool> {
        let Some(mut record) = self.load_instance(instance_id).await? else {
            return Ok(false);
        };
        if record.run_id != run_id || record.status != InstanceStatus::Pending {
            return Ok(false);
        }
        // The claim marker is the lock; whoever links it first owns the run.
        if !insert_json(&self.claim_path(run_id), &instance_id).await? {
            return Ok(false);
        }
        record.status = InstanceStatus::Running;
        record.updated_at = Utc::now();
        self.save_instance(&record).await?;
        Ok(true)
    }

    async fn push_signal(&self, instance_id: &str, signal: &PendingSignal) -> StoreResult<()> {
        let dir = self.signal_dir(instance_id);
        fs::create_dir_all(&dir).await?;
        let nanos = signal.sent_at.timestamp_nanos_opt().unwrap_or_default();
        let path = dir.join(format!("{nanos:020}-{}.json", signal.signal_id));
        write_json(&path, signal).await
    }

    async fn take_signal(
        &self,
        instance_id: &str,
        channel: &str,
    ) -> StoreResult<Option<PendingSignal>> {
        for path in json_files(&self.signal_dir(instance_id)).await? {
            let Some(signal) = read_json::<PendingSignal>(&path).await? else {
                continue;
            };
            if signal.channel != channel {
                continue;
            }
            // Another consumer may have won the file.
            if remove_if_exists(&path).await? {
                return Ok(Some(signal));
            }
        }
        Ok(None)
    }

    async fn clear_signals(&self, instance_id: &str) -> StoreResult<usize> {
        let dir = self.signal_dir(instance_id);
        let count = json_files(&dir).await?.len();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn decide_version(&self, key: &str, default: u32) -> StoreResult<u32> {
        let path = self.version_path(key);
        if insert_json(&path, &default).await? {
            return Ok(default);
        }
        read_json::<u32>(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn create_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<bool> {
        insert_json(&self.schedule_path(&schedule.schedule_id), schedule).await
    }

    async fn save_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<()> {
        write_json(&self.schedule_path(&schedule.schedule_id), schedule).await
    }

    async fn load_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRecord>> {
        read_json(&self.schedule_path(schedule_id)).await
    }

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleRecord>> {
        load_all(&self.dir.join(SCHEDULES_DIR)).await
    }

    async fn delete_schedule(&self, schedule_id: &str) -> StoreResult<bool> {
        remove_if_exists(&self.schedule_path(schedule_id)).await
    }
}
