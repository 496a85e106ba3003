//! In-memory store

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::{blocks_restart, PendingSignal, SharedStore, Store, StoreError, StoreResult};
use crate::instance::{InstanceRecord, InstanceStatus};
use crate::schedule::ScheduleRecord;

#[derive(Default)]
struct Inner {
    instances: HashMap<String, InstanceRecord>,
    signals: HashMap<String, VecDeque<PendingSignal>>,
    versions: HashMap<String, u32>,
    schedules: HashMap<String, ScheduleRecord>,
}

/// Process-local store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(existing) = inner.instances.get(&record.instance_id) {
            if blocks_restart(existing) {
                return Err(StoreError::AlreadyExists {
                    instance_id: record.instance_id.clone(),
                    status: existing.status,
                });
            }
        }
        inner.signals.remove(&record.instance_id);
        inner
            .instances
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn save_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .instances
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: &str) -> StoreResult<Option<InstanceRecord>> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.instances.get(instance_id).cloned())
    }

    async fn list_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut records: Vec<InstanceRecord> = inner.instances.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete_instance(&self, instance_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner.signals.remove(instance_id);
        Ok(inner.instances.remove(instance_id).is_some())
    }

    async fn claim_instance(&self, instance_id: &str, run_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        match inner.instances.get_mut(instance_id) {
            Some(record) if record.run_id == run_id && record.status == InstanceStatus::Pending => {
                record.status = InstanceStatus::Running;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn push_signal(&self, instance_id: &str, signal: &PendingSignal) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .signals
            .entry(instance_id.to_string())
            .or_default()
            .push_back(signal.clone());
        Ok(())
    }

    async fn take_signal(
        &self,
        instance_id: &str,
        channel: &str,
    ) -> StoreResult<Option<PendingSignal>> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(queue) = inner.signals.get_mut(instance_id) else {
            return Ok(None);
        };
        let position = queue.iter().position(|s| s.channel == channel);
        Ok(position.and_then(|i| queue.remove(i)))
    }

    async fn clear_signals(&self, instance_id: &str) -> StoreResult<usize> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner
            .signals
            .remove(instance_id)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn decide_version(&self, key: &str, default: u32) -> StoreResult<u32> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(*inner.versions.entry(key.to_string()).or_insert(default))
    }

    async fn create_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        if inner.schedules.contains_key(&schedule.schedule_id) {
            return Ok(false);
        }
        inner
            .schedules
            .insert(schedule.schedule_id.clone(), schedule.clone());
        Ok(true)
    }

    async fn save_schedule(&self, schedule: &ScheduleRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        inner
            .schedules
            .insert(schedule.schedule_id.clone(), schedule.clone());
        Ok(())
    }

    async fn load_schedule(&self, schedule_id: &str) -> StoreResult<Option<ScheduleRecord>> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.schedules.get(schedule_id).cloned())
    }

    async fn list_schedules(&self) -> StoreResult<Vec<ScheduleRecord>> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut schedules: Vec<ScheduleRecord> = inner.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.schedule_id.cmp(&b.schedule_id));
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.schedules.remove(schedule_id).is_some())
    }
}
