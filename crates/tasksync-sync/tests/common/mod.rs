//! Shared fixtures for sync integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::watch;

use tasksync_core::{
    clock::HybridClock,
    config::SyncConfig,
    domain::{
        ConflictRecord, DeviceId, EntityId, EntitySnapshot, Operation, OperationDraft,
        OperationId, SequenceId, SyncStatus, Timestamp, UserId,
    },
    ports::{CommitOutcome, IEntityStore, IOperationStore, InsertOutcome, OperationCommit},
};
use tasksync_sync::{OperationLog, SyncCoordinator};

pub const ALICE: UserId = UserId::new(1);
pub const BOB: UserId = UserId::new(2);

/// In-memory entity and operation store with failure injection
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<EntityId, EntitySnapshot>>,
    operations: Mutex<Vec<Operation>>,
    conflicts: Mutex<HashMap<OperationId, ConflictRecord>>,
    unavailable: AtomicBool,
    entity_reads_fail: AtomicBool,
    failing_commits: AtomicUsize,
    interleave: Mutex<Option<EntityWriter>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

/// Write run inside the next commit, before it reads anything
pub type EntityWriter = Box<dyn FnOnce(&mut HashMap<EntityId, EntitySnapshot>) + Send>;

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, snapshot: EntitySnapshot) {
        self.entities.lock().unwrap().insert(snapshot.id, snapshot);
    }

    pub fn entity(&self, id: i64) -> EntitySnapshot {
        self.entities.lock().unwrap()[&EntityId::new(id)].clone()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    /// Every store call fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Only entity lookups fail while set
    pub fn set_entity_reads_fail(&self, fail: bool) {
        self.entity_reads_fail.store(fail, Ordering::SeqCst);
    }

    /// The next `count` commits fail before writing anything
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Lands `write` between the processor's read and its commit
    pub fn interleave(&self, write: EntityWriter) {
        *self.interleave.lock().unwrap() = Some(write);
    }

    pub fn operation(&self, id: OperationId) -> Operation {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .find(|op| op.id == id)
            .cloned()
            .unwrap()
    }

    /// Holds delta queries until `true` is sent
    pub fn close_gate(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        Ok(())
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
    }
}

#[async_trait::async_trait]
impl IEntityStore for MemoryStore {
    async fn get_entity(&self, id: EntityId) -> anyhow::Result<Option<EntitySnapshot>> {
        self.check()?;
        if self.entity_reads_fail.load(Ordering::SeqCst) {
            anyhow::bail!("entity table locked");
        }
        Ok(self.entities.lock().unwrap().get(&id).cloned())
    }

    async fn list_changed_since(
        &self,
        owner: UserId,
        since: Option<Timestamp>,
        limit: usize,
    ) -> anyhow::Result<Vec<EntitySnapshot>> {
        self.pass_gate().await;
        self.check()?;
        let mut changed: Vec<EntitySnapshot> = self
            .entities
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.owner_id == owner)
            .filter(|e| since.map_or(true, |since| e.updated_at > since))
            .cloned()
            .collect();
        changed.sort_by_key(|e| (e.updated_at, e.id));
        changed.truncate(limit);
        Ok(changed)
    }
}

#[async_trait::async_trait]
impl IOperationStore for MemoryStore {
    async fn insert_if_absent(&self, draft: &OperationDraft) -> anyhow::Result<InsertOutcome> {
        self.check()?;
        let mut operations = self.operations.lock().unwrap();
        if let Some(existing) = operations
            .iter()
            .find(|op| op.sequence_id == draft.sequence_id)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let id = OperationId::new(operations.len() as i64 + 1);
        let op = draft.clone().into_operation(id);
        operations.push(op.clone());
        Ok(InsertOutcome::Inserted(op))
    }

    async fn get_operation(&self, id: OperationId) -> anyhow::Result<Option<Operation>> {
        self.check()?;
        Ok(self
            .operations
            .lock()
            .unwrap()
            .iter()
            .find(|op| op.id == id)
            .cloned())
    }

    async fn commit(&self, commit: &OperationCommit) -> anyhow::Result<CommitOutcome> {
        self.check()?;
        if self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("log unavailable");
        }

        let mut operations = self.operations.lock().unwrap();
        let mut entities = self.entities.lock().unwrap();
        if let Some(write) = self.interleave.lock().unwrap().take() {
            write(&mut *entities);
        }
        let Some(op) = operations.iter_mut().find(|op| op.id == commit.operation_id) else {
            anyhow::bail!("operation {} not found", commit.operation_id);
        };

        let row = match commit.evaluate(op.sync_status, entities.get(&commit.entity_id())) {
            Ok(row) => row,
            Err(outcome) => return Ok(outcome),
        };
        if let Some(row) = &row {
            entities.insert(row.id, row.clone());
        }
        op.sync_status = commit.status;
        if let Some(record) = &commit.conflict {
            self.conflicts
                .lock()
                .unwrap()
                .insert(record.operation_id(), record.clone());
        }
        Ok(commit.committed(row))
    }

    async fn pending_operations(&self, user: UserId) -> anyhow::Result<Vec<Operation>> {
        self.check()?;
        let mut pending: Vec<Operation> = self
            .operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.user_id == user && op.sync_status == SyncStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|op| op.server_timestamp);
        Ok(pending)
    }

    async fn get_conflict(
        &self,
        operation_id: OperationId,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        self.check()?;
        Ok(self.conflicts.lock().unwrap().get(&operation_id).cloned())
    }

    async fn unresolved_conflicts(&self, user: UserId) -> anyhow::Result<Vec<ConflictRecord>> {
        self.check()?;
        let operations = self.operations.lock().unwrap();
        let mut unresolved: Vec<ConflictRecord> = self
            .conflicts
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.user_id() == user)
            .filter(|c| {
                operations
                    .iter()
                    .any(|op| op.id == c.operation_id() && op.sync_status == SyncStatus::Conflicted)
            })
            .cloned()
            .collect();
        unresolved.sort_by_key(|c| c.server_timestamp());
        Ok(unresolved)
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn device(name: &str) -> DeviceId {
    DeviceId::new(name.to_string()).unwrap()
}

pub fn seq(value: &str) -> SequenceId {
    SequenceId::new(value.to_string()).unwrap()
}

/// Task entity owned by `owner` with a single `title` field
pub fn task(id: i64, owner: UserId, title: &str, updated_at: i64) -> EntitySnapshot {
    let mut fields: BTreeMap<String, Value> = BTreeMap::new();
    fields.insert("title".to_string(), json!(title));
    EntitySnapshot::new(
        EntityId::new(id),
        owner,
        fields,
        Timestamp::from_micros(updated_at),
    )
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<HybridClock>,
    pub coordinator: Arc<SyncCoordinator>,
    pub log: Arc<OperationLog>,
}

pub fn harness_with(config: SyncConfig, build: impl FnOnce(SyncCoordinator) -> SyncCoordinator) -> Harness {
    let store = MemoryStore::new();
    let clock = Arc::new(HybridClock::new());
    let coordinator = SyncCoordinator::new(store.clone(), store.clone(), Arc::clone(&clock), &config);
    let log = Arc::new(OperationLog::new(store.clone(), Arc::clone(&clock)));
    Harness {
        store,
        clock,
        coordinator: Arc::new(build(coordinator)),
        log,
    }
}

pub fn harness() -> Harness {
    harness_with(SyncConfig::default(), |c| c)
}
