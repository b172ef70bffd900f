//! StateStore — redb-backed persistence for the Armada director.
//!
//! Typed CRUD over every durable entity plus the three conditional
//! operations the rest of the system leans on: monotonic task-id
//! allocation, the `queued → processing` task pickup, and atomic lock-row
//! acquisition. Conditional updates run inside a single redb write
//! transaction; redb serializes writers, which is what makes them atomic.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Handle to the director's embedded database. Clones are cheap and all
/// share the same underlying redb instance, so one store can serve the
/// API layer and every task worker at once.
#[derive(Clone, Debug)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open the database file at `path`, creating it on first boot.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Unavailable(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.create_missing_tables()?;
        debug!(?path, "state database ready");
        Ok(store)
    }

    /// Ephemeral store for tests: same schema, nothing on disk.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Unavailable(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.create_missing_tables()?;
        debug!("in-memory state database ready");
        Ok(store)
    }

    /// redb materializes a table the first time a write transaction opens
    /// it, so touching every definition once at startup pins the schema
    /// and keeps later read transactions from tripping over absent tables.
    fn create_missing_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        for table in [
            USERS,
            RELEASES,
            RELEASE_VERSIONS,
            PACKAGES,
            TEMPLATES,
            COMPILED_PACKAGES,
            STEMCELLS,
            DEPLOYMENTS,
            VMS,
            INSTANCES,
            DISKS,
            LOCKS,
        ] {
            txn.open_table(table)
                .map_err(StateError::backend("open table"))?;
        }
        // The u64-keyed tables have their own shapes.
        txn.open_table(TASKS)
            .map_err(StateError::backend("open table"))?;
        txn.open_table(TASK_QUEUE)
            .map_err(StateError::backend("open table"))?;
        txn.open_table(META)
            .map_err(StateError::backend("open table"))?;
        txn.commit().map_err(StateError::txn)?;
        Ok(())
    }

    // ── Generic helpers over &str-keyed tables ─────────────────────

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(StateError::encode)?;
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        {
            let mut t = txn
                .open_table(table)
                .map_err(StateError::backend("open table"))?;
            t.insert(key, bytes.as_slice())
                .map_err(StateError::backend("write"))?;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(StateError::txn)?;
        let t = txn
            .open_table(table)
            .map_err(StateError::backend("open table"))?;
        match t.get(key).map_err(StateError::backend("read"))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let existed;
        {
            let mut t = txn
                .open_table(table)
                .map_err(StateError::backend("open table"))?;
            existed = t
                .remove(key)
                .map_err(StateError::backend("delete"))?
                .is_some();
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(existed)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(StateError::txn)?;
        let t = txn
            .open_table(table)
            .map_err(StateError::backend("open table"))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(StateError::backend("scan"))? {
            let (key, value) = entry.map_err(StateError::backend("scan"))?;
            if key.value().starts_with(prefix) {
                let v = serde_json::from_slice(value.value()).map_err(StateError::corrupt)?;
                results.push(v);
            }
        }
        Ok(results)
    }

    fn remove_prefix(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<u32> {
        // Two phases: find matching keys under a read view, then delete
        // them in one write transaction.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(StateError::txn)?;
            let t = txn
                .open_table(table)
                .map_err(StateError::backend("open table"))?;
            t.iter()
                .map_err(StateError::backend("scan"))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let count = keys.len() as u32;
        {
            let mut t = txn
                .open_table(table)
                .map_err(StateError::backend("open table"))?;
            for key in &keys {
                t.remove(key.as_str())
                    .map_err(StateError::backend("delete"))?;
            }
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(count)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Allocate the next monotonic task id.
    pub fn allocate_task_id(&self) -> StateResult<TaskId> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let next;
        {
            let mut t = txn
                .open_table(META)
                .map_err(StateError::backend("open table"))?;
            let current = t
                .get("task_seq")
                .map_err(StateError::backend("read"))?
                .map(|g| g.value())
                .unwrap_or(0);
            next = current + 1;
            t.insert("task_seq", next)
                .map_err(StateError::backend("write"))?;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(next)
    }

    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        let bytes = serde_json::to_vec(task).map_err(StateError::encode)?;
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        {
            let mut t = txn
                .open_table(TASKS)
                .map_err(StateError::backend("open table"))?;
            t.insert(task.id, bytes.as_slice())
                .map_err(StateError::backend("write"))?;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<TaskRecord>> {
        let txn = self.db.begin_read().map_err(StateError::txn)?;
        let t = txn
            .open_table(TASKS)
            .map_err(StateError::backend("open table"))?;
        match t.get(id).map_err(StateError::backend("read"))? {
            Some(guard) => {
                let task = serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List tasks ordered by timestamp (then id) descending.
    pub fn list_tasks(
        &self,
        limit: usize,
        state: Option<TaskState>,
    ) -> StateResult<Vec<TaskRecord>> {
        let txn = self.db.begin_read().map_err(StateError::txn)?;
        let t = txn
            .open_table(TASKS)
            .map_err(StateError::backend("open table"))?;
        let mut tasks = Vec::new();
        for entry in t.iter().map_err(StateError::backend("scan"))? {
            let (_, value) = entry.map_err(StateError::backend("scan"))?;
            let task: TaskRecord =
                serde_json::from_slice(value.value()).map_err(StateError::corrupt)?;
            if state.map_or(true, |s| task.state == s) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Transition a task's state only if it currently has the expected one.
    ///
    /// This is the pickup guard: workers move `queued → processing` exactly
    /// once; a stale queue entry finds the row already moved and is
    /// discarded.
    pub fn compare_and_set_task_state(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let swapped;
        {
            let mut t = txn
                .open_table(TASKS)
                .map_err(StateError::backend("open table"))?;
            let current: Option<TaskRecord> =
                match t.get(id).map_err(StateError::backend("read"))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?)
                    }
                    None => None,
                };
            match current {
                Some(mut task) if task.state == from => {
                    task.state = to;
                    let bytes = serde_json::to_vec(&task).map_err(StateError::encode)?;
                    t.insert(id, bytes.as_slice())
                        .map_err(StateError::backend("write"))?;
                    swapped = true;
                }
                _ => swapped = false,
            }
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(swapped)
    }

    /// Record a task's terminal state and result string.
    pub fn finish_task(&self, id: TaskId, state: TaskState, result: &str) -> StateResult<()> {
        let mut task = self
            .get_task(id)?
            .ok_or_else(|| StateError::MissingRow(format!("task {id}")))?;
        task.state = state;
        task.result = Some(result.to_string());
        self.put_task(&task)
    }

    // ── Task queue ─────────────────────────────────────────────────

    /// Append a durable queue entry for a freshly created task.
    pub fn enqueue_task(&self, entry: &QueueEntry) -> StateResult<()> {
        let bytes = serde_json::to_vec(entry).map_err(StateError::encode)?;
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        {
            let mut t = txn
                .open_table(TASK_QUEUE)
                .map_err(StateError::backend("open table"))?;
            t.insert(entry.task_id, bytes.as_slice())
                .map_err(StateError::backend("write"))?;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(())
    }

    /// Pop the oldest queue entry, if any. Removal and read are one write
    /// transaction, so concurrent workers never pop the same entry.
    pub fn dequeue_task(&self) -> StateResult<Option<QueueEntry>> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let entry;
        {
            let mut t = txn
                .open_table(TASK_QUEUE)
                .map_err(StateError::backend("open table"))?;
            let first = {
                let mut iter = t.iter().map_err(StateError::backend("scan"))?;
                match iter.next() {
                    Some(item) => {
                        let (key, value) = item.map_err(StateError::backend("scan"))?;
                        let decoded: QueueEntry = serde_json::from_slice(value.value())
                            .map_err(StateError::corrupt)?;
                        Some((key.value(), decoded))
                    }
                    None => None,
                }
            };
            match first {
                Some((key, decoded)) => {
                    t.remove(key).map_err(StateError::backend("delete"))?;
                    entry = Some(decoded);
                }
                None => entry = None,
            }
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(entry)
    }

    // ── Users ──────────────────────────────────────────────────────

    pub fn put_user(&self, user: &UserRecord) -> StateResult<()> {
        self.put(USERS, &user.username, user)
    }

    pub fn get_user(&self, username: &str) -> StateResult<Option<UserRecord>> {
        self.get(USERS, username)
    }

    pub fn delete_user(&self, username: &str) -> StateResult<bool> {
        self.remove(USERS, username)
    }

    // ── Releases ───────────────────────────────────────────────────

    pub fn put_release(&self, release: &ReleaseRecord) -> StateResult<()> {
        self.put(RELEASES, &release.name, release)
    }

    pub fn get_release(&self, name: &str) -> StateResult<Option<ReleaseRecord>> {
        self.get(RELEASES, name)
    }

    pub fn list_releases(&self) -> StateResult<Vec<ReleaseRecord>> {
        self.scan(RELEASES, "")
    }

    pub fn delete_release(&self, name: &str) -> StateResult<bool> {
        self.remove(RELEASES, name)
    }

    pub fn put_release_version(&self, version: &ReleaseVersionRecord) -> StateResult<()> {
        self.put(RELEASE_VERSIONS, &version.table_key(), version)
    }

    pub fn get_release_version(
        &self,
        release: &str,
        version: &str,
    ) -> StateResult<Option<ReleaseVersionRecord>> {
        self.get(RELEASE_VERSIONS, &format!("{release}/{version}"))
    }

    pub fn list_release_versions(&self, release: &str) -> StateResult<Vec<ReleaseVersionRecord>> {
        self.scan(RELEASE_VERSIONS, &format!("{release}/"))
    }

    pub fn delete_release_version(&self, release: &str, version: &str) -> StateResult<bool> {
        self.remove(RELEASE_VERSIONS, &format!("{release}/{version}"))
    }

    pub fn put_package(&self, package: &PackageRecord) -> StateResult<()> {
        self.put(PACKAGES, &package.table_key(), package)
    }

    pub fn get_package(
        &self,
        release: &str,
        version: &str,
        name: &str,
    ) -> StateResult<Option<PackageRecord>> {
        self.get(PACKAGES, &format!("{release}/{version}/{name}"))
    }

    pub fn list_packages(&self, release: &str, version: &str) -> StateResult<Vec<PackageRecord>> {
        self.scan(PACKAGES, &format!("{release}/{version}/"))
    }

    pub fn put_template(&self, template: &TemplateRecord) -> StateResult<()> {
        self.put(TEMPLATES, &template.table_key(), template)
    }

    pub fn get_template(
        &self,
        release: &str,
        version: &str,
        name: &str,
    ) -> StateResult<Option<TemplateRecord>> {
        self.get(TEMPLATES, &format!("{release}/{version}/{name}"))
    }

    pub fn list_templates(&self, release: &str, version: &str) -> StateResult<Vec<TemplateRecord>> {
        self.scan(TEMPLATES, &format!("{release}/{version}/"))
    }

    /// Delete all packages and templates of a release version. Returns the
    /// number of rows removed.
    pub fn delete_release_version_content(
        &self,
        release: &str,
        version: &str,
    ) -> StateResult<u32> {
        let prefix = format!("{release}/{version}/");
        let packages = self.remove_prefix(PACKAGES, &prefix)?;
        let templates = self.remove_prefix(TEMPLATES, &prefix)?;
        Ok(packages + templates)
    }

    // ── Compiled packages ──────────────────────────────────────────

    pub fn put_compiled_package(&self, compiled: &CompiledPackageRecord) -> StateResult<()> {
        self.put(COMPILED_PACKAGES, &compiled.table_key(), compiled)
    }

    pub fn get_compiled_package(&self, key: &str) -> StateResult<Option<CompiledPackageRecord>> {
        self.get(COMPILED_PACKAGES, key)
    }

    // ── Stemcells ──────────────────────────────────────────────────

    pub fn put_stemcell(&self, stemcell: &StemcellRecord) -> StateResult<()> {
        self.put(STEMCELLS, &stemcell.table_key(), stemcell)
    }

    pub fn get_stemcell(&self, name: &str, version: &str) -> StateResult<Option<StemcellRecord>> {
        self.get(STEMCELLS, &format!("{name}/{version}"))
    }

    pub fn list_stemcells(&self) -> StateResult<Vec<StemcellRecord>> {
        self.scan(STEMCELLS, "")
    }

    pub fn delete_stemcell(&self, name: &str, version: &str) -> StateResult<bool> {
        self.remove(STEMCELLS, &format!("{name}/{version}"))
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &DeploymentRecord) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.name, deployment)
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.scan(DEPLOYMENTS, "")
    }

    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        self.remove(DEPLOYMENTS, name)
    }

    // ── VMs ────────────────────────────────────────────────────────

    pub fn put_vm(&self, vm: &VmRecord) -> StateResult<()> {
        self.put(VMS, &vm.table_key(), vm)
    }

    pub fn get_vm(&self, deployment: &str, cid: &str) -> StateResult<Option<VmRecord>> {
        self.get(VMS, &format!("{deployment}:{cid}"))
    }

    pub fn list_vms(&self, deployment: &str) -> StateResult<Vec<VmRecord>> {
        self.scan(VMS, &format!("{deployment}:"))
    }

    pub fn delete_vm(&self, deployment: &str, cid: &str) -> StateResult<bool> {
        self.remove(VMS, &format!("{deployment}:{cid}"))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    pub fn get_instance(
        &self,
        deployment: &str,
        job: &str,
        index: u32,
    ) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, &instance_key(deployment, job, index))
    }

    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<InstanceRecord>> {
        let mut instances: Vec<InstanceRecord> = self.scan(INSTANCES, &format!("{deployment}:"))?;
        instances.sort_by(|a, b| (&a.job, a.index).cmp(&(&b.job, b.index)));
        Ok(instances)
    }

    pub fn delete_instance(&self, deployment: &str, job: &str, index: u32) -> StateResult<bool> {
        self.remove(INSTANCES, &instance_key(deployment, job, index))
    }

    // ── Disks ──────────────────────────────────────────────────────

    pub fn put_disk(&self, disk: &DiskRecord) -> StateResult<()> {
        self.put(DISKS, &disk.table_key(), disk)
    }

    pub fn get_disk(&self, deployment: &str, cid: &str) -> StateResult<Option<DiskRecord>> {
        self.get(DISKS, &format!("{deployment}:{cid}"))
    }

    pub fn list_disks(&self, deployment: &str) -> StateResult<Vec<DiskRecord>> {
        self.scan(DISKS, &format!("{deployment}:"))
    }

    pub fn delete_disk(&self, deployment: &str, cid: &str) -> StateResult<bool> {
        self.remove(DISKS, &format!("{deployment}:{cid}"))
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Try to take a named lock. Succeeds when no row exists, the existing
    /// row is expired, or the caller already holds it (refreshing the
    /// expiry). Read-check-insert runs in one write transaction.
    pub fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let acquired;
        {
            let mut t = txn
                .open_table(LOCKS)
                .map_err(StateError::backend("open table"))?;
            let current: Option<LockRow> =
                match t.get(name).map_err(StateError::backend("read"))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?)
                    }
                    None => None,
                };
            let takeable = match &current {
                None => true,
                Some(row) => row.expires_at_ms <= now || row.holder == holder,
            };
            if takeable {
                let row = LockRow {
                    name: name.to_string(),
                    holder: holder.to_string(),
                    expires_at_ms: now + ttl.as_millis() as u64,
                };
                let bytes = serde_json::to_vec(&row).map_err(StateError::encode)?;
                t.insert(name, bytes.as_slice())
                    .map_err(StateError::backend("write"))?;
            }
            acquired = takeable;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(acquired)
    }

    /// Refresh the expiry of a held lock. Fails if the holder does not
    /// match (the lock expired and was taken over).
    pub fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let renewed;
        {
            let mut t = txn
                .open_table(LOCKS)
                .map_err(StateError::backend("open table"))?;
            let current: Option<LockRow> =
                match t.get(name).map_err(StateError::backend("read"))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?)
                    }
                    None => None,
                };
            match current {
                Some(mut row) if row.holder == holder => {
                    row.expires_at_ms = now + ttl.as_millis() as u64;
                    let bytes = serde_json::to_vec(&row).map_err(StateError::encode)?;
                    t.insert(name, bytes.as_slice())
                        .map_err(StateError::backend("write"))?;
                    renewed = true;
                }
                _ => renewed = false,
            }
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(renewed)
    }

    /// Delete the lock row only if the holder matches.
    pub fn release_lock(&self, name: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::txn)?;
        let released;
        {
            let mut t = txn
                .open_table(LOCKS)
                .map_err(StateError::backend("open table"))?;
            let matches = match t.get(name).map_err(StateError::backend("read"))? {
                Some(guard) => {
                    let row: LockRow =
                        serde_json::from_slice(guard.value()).map_err(StateError::corrupt)?;
                    row.holder == holder
                }
                None => false,
            };
            if matches {
                t.remove(name).map_err(StateError::backend("delete"))?;
            }
            released = matches;
        }
        txn.commit().map_err(StateError::txn)?;
        Ok(released)
    }

    pub fn get_lock(&self, name: &str) -> StateResult<Option<LockRow>> {
        self.get(LOCKS, name)
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
