//! Cascading unlock of dependent work items after a release.
//!
//! The status store is the only state shared between concurrently running
//! pipelines. Marking an item complete and claiming the dependents it
//! unblocks happen under one lock, so a dependent whose prerequisites are
//! released at the same time is claimed by exactly one of them. The file
//! store extends that lock across processes.

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::observer::{NoopObserver, PipelineObserver};
use crate::vcs::WorkItemId;

#[derive(Debug, Error, PartialEq)]
pub enum DependencyError {
    #[error("Work item {0} lists itself as a prerequisite")]
    SelfDependency(WorkItemId),

    #[error("Dependency cycle through work item {0}")]
    Cycle(WorkItemId),

    #[error("Status store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Work item → the set of items that must be released before it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    prerequisites: BTreeMap<WorkItemId, BTreeSet<WorkItemId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `item -> [prerequisite, ...]`, rejecting self-references
    /// and cycles.
    pub fn from_map(map: &HashMap<String, Vec<String>>) -> Result<Self, DependencyError> {
        let mut graph = Self::new();
        for (item, prerequisites) in map {
            graph.add(
                WorkItemId::new(item.as_str()),
                prerequisites.iter().map(|p| WorkItemId::new(p.as_str())),
            )?;
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn add(
        &mut self,
        item: WorkItemId,
        prerequisites: impl IntoIterator<Item = WorkItemId>,
    ) -> Result<(), DependencyError> {
        let prerequisites: BTreeSet<WorkItemId> = prerequisites.into_iter().collect();
        if prerequisites.contains(&item) {
            return Err(DependencyError::SelfDependency(item));
        }
        self.prerequisites.entry(item).or_default().extend(prerequisites);
        Ok(())
    }

    pub fn prerequisites(&self, item: &WorkItemId) -> Option<&BTreeSet<WorkItemId>> {
        self.prerequisites.get(item)
    }

    /// Items that list `item` as a prerequisite.
    pub fn dependents<'a>(&'a self, item: &'a WorkItemId) -> impl Iterator<Item = &'a WorkItemId> + 'a {
        self.prerequisites
            .iter()
            .filter(move |(_, prereqs)| prereqs.contains(item))
            .map(|(dependent, _)| dependent)
    }

    pub fn len(&self) -> usize {
        self.prerequisites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty()
    }

    fn check_acyclic(&self) -> Result<(), DependencyError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            item: &'a WorkItemId,
            marks: &mut HashMap<&'a WorkItemId, Mark>,
        ) -> Result<(), DependencyError> {
            match marks.get(item) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(DependencyError::Cycle(item.clone())),
                None => {}
            }
            marks.insert(item, Mark::Visiting);
            if let Some(prereqs) = graph.prerequisites.get(item) {
                for prereq in prereqs {
                    visit(graph, prereq, marks)?;
                }
            }
            marks.insert(item, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for item in self.prerequisites.keys() {
            visit(self, item, &mut marks)?;
        }
        Ok(())
    }
}

/// A dependent whose prerequisites are now all released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnblockedItem {
    pub work_item: WorkItemId,
    pub prerequisites: Vec<WorkItemId>,
}

/// Shared record of which work items are complete and which dependents
/// have already been signalled as ready.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Mark `item` complete and, in the same atomic step, claim every
    /// dependent whose prerequisites are now all complete and which has not
    /// been claimed before. Releasing an item twice claims nothing new.
    async fn mark_complete(&self, item: &WorkItemId) -> Result<Vec<UnblockedItem>, DependencyError>;

    /// Dependents of `item` whose prerequisites are all complete, whether
    /// or not they have been claimed. Read-only.
    async fn query_unblocked(&self, item: &WorkItemId) -> Result<Vec<WorkItemId>, DependencyError>;
}

/// Completion record shared by both stores. Only the two sets are
/// persisted; the graph always comes from configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(skip)]
    graph: DependencyGraph,
    #[serde(default)]
    completed: BTreeSet<WorkItemId>,
    #[serde(default)]
    triggered: BTreeSet<WorkItemId>,
}

impl StoreState {
    fn satisfied(&self, item: &WorkItemId) -> bool {
        self.graph
            .prerequisites(item)
            .map(|prereqs| prereqs.iter().all(|p| self.completed.contains(p)))
            .unwrap_or(true)
    }

    fn mark_complete(&mut self, item: &WorkItemId) -> Vec<UnblockedItem> {
        if !self.completed.insert(item.clone()) {
            debug!(%item, "already complete");
            return Vec::new();
        }
        // A released item never needs a ready signal of its own.
        self.triggered.insert(item.clone());

        let candidates: Vec<WorkItemId> = self.graph.dependents(item).cloned().collect();
        let mut unblocked = Vec::new();
        for dependent in candidates {
            if self.triggered.contains(&dependent) || !self.satisfied(&dependent) {
                continue;
            }
            self.triggered.insert(dependent.clone());
            let prerequisites = self
                .graph
                .prerequisites(&dependent)
                .map(|p| p.iter().cloned().collect())
                .unwrap_or_default();
            unblocked.push(UnblockedItem {
                work_item: dependent,
                prerequisites,
            });
        }
        unblocked
    }

    fn unblocked_by(&self, item: &WorkItemId) -> Vec<WorkItemId> {
        self.graph
            .dependents(item)
            .filter(|d| !self.completed.contains(*d) && self.satisfied(d))
            .cloned()
            .collect()
    }
}

/// Process-local status store guarded by a single mutex. The lock is never
/// held across an await point.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    state: Mutex<StoreState>,
}

impl InMemoryStatusStore {
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            state: Mutex::new(StoreState {
                graph,
                ..StoreState::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreState>, DependencyError> {
        self.state
            .lock()
            .map_err(|_| DependencyError::StoreUnavailable("status lock poisoned".to_string()))
    }

    pub fn is_complete(&self, item: &WorkItemId) -> Result<bool, DependencyError> {
        Ok(self.lock()?.completed.contains(item))
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn mark_complete(&self, item: &WorkItemId) -> Result<Vec<UnblockedItem>, DependencyError> {
        Ok(self.lock()?.mark_complete(item))
    }

    async fn query_unblocked(&self, item: &WorkItemId) -> Result<Vec<WorkItemId>, DependencyError> {
        Ok(self.lock()?.unblocked_by(item))
    }
}

/// Status store kept in a JSON file, so completions survive between
/// `release` runs. Every read-modify-write holds an exclusive lock on a
/// sibling `.lock` file, which serialises concurrent processes; the record
/// itself is replaced atomically.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
    graph: Arc<DependencyGraph>,
}

impl FileStatusStore {
    pub fn new(path: impl Into<PathBuf>, graph: DependencyGraph) -> Self {
        Self {
            path: path.into(),
            graph: Arc::new(graph),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the stored record under the file lock, writing the record
    /// back when `f` reports a change.
    async fn with_state<T, F>(&self, f: F) -> Result<T, DependencyError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreState) -> (T, bool) + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_state_blocking(f))
            .await
            .map_err(|e| DependencyError::StoreUnavailable(format!("status store task failed: {e}")))?
    }

    fn with_state_blocking<T, F>(&self, f: F) -> Result<T, DependencyError>
    where
        F: FnOnce(&mut StoreState) -> (T, bool),
    {
        let _lock = self.acquire_lock()?;
        let mut state = self.read()?;
        state.graph = DependencyGraph::clone(&self.graph);
        let (value, changed) = f(&mut state);
        if changed {
            self.write(&state)?;
        }
        Ok(value)
    }

    fn unavailable(&self, action: &str, err: impl std::fmt::Display) -> DependencyError {
        DependencyError::StoreUnavailable(format!("failed to {action} {}: {err}", self.path.display()))
    }

    fn parent_dir(&self) -> Result<PathBuf, DependencyError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| self.unavailable("create the directory for", e))?;
        Ok(parent)
    }

    fn acquire_lock(&self) -> Result<File, DependencyError> {
        self.parent_dir()?;
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| self.unavailable("open the lock for", e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| self.unavailable("lock", e))?;
        Ok(lock_file)
    }

    fn read(&self) -> Result<StoreState, DependencyError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| self.unavailable("parse", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(self.unavailable("read", e)),
        }
    }

    fn write(&self, state: &StoreState) -> Result<(), DependencyError> {
        let parent = self.parent_dir()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| self.unavailable("stage", e))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), state).map_err(|e| self.unavailable("serialize", e))?;
        tmp.as_file_mut()
            .flush()
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| self.unavailable("write", e))?;
        tmp.persist(&self.path).map_err(|e| self.unavailable("replace", e))?;
        debug!(path = %self.path.display(), completed = state.completed.len(), "status record saved");
        Ok(())
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn mark_complete(&self, item: &WorkItemId) -> Result<Vec<UnblockedItem>, DependencyError> {
        let item = item.clone();
        self.with_state(move |state| {
            let newly_complete = !state.completed.contains(&item);
            (state.mark_complete(&item), newly_complete)
        })
        .await
    }

    async fn query_unblocked(&self, item: &WorkItemId) -> Result<Vec<WorkItemId>, DependencyError> {
        let item = item.clone();
        self.with_state(move |state| (state.unblocked_by(&item), false)).await
    }
}

/// Emits ready signals for work items unblocked by a release.
pub struct DependencyTrigger {
    store: Arc<dyn StatusStore>,
    observer: Arc<dyn PipelineObserver>,
}

impl DependencyTrigger {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[instrument(skip(self), fields(work_item = %work_item))]
    pub async fn on_released(&self, work_item: &WorkItemId) -> Result<Vec<UnblockedItem>, DependencyError> {
        let unblocked = self.store.mark_complete(work_item).await?;
        for item in &unblocked {
            self.observer.item_ready(item);
        }
        info!(unblocked = unblocked.len(), "dependency trigger complete");
        Ok(unblocked)
    }
}
