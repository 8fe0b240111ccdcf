//! Repository storage abstraction and the in-memory backend.
//!
//! A [`Repository`] exposes ref reads, object insertion, object walking,
//! and atomic batch execution of [`RefCommand`]s. The in-memory backend is
//! the default for tests and single-process deployments; production
//! deployments plug in their own [`RepoStore`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::id::ProjectName;
use crate::refs::{CommandResult, ObjectId, RefCommand, RefName};

/// Opens repositories by project name.
#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Opens the repository for a project.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if the project does not exist.
    async fn open(&self, project: &ProjectName) -> Result<Arc<dyn Repository>>;
}

/// Writes objects into a repository's object store.
///
/// Inserted objects are buffered until [`flush`](ObjectInserter::flush) is
/// called; unflushed objects are not visible to ref commands.
pub trait ObjectInserter: Send {
    /// Buffers an object and returns its content address.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be staged.
    fn insert(&mut self, data: &[u8]) -> Result<ObjectId>;

    /// Makes all buffered objects durable and visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the objects cannot be written.
    fn flush(&mut self) -> Result<()>;
}

/// Reads objects from a repository's object store.
///
/// A walker opened from an inserter's repository also sees that inserter's
/// unflushed objects, so staged state can be validated before commit.
pub trait RevWalk: Send {
    /// Reads an object's payload by content address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if no such object exists.
    fn object(&self, id: &ObjectId) -> Result<Bytes>;

    /// Returns whether an object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    fn exists(&self, id: &ObjectId) -> Result<bool>;
}

/// A single project's ref and object storage.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns the project this repository belongs to.
    fn project(&self) -> &ProjectName;

    /// Resolves a ref to its current value, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    async fn get_ref(&self, name: &RefName) -> Result<Option<ObjectId>>;

    /// Lists all refs whose names start with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    async fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, ObjectId)>>;

    /// Creates an object inserter for this repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the object store cannot be opened for writing.
    fn new_inserter(&self) -> Result<Box<dyn ObjectInserter>>;

    /// Creates an object reader that also sees objects staged by inserters
    /// on this repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the object store cannot be opened for reading.
    fn new_rev_walk(&self) -> Result<Box<dyn RevWalk>>;

    /// Returns whether batch execution is all-or-nothing on this backend.
    fn supports_atomic_batch(&self) -> bool;

    /// Executes a batch of compare-and-swap ref commands.
    ///
    /// On an atomic backend either every command applies or none does; a
    /// losing command gets [`CommandResult::LockFailure`] and its siblings
    /// get [`CommandResult::TransactionAborted`]. On a non-atomic backend
    /// commands apply sequentially until the first failure, and remaining
    /// commands get [`CommandResult::NotAttempted`].
    ///
    /// The returned vector is parallel to `commands`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the batch could not be attempted at all;
    /// per-command failures are reported in the result vector.
    async fn execute_batch(&self, commands: &[RefCommand]) -> Result<Vec<CommandResult>>;
}

#[derive(Debug, Default)]
struct RepoState {
    refs: BTreeMap<RefName, ObjectId>,
    objects: HashMap<ObjectId, Bytes>,
    pending: HashMap<ObjectId, Bytes>,
}

/// In-memory repository used by tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryRepository {
    project: ProjectName,
    state: Arc<RwLock<RepoState>>,
    atomic: bool,
    lock_failures: AtomicU32,
}

impl MemoryRepository {
    /// Creates an empty repository for a project with atomic batches.
    #[must_use]
    pub fn new(project: ProjectName) -> Self {
        Self::with_atomicity(project, true)
    }

    /// Creates an empty repository with explicit batch atomicity.
    #[must_use]
    pub fn with_atomicity(project: ProjectName, atomic: bool) -> Self {
        Self {
            project,
            state: Arc::new(RwLock::new(RepoState::default())),
            atomic,
            lock_failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` batch executions fail every command with
    /// [`CommandResult::LockFailure`], simulating concurrent writers.
    pub fn inject_lock_failures(&self, count: u32) {
        self.lock_failures.store(count, Ordering::SeqCst);
    }

    /// Writes a ref directly, bypassing compare-and-swap. Test setup only.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn set_ref(&self, name: RefName, value: ObjectId) -> Result<()> {
        let mut state = self.state.write().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        state.refs.insert(name, value);
        Ok(())
    }

    /// Writes an object directly. Test setup only.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn put_object(&self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::hash(data);
        let mut state = self.state.write().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        state.objects.insert(id, Bytes::copy_from_slice(data));
        Ok(id)
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, RepoState>> {
        self.state.read().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, RepoState>> {
        self.state.write().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })
    }

    /// Checks one command against current state without applying it.
    fn check(state: &RepoState, cmd: &RefCommand) -> CommandResult {
        let current = state.refs.get(&cmd.name).copied();
        if current != cmd.old {
            return CommandResult::LockFailure;
        }
        if let Some(new) = &cmd.new {
            if !state.objects.contains_key(new) {
                return CommandResult::Rejected(format!("missing object {new}"));
            }
        }
        CommandResult::Ok
    }

    fn apply(state: &mut RepoState, cmd: &RefCommand) {
        match &cmd.new {
            Some(new) => {
                state.refs.insert(cmd.name.clone(), *new);
            }
            None => {
                state.refs.remove(&cmd.name);
            }
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn project(&self) -> &ProjectName {
        &self.project
    }

    async fn get_ref(&self, name: &RefName) -> Result<Option<ObjectId>> {
        Ok(self.read_state()?.refs.get(name).copied())
    }

    async fn list_refs(&self, prefix: &str) -> Result<Vec<(RefName, ObjectId)>> {
        Ok(self
            .read_state()?
            .refs
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(prefix))
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    fn new_inserter(&self) -> Result<Box<dyn ObjectInserter>> {
        Ok(Box::new(MemoryInserter {
            state: Arc::clone(&self.state),
            buffered: Vec::new(),
        }))
    }

    fn new_rev_walk(&self) -> Result<Box<dyn RevWalk>> {
        Ok(Box::new(MemoryRevWalk {
            state: Arc::clone(&self.state),
        }))
    }

    fn supports_atomic_batch(&self) -> bool {
        self.atomic
    }

    async fn execute_batch(&self, commands: &[RefCommand]) -> Result<Vec<CommandResult>> {
        let mut state = self.write_state()?;

        if self.lock_failures.load(Ordering::SeqCst) > 0 {
            self.lock_failures.fetch_sub(1, Ordering::SeqCst);
            return Ok(vec![CommandResult::LockFailure; commands.len()]);
        }

        if self.atomic {
            let results: Vec<_> = commands.iter().map(|c| Self::check(&state, c)).collect();
            if results.iter().all(CommandResult::is_ok) {
                for cmd in commands {
                    Self::apply(&mut state, cmd);
                }
                return Ok(results);
            }
            // Nothing applies; commands that would have succeeded report
            // the sibling abort.
            return Ok(results
                .into_iter()
                .map(|r| {
                    if r.is_ok() {
                        CommandResult::TransactionAborted
                    } else {
                        r
                    }
                })
                .collect());
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut failed = false;
        for cmd in commands {
            if failed {
                results.push(CommandResult::NotAttempted);
                continue;
            }
            let result = Self::check(&state, cmd);
            if result.is_ok() {
                Self::apply(&mut state, cmd);
            } else {
                failed = true;
            }
            results.push(result);
        }
        Ok(results)
    }
}

struct MemoryInserter {
    state: Arc<RwLock<RepoState>>,
    buffered: Vec<(ObjectId, Bytes)>,
}

impl ObjectInserter for MemoryInserter {
    fn insert(&mut self, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::hash(data);
        let bytes = Bytes::copy_from_slice(data);
        let mut state = self.state.write().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        state.pending.insert(id, bytes.clone());
        self.buffered.push((id, bytes));
        Ok(id)
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = self.state.write().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        for (id, bytes) in self.buffered.drain(..) {
            state.pending.remove(&id);
            state.objects.insert(id, bytes);
        }
        Ok(())
    }
}

struct MemoryRevWalk {
    state: Arc<RwLock<RepoState>>,
}

impl RevWalk for MemoryRevWalk {
    fn object(&self, id: &ObjectId) -> Result<Bytes> {
        let state = self.state.read().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        state
            .objects
            .get(id)
            .or_else(|| state.pending.get(id))
            .cloned()
            .ok_or_else(|| Error::resource_not_found("object", id.to_string()))
    }

    fn exists(&self, id: &ObjectId) -> Result<bool> {
        let state = self.state.read().map_err(|e| Error::Storage {
            message: format!("repository lock poisoned: {e}"),
            source: None,
        })?;
        Ok(state.objects.contains_key(id) || state.pending.contains_key(id))
    }
}

/// In-memory [`RepoStore`] keyed by project name.
#[derive(Debug, Default)]
pub struct MemoryRepoStore {
    repos: RwLock<HashMap<ProjectName, Arc<MemoryRepository>>>,
}

impl MemoryRepoStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a project's repository, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn create(&self, repo: MemoryRepository) -> Result<Arc<MemoryRepository>> {
        let repo = Arc::new(repo);
        let mut repos = self.repos.write().map_err(|e| Error::Storage {
            message: format!("repo store lock poisoned: {e}"),
            source: None,
        })?;
        repos.insert(repo.project().clone(), Arc::clone(&repo));
        Ok(repo)
    }

    /// Returns the concrete memory repository for a project. Test helper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if the project does not exist.
    pub fn repo(&self, project: &ProjectName) -> Result<Arc<MemoryRepository>> {
        let repos = self.repos.read().map_err(|e| Error::Storage {
            message: format!("repo store lock poisoned: {e}"),
            source: None,
        })?;
        repos
            .get(project)
            .cloned()
            .ok_or_else(|| Error::resource_not_found("project", project.as_str()))
    }
}

#[async_trait]
impl RepoStore for MemoryRepoStore {
    async fn open(&self, project: &ProjectName) -> Result<Arc<dyn Repository>> {
        Ok(self.repo(project)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectName {
        ProjectName::new("demo/project").unwrap()
    }

    fn ref_name(s: &str) -> RefName {
        RefName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_read_ref() {
        let repo = MemoryRepository::new(project());
        let oid = repo.put_object(b"payload").unwrap();
        let results = repo
            .execute_batch(&[RefCommand::create(ref_name("refs/heads/main"), oid)])
            .await
            .unwrap();
        assert_eq!(results, vec![CommandResult::Ok]);
        assert_eq!(
            repo.get_ref(&ref_name("refs/heads/main")).await.unwrap(),
            Some(oid)
        );
    }

    #[tokio::test]
    async fn test_stale_old_value_is_lock_failure() {
        let repo = MemoryRepository::new(project());
        let current = repo.put_object(b"current").unwrap();
        let stale = repo.put_object(b"stale").unwrap();
        let next = repo.put_object(b"next").unwrap();
        repo.set_ref(ref_name("refs/heads/main"), current).unwrap();

        let results = repo
            .execute_batch(&[RefCommand::update(ref_name("refs/heads/main"), stale, next)])
            .await
            .unwrap();
        assert_eq!(results, vec![CommandResult::LockFailure]);
        assert_eq!(
            repo.get_ref(&ref_name("refs/heads/main")).await.unwrap(),
            Some(current)
        );
    }

    #[tokio::test]
    async fn test_atomic_batch_aborts_siblings() {
        let repo = MemoryRepository::new(project());
        let oid = repo.put_object(b"payload").unwrap();
        let current = repo.put_object(b"current").unwrap();
        repo.set_ref(ref_name("refs/heads/exists"), current).unwrap();

        // Second command loses the race (ref already exists).
        let results = repo
            .execute_batch(&[
                RefCommand::create(ref_name("refs/heads/ok"), oid),
                RefCommand::create(ref_name("refs/heads/exists"), oid),
            ])
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![CommandResult::TransactionAborted, CommandResult::LockFailure]
        );
        assert_eq!(repo.get_ref(&ref_name("refs/heads/ok")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_atomic_batch_applies_prefix() {
        let repo = MemoryRepository::with_atomicity(project(), false);
        let oid = repo.put_object(b"payload").unwrap();
        let current = repo.put_object(b"current").unwrap();
        repo.set_ref(ref_name("refs/heads/exists"), current).unwrap();

        let results = repo
            .execute_batch(&[
                RefCommand::create(ref_name("refs/heads/first"), oid),
                RefCommand::create(ref_name("refs/heads/exists"), oid),
                RefCommand::create(ref_name("refs/heads/last"), oid),
            ])
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![
                CommandResult::Ok,
                CommandResult::LockFailure,
                CommandResult::NotAttempted,
            ]
        );
        assert_eq!(
            repo.get_ref(&ref_name("refs/heads/first")).await.unwrap(),
            Some(oid)
        );
        assert_eq!(repo.get_ref(&ref_name("refs/heads/last")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_object_is_rejected() {
        let repo = MemoryRepository::new(project());
        let missing = ObjectId::hash(b"never inserted");
        let results = repo
            .execute_batch(&[RefCommand::create(ref_name("refs/heads/main"), missing)])
            .await
            .unwrap();
        assert!(matches!(results[0], CommandResult::Rejected(_)));
    }

    #[tokio::test]
    async fn test_injected_lock_failure_clears() {
        let repo = MemoryRepository::new(project());
        let oid = repo.put_object(b"payload").unwrap();
        repo.inject_lock_failures(1);

        let cmd = RefCommand::create(ref_name("refs/heads/main"), oid);
        let first = repo.execute_batch(std::slice::from_ref(&cmd)).await.unwrap();
        assert_eq!(first, vec![CommandResult::LockFailure]);

        let second = repo.execute_batch(&[cmd]).await.unwrap();
        assert_eq!(second, vec![CommandResult::Ok]);
    }

    #[test]
    fn test_walker_sees_unflushed_objects() {
        let repo = MemoryRepository::new(project());
        let mut inserter = repo.new_inserter().unwrap();
        let id = inserter.insert(b"staged").unwrap();

        let walk = repo.new_rev_walk().unwrap();
        assert!(walk.exists(&id).unwrap());
        assert_eq!(walk.object(&id).unwrap(), Bytes::from_static(b"staged"));

        inserter.flush().unwrap();
        assert!(walk.exists(&id).unwrap());
    }

    #[tokio::test]
    async fn test_store_opens_created_repo() {
        let store = MemoryRepoStore::new();
        store.create(MemoryRepository::new(project())).unwrap();
        let repo = store.open(&project()).await.unwrap();
        assert_eq!(repo.project(), &project());

        let missing = ProjectName::new("missing").unwrap();
        assert!(store.open(&missing).await.is_err());
    }
}
