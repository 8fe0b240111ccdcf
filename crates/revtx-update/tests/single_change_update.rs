//! End-to-end coverage of a single update: change insertion, record
//! rewrites, skipped clean changes, and engine misuse.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use revtx_core::change::{Change, ChangeStatus};
use revtx_core::index::ChangeIndexer;
use revtx_core::meta::{MemoryMetaStore, MetaStore};
use revtx_core::notify::RefUpdateListener;
use revtx_core::refs::{RefCommand, RefName};
use revtx_core::repo::{MemoryRepoStore, MemoryRepository, RepoStore, Repository};
use revtx_core::{
    AccountId, ChangeId, PatchSetId, Principal, ProjectName, RecordingIndexer, RecordingListener,
};
use revtx_update::{
    BatchUpdateOp, ChangeContext, ChangeResult, Context, Error, InsertChangeOp, RepoContext,
    RepoOnlyOp, Result, UpdateEngine,
};

fn project() -> ProjectName {
    ProjectName::new("acme/widgets").unwrap()
}

struct Fixture {
    store: Arc<MemoryRepoStore>,
    meta: Arc<MemoryMetaStore>,
    indexer: Arc<RecordingIndexer>,
    listener: Arc<RecordingListener>,
    engine: UpdateEngine,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryRepoStore::new());
    store.create(MemoryRepository::new(project())).unwrap();
    let meta = Arc::new(MemoryMetaStore::new());
    let indexer = Arc::new(RecordingIndexer::new());
    let listener = Arc::new(RecordingListener::new());
    let engine = UpdateEngine::new(
        Arc::clone(&store) as Arc<dyn RepoStore>,
        Arc::clone(&meta) as Arc<dyn MetaStore>,
        Arc::clone(&indexer) as Arc<dyn ChangeIndexer>,
    )
    .with_ref_listener(Arc::clone(&listener) as Arc<dyn RefUpdateListener>);
    Fixture {
        store,
        meta,
        indexer,
        listener,
        engine,
    }
}

/// Creates a change: stages its meta ref in the repository phase and
/// marks patch set 1 current in the change phase.
struct CreateChangeOp {
    id: ChangeId,
    owner: AccountId,
    posted: Arc<AtomicU32>,
}

#[async_trait]
impl RepoOnlyOp for CreateChangeOp {
    async fn update_repo(&self, ctx: &mut RepoContext<'_>) -> Result<()> {
        let payload = format!("change {} meta", self.id);
        let oid = ctx.inserter().await?.insert(payload.as_bytes())?;
        ctx.add_ref_update(RefCommand::create(RefName::change_meta(self.id), oid))?;
        Ok(())
    }

    async fn post_update(&self, _ctx: &Context) -> Result<()> {
        self.posted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BatchUpdateOp for CreateChangeOp {
    async fn update_change(&self, ctx: &mut ChangeContext) -> Result<bool> {
        assert!(ctx.is_new_change());
        let ps = PatchSetId::new(self.id, 1);
        ctx.update(ps)?
            .set_message("Uploaded patch set 1")
            .set_current_patch_set();
        Ok(true)
    }
}

#[async_trait]
impl InsertChangeOp for CreateChangeOp {
    async fn create_change(&self, ctx: &Context) -> Result<Change> {
        Ok(Change::new(
            self.id,
            ctx.project().clone(),
            "refs/heads/main",
            self.owner,
            "Add widgets",
            ctx.when(),
        ))
    }
}

/// Abandons an existing change without touching the repository.
struct AbandonOp;

#[async_trait]
impl RepoOnlyOp for AbandonOp {}

#[async_trait]
impl BatchUpdateOp for AbandonOp {
    async fn update_change(&self, ctx: &mut ChangeContext) -> Result<bool> {
        let ps = match ctx.change().current_patch_set {
            Some(ps) => ps,
            None => PatchSetId::new(ctx.change_id(), 1),
        };
        ctx.update(ps)?
            .set_message("Abandoned")
            .set_status(ChangeStatus::Abandoned);
        Ok(true)
    }
}

/// Flags the change for deletion but reports it clean.
struct CleanDeleteOp;

#[async_trait]
impl RepoOnlyOp for CleanDeleteOp {}

#[async_trait]
impl BatchUpdateOp for CleanDeleteOp {
    async fn update_change(&self, ctx: &mut ChangeContext) -> Result<bool> {
        ctx.delete_change();
        Ok(false)
    }
}

/// Touches nothing and reports the change clean.
struct NoopOp;

#[async_trait]
impl RepoOnlyOp for NoopOp {}

#[async_trait]
impl BatchUpdateOp for NoopOp {}

#[tokio::test]
async fn test_insert_change_end_to_end() {
    let fx = fixture();
    let id = ChangeId::new(4217);
    let posted = Arc::new(AtomicU32::new(0));
    let op = Arc::new(CreateChangeOp {
        id,
        owner: AccountId::new(1000),
        posted: Arc::clone(&posted),
    });

    let mut update = fx.engine.new_update(
        project(),
        Principal::Account(AccountId::new(1000)),
        Utc::now(),
    );
    update.set_ref_log_message("create change");
    update.insert_change(id, op).await.unwrap();
    update.execute(false).await.unwrap();

    // The record is written with the staged delta applied.
    let change = fx.meta.change(&project(), id).unwrap();
    assert_eq!(change.current_patch_set, Some(PatchSetId::new(id, 1)));
    assert_eq!(change.status, ChangeStatus::New);
    assert_eq!(
        update.change_results().get(&id),
        Some(&ChangeResult::Upserted)
    );

    // The meta ref committed.
    let repo = fx.store.repo(&project()).unwrap();
    assert!(repo
        .get_ref(&RefName::change_meta(id))
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        update.successfully_updated_refs(),
        vec![RefName::change_meta(id)]
    );

    // Every post-commit effect fired exactly once.
    assert_eq!(fx.indexer.indexed(), vec![(project(), id)]);
    assert_eq!(posted.load(Ordering::SeqCst), 1);
    let fired = fx.listener.fired();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].1, Some(AccountId::new(1000)));
    assert_eq!(fired[0].0.ref_log_message, "create change");
}

#[tokio::test]
async fn test_rewrite_existing_change() {
    let fx = fixture();
    let id = ChangeId::new(9);
    let mut seeded = Change::new(
        id,
        project(),
        "refs/heads/main",
        AccountId::new(1000),
        "Old subject",
        Utc::now(),
    );
    seeded.current_patch_set = Some(PatchSetId::new(id, 3));
    fx.meta.put_change(seeded);

    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.add_op(id, Arc::new(AbandonOp));
    update.execute(false).await.unwrap();

    let change = fx.meta.change(&project(), id).unwrap();
    assert_eq!(change.status, ChangeStatus::Abandoned);
    assert_eq!(fx.indexer.indexed(), vec![(project(), id)]);
    // No ref commands were staged, so no ref notification fires.
    assert!(fx.listener.fired().is_empty());
}

#[tokio::test]
async fn test_clean_change_is_skipped() {
    let fx = fixture();
    let id = ChangeId::new(5);
    fx.meta.put_change(Change::new(
        id,
        project(),
        "refs/heads/main",
        AccountId::new(1000),
        "Subject",
        Utc::now(),
    ));
    let before = fx.meta.change(&project(), id).unwrap();

    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.add_op(id, Arc::new(NoopOp));
    update.execute(false).await.unwrap();

    assert_eq!(
        update.change_results().get(&id),
        Some(&ChangeResult::Skipped)
    );
    assert_eq!(fx.meta.change(&project(), id).unwrap(), before);
    assert!(fx.indexer.indexed().is_empty());
}

#[tokio::test]
async fn test_deletion_flag_without_dirty_is_skipped() {
    let fx = fixture();
    let id = ChangeId::new(6);
    fx.meta.put_change(Change::new(
        id,
        project(),
        "refs/heads/main",
        AccountId::new(1000),
        "Subject",
        Utc::now(),
    ));

    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.add_op(id, Arc::new(CleanDeleteOp));
    update.execute(false).await.unwrap();

    // No operation dirtied the change, so the deletion flag is discarded.
    assert_eq!(
        update.change_results().get(&id),
        Some(&ChangeResult::Skipped)
    );
    assert!(fx.meta.change(&project(), id).is_some());
    assert!(fx.indexer.deleted().is_empty());
}

#[tokio::test]
async fn test_missing_change_is_caller_error() {
    let fx = fixture();
    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.add_op(ChangeId::new(404), Arc::new(AbandonOp));
    let err = update.execute(false).await.expect_err("missing change");
    assert!(matches!(err, Error::Caller { .. }));
}

#[tokio::test]
async fn test_update_cannot_be_reused() {
    let fx = fixture();
    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.execute(false).await.unwrap();
    let err = update.execute(false).await.expect_err("reused");
    assert!(matches!(err, Error::Caller { .. }));
}

#[tokio::test]
async fn test_double_insert_is_rejected_eagerly() {
    let fx = fixture();
    let id = ChangeId::new(1);
    let posted = Arc::new(AtomicU32::new(0));
    let op = Arc::new(CreateChangeOp {
        id,
        owner: AccountId::new(1000),
        posted,
    });

    let mut update = fx.engine.new_update(project(), Principal::Server, Utc::now());
    update.insert_change(id, Arc::clone(&op)).await.unwrap();
    let err = update
        .insert_change(id, op)
        .await
        .map(|_| ())
        .expect_err("double insert");
    assert!(matches!(err, Error::Caller { .. }));
}
