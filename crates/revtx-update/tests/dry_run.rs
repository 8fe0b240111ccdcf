//! Dry-run execution: every phase runs, nothing commits, no post-commit
//! effect fires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use revtx_core::change::Change;
use revtx_core::index::ChangeIndexer;
use revtx_core::meta::{MemoryMetaStore, MetaStore};
use revtx_core::notify::RefUpdateListener;
use revtx_core::refs::{RefCommand, RefName};
use revtx_core::repo::{MemoryRepoStore, MemoryRepository, RepoStore, Repository};
use revtx_core::{
    AccountId, ChangeId, PatchSetId, Principal, ProjectName, RecordingIndexer, RecordingListener,
};
use revtx_update::{
    BatchUpdateOp, ChangeContext, ChangeResult, Context, InsertChangeOp, RepoContext, RepoOnlyOp,
    Result, UpdateEngine,
};

fn project() -> ProjectName {
    ProjectName::new("acme/widgets").unwrap()
}

struct CreateChangeOp {
    id: ChangeId,
    ran_repo: Arc<AtomicU32>,
    ran_change: Arc<AtomicU32>,
    posted: Arc<AtomicU32>,
}

#[async_trait]
impl RepoOnlyOp for CreateChangeOp {
    async fn update_repo(&self, ctx: &mut RepoContext<'_>) -> Result<()> {
        self.ran_repo.fetch_add(1, Ordering::SeqCst);
        let oid = ctx.inserter().await?.insert(b"meta")?;
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
        self.ran_change.fetch_add(1, Ordering::SeqCst);
        ctx.update(PatchSetId::new(self.id, 1))?
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
            AccountId::new(1000),
            "Add widgets",
            ctx.when(),
        ))
    }
}

#[tokio::test]
async fn test_dry_run_commits_and_fires_nothing() {
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

    let id = ChangeId::new(11);
    let ran_repo = Arc::new(AtomicU32::new(0));
    let ran_change = Arc::new(AtomicU32::new(0));
    let posted = Arc::new(AtomicU32::new(0));
    let op = Arc::new(CreateChangeOp {
        id,
        ran_repo: Arc::clone(&ran_repo),
        ran_change: Arc::clone(&ran_change),
        posted: Arc::clone(&posted),
    });

    let mut update = engine.new_update(project(), Principal::Server, Utc::now());
    update.insert_change(id, op).await.unwrap();
    update.execute(true).await.unwrap();

    // Both storage phases ran.
    assert_eq!(ran_repo.load(Ordering::SeqCst), 1);
    assert_eq!(ran_change.load(Ordering::SeqCst), 1);

    // The staged work is reported as if it had applied.
    assert_eq!(
        update.change_results().get(&id),
        Some(&ChangeResult::Upserted)
    );
    let summary = update.ref_update_summary().unwrap();
    assert!(summary.all_ok());
    assert!(!summary.is_empty());

    // Nothing actually committed and no post-commit effect fired.
    let repo = store.repo(&project()).unwrap();
    assert!(repo
        .get_ref(&RefName::change_meta(id))
        .await
        .unwrap()
        .is_none());
    assert!(meta.change(&project(), id).is_none());
    assert!(indexer.indexed().is_empty());
    assert!(listener.fired().is_empty());
    assert_eq!(posted.load(Ordering::SeqCst), 0);
}
