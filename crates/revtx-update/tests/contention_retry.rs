//! Retry of a batch that loses the compare-and-swap race: the whole
//! action is rebuilt and rerun, and post-commit effects fire exactly once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use revtx_core::change::Change;
use revtx_core::index::ChangeIndexer;
use revtx_core::meta::{MemoryMetaStore, MetaStore};
use revtx_core::refs::{RefCommand, RefName};
use revtx_core::repo::{MemoryRepoStore, MemoryRepository, RepoStore, Repository};
use revtx_core::{AccountId, ChangeId, PatchSetId, Principal, ProjectName, RecordingIndexer};
use revtx_update::{
    BatchUpdateOp, ChangeContext, Context, InsertChangeOp, RepoContext, RepoOnlyOp, Result,
    RetryConfig, RetryHelper, UpdateEngine,
};

fn project() -> ProjectName {
    ProjectName::new("acme/widgets").unwrap()
}

struct CreateChangeOp {
    id: ChangeId,
}

#[async_trait]
impl RepoOnlyOp for CreateChangeOp {
    async fn update_repo(&self, ctx: &mut RepoContext<'_>) -> Result<()> {
        let oid = ctx.inserter().await?.insert(b"meta")?;
        ctx.add_ref_update(RefCommand::create(RefName::change_meta(self.id), oid))?;
        Ok(())
    }
}

#[async_trait]
impl BatchUpdateOp for CreateChangeOp {
    async fn update_change(&self, ctx: &mut ChangeContext) -> Result<bool> {
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

fn fast_config() -> RetryConfig {
    RetryConfig {
        fused: true,
        max_wait_ms: 2_000,
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
        jitter_cap_ms: 1,
    }
}

#[tokio::test]
async fn test_contended_batch_retries_and_succeeds() {
    let store = Arc::new(MemoryRepoStore::new());
    let repo = store.create(MemoryRepository::new(project())).unwrap();
    let meta = Arc::new(MemoryMetaStore::new());
    let indexer = Arc::new(RecordingIndexer::new());
    let engine = Arc::new(UpdateEngine::new(
        Arc::clone(&store) as Arc<dyn RepoStore>,
        Arc::clone(&meta) as Arc<dyn MetaStore>,
        Arc::clone(&indexer) as Arc<dyn ChangeIndexer>,
    ));

    // A concurrent writer wins the first attempt.
    repo.inject_lock_failures(1);

    let id = ChangeId::new(21);
    let attempts = Arc::new(AtomicU32::new(0));
    let helper = RetryHelper::new(Arc::clone(&engine), fast_config());

    let seen = Arc::clone(&attempts);
    helper
        .execute("create-change", move |engine| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let mut update = engine.new_update(project(), Principal::Server, Utc::now());
                update
                    .insert_change(id, Arc::new(CreateChangeOp { id }))
                    .await?;
                update.execute(false).await
            }
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Exactly one committed result, despite two attempts.
    assert!(meta.change(&project(), id).is_some());
    assert_eq!(indexer.indexed(), vec![(project(), id)]);
    assert!(repo
        .get_ref(&RefName::change_meta(id))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_unfused_contention_surfaces_immediately() {
    let store = Arc::new(MemoryRepoStore::new());
    let repo = store.create(MemoryRepository::new(project())).unwrap();
    let meta = Arc::new(MemoryMetaStore::new());
    let indexer = Arc::new(RecordingIndexer::new());
    let engine = Arc::new(UpdateEngine::new(
        Arc::clone(&store) as Arc<dyn RepoStore>,
        Arc::clone(&meta) as Arc<dyn MetaStore>,
        Arc::clone(&indexer) as Arc<dyn ChangeIndexer>,
    ));

    repo.inject_lock_failures(1);

    let mut config = fast_config();
    config.fused = false;
    let helper = RetryHelper::new(engine, config);

    let id = ChangeId::new(22);
    let err = helper
        .execute("create-change", move |engine| async move {
            let mut update = engine.new_update(project(), Principal::Server, Utc::now());
            update
                .insert_change(id, Arc::new(CreateChangeOp { id }))
                .await?;
            update.execute(false).await
        })
        .await
        .expect_err("not retryable in split mode");

    assert!(err.is_lock_failure());
    assert!(meta.change(&project(), id).is_none());
    assert!(indexer.indexed().is_empty());
}
