//! End-to-end scenarios for the write-behind pipeline.

mod common;

use std::sync::Arc;

use common::{employer, ScriptedRepository, TestContext, DLQ, STREAM};
use wbs_stream::dead_letter::{
    CONSUMER_NAME_FIELD, ERROR_FIELD, GROUP_NAME_FIELD, ORIGINAL_ENTRY_ID_FIELD,
    ORIGINAL_STREAM_KEY_FIELD,
};
use wbs_stream::entry::CONTENT_FIELD;
use wbs_stream::Operation;

#[tokio::test]
async fn upsert_reaches_repository_and_is_acknowledged() {
    let (ctx, repo) = TestContext::single().await;

    ctx.producer
        .append(r#"{"id":1,"email":"a@b.com"}"#, None)
        .await
        .unwrap();
    assert_eq!(ctx.deliver().await, 1);

    assert_eq!(repo.items.get(&1).await, Some(employer(1, "a@b.com")));
    assert_eq!(ctx.pending().await, 0);
    assert!(ctx.dead_letters().is_empty());
}

#[tokio::test]
async fn delete_removes_existing_entity() {
    let (ctx, repo) = TestContext::single().await;
    ctx.producer.save(&employer(1, "a@b.com")).await.unwrap();
    ctx.deliver().await;
    assert!(repo.items.contains(&1).await);

    ctx.producer
        .append("1", Some(Operation::Delete))
        .await
        .unwrap();
    assert_eq!(ctx.deliver().await, 1);

    assert!(!repo.items.contains(&1).await);
    assert_eq!(ctx.pending().await, 0);
}

#[tokio::test]
async fn always_failing_entry_is_dead_lettered_after_three_sweeps() {
    let (ctx, repo) = TestContext::single().await;
    repo.fail_for(2);

    let id = ctx.producer.save(&employer(2, "c@d.com")).await.unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.pending().await, 1);

    let reconciler = ctx.pipeline.reconciler();
    for sweep in 1..=2 {
        let report = reconciler.sweep().await;
        assert_eq!(report.still_pending, 1, "sweep {sweep}");
        assert!(ctx.dead_letters().is_empty());
    }
    let report = reconciler.sweep().await;
    assert_eq!(report.dead_lettered, 1);

    let dlq = ctx.dead_letters();
    assert_eq!(dlq.len(), 1);
    let record = &dlq[0];
    assert!(record.field(ERROR_FIELD).is_some_and(|e| !e.is_empty()));
    assert_eq!(record.field(CONTENT_FIELD), Some(r#"{"id":2,"email":"c@d.com"}"#));
    assert_eq!(record.field(ORIGINAL_STREAM_KEY_FIELD), Some(STREAM));
    assert_eq!(
        record.field(ORIGINAL_ENTRY_ID_FIELD),
        Some(id.to_string().as_str())
    );
    assert_eq!(
        record.field(CONSUMER_NAME_FIELD),
        Some("employer_jpa_consumer")
    );
    assert_eq!(record.field(GROUP_NAME_FIELD), Some("jpa_group"));

    assert_eq!(ctx.pending().await, 0);
    // One live delivery plus three retries.
    assert_eq!(repo.saves(), 4);
    assert_eq!(ctx.store.inner.entries(DLQ).unwrap().len(), 1);
}

#[tokio::test]
async fn entry_is_retried_against_every_repository() {
    let primary = Arc::new(ScriptedRepository::new());
    let replica = Arc::new(ScriptedRepository::new());
    let ctx = TestContext::with_repositories(vec![
        ("jpa-primary", primary.clone()),
        ("jpa-replica", replica.clone()),
    ])
    .await;
    replica.fail_for(7);

    ctx.producer.save(&employer(7, "e@f.com")).await.unwrap();
    ctx.deliver().await;

    assert!(primary.items.contains(&7).await);
    assert!(!replica.items.contains(&7).await);
    assert_eq!(ctx.pending().await, 1);

    replica.heal(7);
    let report = ctx.pipeline.reconciler().sweep().await;
    assert_eq!(report.recovered, 1);

    assert_eq!(primary.saves(), 2);
    assert_eq!(replica.saves(), 2);
    assert!(replica.items.contains(&7).await);
    assert_eq!(ctx.pending().await, 0);
}
