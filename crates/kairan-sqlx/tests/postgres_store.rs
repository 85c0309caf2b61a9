//! Queue contract against a live PostgreSQL.
//!
//! Run with `DATABASE_URL` pointing at a server the test user may create
//! databases on: `cargo test -p kairan-sqlx -- --ignored`.
use std::time::Duration;

use futures::StreamExt as _;
use kairan_core::{
    IdempotencyScope, JobData, JobFilter, JobResult, JobStatus, JobStore, ListJobsOptions, NewJob,
    QueueOptions, RequestType, SortField, SortOrder, Task, TokioSpawner, WorkerBuilder,
};
use kairan_sqlx::{PostgresStore, WorkerWithListenerExt};
use serde_json::json;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(30);

fn summary(post_id: u64) -> NewJob {
    NewJob::from_payload(RequestType::ContentSummary, &json!({ "postId": post_id })).unwrap()
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn claim_complete_round_trip(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let first = store.create(summary(1)).await.unwrap();
    let _second = store.create(summary(2)).await.unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    assert_eq!(first.max_attempts, 3);

    let claimed = store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.locked_by.as_deref(), Some("worker-a"));
    assert!(claimed.lease_expires_at > claimed.locked_at);

    assert!(store.extend_lease(first.id, "worker-a", LEASE).await.unwrap());
    assert!(!store.extend_lease(first.id, "worker-b", LEASE).await.unwrap());

    let done = store
        .complete(first.id, "worker-a", json!({ "summary": "ok" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({ "summary": "ok" })));
    assert!(done.locked_by.is_none() && done.lease_expires_at.is_none());
    assert!(done.processed_at.is_some());

    assert!(store
        .complete(first.id, "worker-a", json!({}))
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_claims_have_one_winner(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let job = store.create(summary(1)).await.unwrap();

    let claims = futures::future::join_all((0..8).map(|n| {
        let store = store.clone();
        async move { store.claim_next(&format!("worker-{n}"), LEASE, &RequestType::ALL).await.unwrap() }
    }))
    .await;

    let winners: Vec<_> = claims.into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, job.id);
    assert_eq!(winners[0].attempts, 1);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn expired_lease_is_reclaimed_and_zombie_is_rejected(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let job = store.create(summary(1)).await.unwrap();

    store
        .claim_next("worker-a", Duration::from_millis(50), &RequestType::ALL)
        .await
        .unwrap()
        .unwrap();
    assert!(store.claim_next("worker-b", LEASE, &RequestType::ALL).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let reclaimed = store.claim_next("worker-b", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);

    assert!(store
        .fail(job.id, "worker-a", "stale", None)
        .await
        .unwrap()
        .is_none());
    assert!(!store.extend_lease(job.id, "worker-a", LEASE).await.unwrap());

    let current = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Processing);
    assert_eq!(current.locked_by.as_deref(), Some("worker-b"));
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn exhausted_job_is_never_claimed(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let job = store.create(summary(1).with_max_attempts(1)).await.unwrap();
    store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    store.fail(job.id, "worker-a", "boom", None).await.unwrap().unwrap();

    store.reset_to_pending(job.id).await.unwrap().unwrap();
    assert!(store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().is_none());

    let parked = store.dead_letter_exhausted().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].status, JobStatus::DeadLetter);
    assert_eq!(parked[0].error_message.as_deref(), Some("retry budget exhausted"));
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn dead_letter_parks_abandoned_and_failed_jobs(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let abandoned = store.create(summary(1).with_max_attempts(1)).await.unwrap();
    let refused = store.create(summary(2).with_max_attempts(1)).await.unwrap();
    let running = store.create(summary(3).with_max_attempts(1)).await.unwrap();

    let claimed = store
        .claim_next("worker-a", Duration::from_millis(50), &RequestType::ALL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, abandoned.id);
    let claimed = store.claim_next("worker-b", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    assert_eq!(claimed.id, refused.id);
    store.fail(refused.id, "worker-b", "model refused", None).await.unwrap().unwrap();
    let claimed = store.claim_next("worker-c", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    assert_eq!(claimed.id, running.id);

    // The first worker crashed: its lease runs out with no attempts left.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.claim_next("worker-d", LEASE, &RequestType::ALL).await.unwrap().is_none());

    let mut parked = store.dead_letter_exhausted().await.unwrap();
    parked.sort_by_key(|job| job.created_at);
    assert_eq!(
        parked.iter().map(|job| job.id).collect::<Vec<_>>(),
        [abandoned.id, refused.id]
    );
    assert!(parked.iter().all(|job| job.status == JobStatus::DeadLetter));
    assert!(parked.iter().all(|job| job.locked_by.is_none() && job.lease_expires_at.is_none()));
    assert!(parked.iter().all(|job| job.processed_at.is_some()));
    assert_eq!(parked[0].error_message.as_deref(), Some("retry budget exhausted"));
    assert_eq!(parked[1].error_message.as_deref(), Some("model refused"));

    let running = store.get(running.id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Processing);
    assert!(store.dead_letter_exhausted().await.unwrap().is_empty());
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn processed_at_sort_places_unresolved_jobs_first_ascending(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let early = store.create(summary(1)).await.unwrap();
    let late = store.create(summary(2)).await.unwrap();
    let waiting = store.create(summary(3)).await.unwrap();

    for job in [&early, &late] {
        store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
        store.complete(job.id, "worker-a", json!({})).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let ids = |order| {
        let store = store.clone();
        async move {
            store
                .list(&ListJobsOptions {
                    sort: SortField::ProcessedAt,
                    order,
                    ..Default::default()
                })
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|job| job.id)
                .collect::<Vec<_>>()
        }
    };
    assert_eq!(ids(SortOrder::Asc).await, [waiting.id, early.id, late.id]);
    assert_eq!(ids(SortOrder::Desc).await, [late.id, early.id, waiting.id]);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn claim_skips_request_types_the_worker_does_not_handle(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let newsletter = store
        .create(NewJob::from_payload(RequestType::NewsletterIntro, &json!({ "issue": 9 })).unwrap())
        .await
        .unwrap();
    let post = store.create(summary(1)).await.unwrap();

    let claimed = store
        .claim_next("worker-a", LEASE, &[RequestType::ContentSummary])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, post.id);
    assert!(store
        .claim_next("worker-a", LEASE, &[RequestType::ContentSummary])
        .await
        .unwrap()
        .is_none());
    assert!(store.claim_next("worker-a", LEASE, &[]).await.unwrap().is_none());

    let newsletter = store.get(newsletter.id).await.unwrap().unwrap();
    assert_eq!(newsletter.status, JobStatus::Pending);
    assert_eq!(newsletter.attempts, 0);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn zero_lease_is_rejected(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let job = store.create(summary(1)).await.unwrap();

    let error = store
        .claim_next("worker-a", Duration::ZERO, &RequestType::ALL)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), kairan_core::ErrorKind::InvalidInput);
    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn cancel_and_reset_are_guarded_by_status(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let job = store.create(summary(1)).await.unwrap();
    assert!(store.reset_to_pending(job.id).await.unwrap().is_none());

    let cancelled = store.cancel(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(store.cancel(job.id).await.unwrap().is_none());

    let running = store.create(summary(2)).await.unwrap();
    store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    assert!(store.cancel(running.id).await.unwrap().is_none());
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_submissions_with_one_key_create_one_job(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let user = kairan_core::UserId::new_v4();

    let created = futures::future::join_all((0..8).map(|_| {
        let store = store.clone();
        async move {
            store
                .create(summary(1).with_user(user).with_idempotency_key("intro-1"))
                .await
                .unwrap()
        }
    }))
    .await;

    assert!(created.iter().all(|job| job.id == created[0].id));
    assert_eq!(store.stats().await.unwrap().total, 1);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn failed_job_releases_key_and_completed_scope_is_configurable(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let submit = || summary(1).with_idempotency_key("k");

    let first = store.create(submit()).await.unwrap();
    assert_eq!(store.create(submit()).await.unwrap().id, first.id);
    store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    store.fail(first.id, "worker-a", "boom", None).await.unwrap().unwrap();

    let second = store.create(submit()).await.unwrap();
    assert_ne!(second.id, first.id);
    store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    store.complete(second.id, "worker-a", json!({})).await.unwrap().unwrap();
    assert_eq!(store.create(submit()).await.unwrap().id, second.id);

    let relaxed = PostgresStore::new(pool).options(QueueOptions {
        idempotency_scope: IdempotencyScope::UnresolvedOnly,
        ..QueueOptions::default()
    });
    let third = relaxed.create(submit()).await.unwrap();
    assert_ne!(third.id, second.id);
    assert_eq!(third.status, JobStatus::Pending);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn list_and_stats(pool: PgPool) {
    let store = PostgresStore::new(pool);
    for post_id in 0..5 {
        store.create(summary(post_id)).await.unwrap();
    }
    store
        .create(NewJob::from_payload(RequestType::PageDraft, &json!({})).unwrap())
        .await
        .unwrap();
    let claimed = store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();

    let page = store
        .list(&ListJobsOptions {
            filter: JobFilter {
                request_type: Some(RequestType::ContentSummary),
                ..Default::default()
            },
            page: 2,
            page_size: 2,
            sort: SortField::CreatedAt,
            order: SortOrder::Asc,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items.len(), 2);

    let processing = store
        .list(&ListJobsOptions {
            filter: JobFilter {
                status: Some(JobStatus::Processing),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(processing.items.len(), 1);
    assert_eq!(processing.items[0].id, claimed.id);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 5);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.total, 6);
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn purge_deletes_old_terminal_jobs(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let done = store.create(summary(1)).await.unwrap();
    let waiting = store.create(summary(2)).await.unwrap();
    store.claim_next("worker-a", LEASE, &RequestType::ALL).await.unwrap().unwrap();
    store.complete(done.id, "worker-a", json!({})).await.unwrap().unwrap();

    let yesterday = chrono::Utc::now() - chrono::Duration::days(1);
    assert_eq!(store.purge_terminal(yesterday).await.unwrap(), 0);

    let soon = chrono::Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(store.purge_terminal(soon).await.unwrap(), 1);
    assert!(store.get(done.id).await.unwrap().is_none());
    assert!(store.get(waiting.id).await.unwrap().is_some());
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn listener_wakes_subscribers_on_insert(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let mut listener = store.listener().await.unwrap();
    let mut drafts = listener.subscribe_to([RequestType::PageDraft]);
    let mut everything = listener.subscribe();

    let token = tokio_util::sync::CancellationToken::new();
    let listening = tokio::spawn(listener.listen_until(token.clone().cancelled_owned()));

    store.create(summary(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), everything.next())
        .await
        .unwrap()
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), drafts.next())
            .await
            .is_err()
    );

    token.cancel();
    listening.await.unwrap().unwrap();
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryInput {
    post_id: u64,
}

async fn summarize(JobData(task): JobData<Task<SummaryInput>>) -> JobResult {
    JobResult::complete(json!({ "summary": format!("post {}", task.input.post_id) }))
}

#[sqlx::test(migrator = "kairan_sqlx::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn subscribed_worker_processes_new_jobs(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let mut listener = store.listener().await.unwrap();
    let token = tokio_util::sync::CancellationToken::new();

    // Long poll interval: only the notification can wake the worker in time.
    let worker = WorkerBuilder::new(Duration::from_secs(3600))
        .handler(summarize)
        .job_spawner(TokioSpawner)
        .build(store.backend("worker-a", [RequestType::ContentSummary]))
        .subscribe(&mut listener)
        .with_graceful_shutdown(token.clone().cancelled_owned());
    let listening = tokio::spawn(listener.listen_until(token.clone().cancelled_owned()));
    let running = tokio::spawn(worker.run());

    let job = store.create(summary(7)).await.unwrap();
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = store.get(job.id).await.unwrap().unwrap();
            if current.status == JobStatus::Completed {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(done.result, Some(json!({ "summary": "post 7" })));

    token.cancel();
    running.await.unwrap();
    listening.await.unwrap().unwrap();
}
