//! Submission, cancellation and session behavior of the upload service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::{
    FakeAllocator, FakeBackend, Harness, credential, credential_for, is_completed, source_file,
    store, wait_until,
};
use skyhaul_uploader::{SubmitError, Submission, TransferBody, UploadEvent, UploaderConfig};

fn one_credential(resumable: bool) -> FakeAllocator {
    FakeAllocator::with_batches(vec![vec![credential("c1", 48, resumable)]])
}

#[tokio::test]
async fn submit_without_session_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let h = Harness::spawn(
        root.path(),
        Arc::new(FakeBackend::default()),
        one_credential(true),
    );
    h.session.sign_out();

    assert!(matches!(
        h.service.open_session().await,
        Err(SubmitError::NoSession)
    ));
    let path = source_file(src.path(), "clip.mp4", 16);
    assert!(matches!(
        h.service.submit(Submission::copy(&path)).await,
        Err(SubmitError::NoSession)
    ));
}

#[tokio::test]
async fn submit_before_open_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let h = Harness::spawn(
        root.path(),
        Arc::new(FakeBackend::default()),
        one_credential(true),
    );

    let path = source_file(src.path(), "clip.mp4", 16);
    assert!(matches!(
        h.service.submit(Submission::copy(&path)).await,
        Err(SubmitError::NoWorkspace)
    ));
}

#[tokio::test]
async fn unusable_sources_are_refused() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let h = Harness::open(
        root.path(),
        Arc::new(FakeBackend::default()),
        one_credential(true),
    )
    .await;

    let missing = src.path().join("missing.mp4");
    assert!(matches!(
        h.service.submit(Submission::copy(&missing)).await,
        Err(SubmitError::SourceMissing(_))
    ));
    assert!(matches!(
        h.service
            .submit(Submission::copy("https://example.com/clip.mp4"))
            .await,
        Err(SubmitError::NotLocal(_))
    ));
    assert!(matches!(
        h.service.submit(Submission::copy(src.path())).await,
        Err(SubmitError::NotLocal(_))
    ));
    assert!(h.service.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn submit_without_credential_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), FakeAllocator::default()).await;

    let path = source_file(src.path(), "clip.mp4", 16);
    assert!(matches!(
        h.service.submit(Submission::moving(&path)).await,
        Err(SubmitError::NoCredential)
    ));

    assert!(path.exists());
    assert!(!h.allocator.calls().is_empty());
    assert!(backend.requests().is_empty());
    assert!(h.service.list().await.unwrap().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(store(root.path()).dir())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name() != "workspace.json")
        .collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[tokio::test]
async fn moving_submission_consumes_source() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let h = Harness::open(
        root.path(),
        Arc::new(FakeBackend::default()),
        FakeAllocator::with_batches(vec![vec![credential_for("image/jpeg", "c1", 48, true)]]),
    )
    .await;

    let path = source_file(src.path(), "photo.jpg", 300);
    let expected = std::fs::read(&path).unwrap();
    let job = h
        .service
        .submit(
            Submission::moving(&path).with_metadata("album", serde_json::json!("holiday")),
        )
        .await
        .unwrap();

    assert!(!path.exists());
    assert_eq!(job.content_type, "image/jpeg");
    assert_eq!(job.metadata["album"], "holiday");
    let payload = store(root.path()).payload_path(&job.id);
    assert_eq!(std::fs::read(payload).unwrap(), expected);
}

#[tokio::test]
async fn abandoned_submit_still_queues_reserved_job() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let path = source_file(src.path(), "clip.mp4", 64);
    let service = h.service.clone();
    let submit = tokio::spawn(async move { service.submit(Submission::copy(path)).await });
    // The second allocation is the top-up that follows a reservation.
    wait_until(|| h.allocator.calls().len() >= 2).await;
    submit.abort();

    let mut jobs = Vec::new();
    for _ in 0..500 {
        jobs = h.service.list().await.unwrap();
        if !jobs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    h.wait_for_requests(&job.id, 1).await;

    let store = store(root.path());
    assert!(store.metadata_path(&job.id).exists());
    assert_eq!(std::fs::read(store.payload_path(&job.id)).unwrap().len(), 64);
}

#[tokio::test]
async fn failed_metadata_write_keeps_job_running() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 100)))
        .await
        .unwrap();

    // A non-empty directory in place of the metadata file makes every
    // atomic rename onto it fail.
    let store = store(root.path());
    let metadata = store.metadata_path(&job.id);
    std::fs::remove_file(&metadata).unwrap();
    std::fs::create_dir(&metadata).unwrap();
    std::fs::write(metadata.join("blocker"), b"x").unwrap();

    backend.progress(&job.id, 40);
    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert_eq!(snapshot.bytes_sent, 40);
    assert!(snapshot.started_at.is_some());
    assert_eq!(h.service.list().await.unwrap().len(), 1);
    assert!(metadata.is_dir());

    backend.finish(&job.id, 200, None);
    let UploadEvent::Completed(done) = h.next_event(is_completed).await else {
        unreachable!()
    };
    assert_eq!(done.id, job.id);
    assert!(!store.payload_path(&job.id).exists());
}

#[tokio::test]
async fn duplicate_start_keeps_single_transfer() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 64)))
        .await
        .unwrap();

    let (a, b) = tokio::join!(h.service.start(&job.id), h.service.start(&job.id));
    assert!(a.unwrap() && b.unwrap());
    assert_eq!(backend.requests_for(&job.id).len(), 1);
    assert_eq!(backend.refused(), 0);

    assert!(!h.service.start("unknown").await.unwrap());
}

#[tokio::test]
async fn cancel_removes_job_and_files() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 64)))
        .await
        .unwrap();
    backend.progress(&job.id, 32);

    assert!(h.service.cancel(&job.id).await.unwrap());
    assert!(backend.cancelled().contains(&job.id));
    assert!(!backend.is_running(&job.id));

    let store = store(root.path());
    assert!(!store.metadata_path(&job.id).exists());
    assert!(!store.payload_path(&job.id).exists());
    assert!(h.service.list().await.unwrap().is_empty());
    assert!(h.service.get(&job.id).await.unwrap().is_none());
    assert!(!h.service.cancel(&job.id).await.unwrap());
}

#[tokio::test]
async fn dropped_connection_probes_before_resuming() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 4000)))
        .await
        .unwrap();
    backend.progress(&job.id, 1000);
    backend.fail(&job.id);
    h.wait_for_requests(&job.id, 2).await;

    let probe = &backend.requests_for(&job.id)[1];
    assert_eq!(probe.body, TransferBody::Empty);
    assert_eq!(probe.content_range.as_deref(), Some("bytes */4000"));
    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert_eq!(snapshot.restart_count, 1);
    assert!(snapshot.started_at.is_some());

    backend.finish(&job.id, 308, Some("bytes=0-1999"));
    h.wait_for_requests(&job.id, 3).await;
    let resume = &backend.requests_for(&job.id)[2];
    assert_eq!(resume.content_range.as_deref(), Some("bytes 2000-3999/4000"));
    assert_eq!(resume.body_len(), 2000);
}

#[tokio::test]
async fn dropped_connection_before_first_byte_sends_again() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 4000)))
        .await
        .unwrap();
    backend.fail(&job.id);
    h.wait_for_requests(&job.id, 2).await;

    let again = &backend.requests_for(&job.id)[1];
    assert_eq!(again.content_range, None);
    assert_eq!(again.body_len(), 4000);
}

#[tokio::test]
async fn lost_session_restarts_without_counting() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    backend.progress(&job.id, 64);
    backend.finish(&job.id, 404, None);
    h.wait_for_requests(&job.id, 2).await;

    let restart = &backend.requests_for(&job.id)[1];
    assert_eq!(restart.url, "https://storage.example.com/upload/c1");
    assert_eq!(restart.content_range, None);
    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert_eq!(snapshot.restart_count, 0);
    assert_eq!(snapshot.bytes_sent, 0);
}

#[tokio::test]
async fn missing_range_leaves_job_idle() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    backend.finish(&job.id, 308, None);

    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert!(snapshot.completed_at.is_none());
    assert_eq!(backend.requests_for(&job.id).len(), 1);

    assert!(h.service.start(&job.id).await.unwrap());
    assert_eq!(backend.requests_for(&job.id).len(), 2);
}

#[tokio::test]
async fn completion_waits_for_reporting() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut h = Harness::spawn(root.path(), backend.clone(), one_credential(true));
    h.service.open_session().await.unwrap();

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    backend.finish(&job.id, 201, None);

    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert!(snapshot.completed_at.is_some());
    let early = h.drain_events();
    assert!(early
        .iter()
        .any(|e| matches!(e, UploadEvent::BackgroundWorkFinished)));
    assert!(!early.iter().any(is_completed));

    h.service.enable_reporting().await.unwrap();
    let UploadEvent::Completed(done) = h.next_event(is_completed).await else {
        unreachable!()
    };
    assert_eq!(done.id, job.id);
}

#[tokio::test]
async fn completed_job_is_reported_again_on_start() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    backend.finish(&job.id, 200, None);
    let UploadEvent::Completed(first) = h.next_event(is_completed).await else {
        unreachable!()
    };

    assert!(h.service.start(&job.id).await.unwrap());
    let UploadEvent::Completed(again) = h.next_event(is_completed).await else {
        unreachable!()
    };
    assert_eq!(again.completed_at, first.completed_at);
    assert_eq!(backend.requests_for(&job.id).len(), 1);
}

#[tokio::test]
async fn acknowledge_only_forgets_completed_jobs() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let mut h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    assert!(!h.service.acknowledge(&job.id).await.unwrap());

    backend.finish(&job.id, 200, None);
    h.next_event(is_completed).await;
    assert!(h.service.acknowledge(&job.id).await.unwrap());

    assert!(!store(root.path()).metadata_path(&job.id).exists());
    assert!(h.service.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn refill_restarts_jobs_waiting_for_credential() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();
    backend.finish(&job.id, 403, None);

    // Rejected credential and an empty cache: the job waits.
    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert_eq!(snapshot.restart_count, 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.requests_for(&job.id).len(), 1);

    h.allocator.push(vec![credential("c2", 72, true)]);
    h.service.refill("video/mp4").await.unwrap();
    h.wait_for_requests(&job.id, 2).await;

    let retry = &backend.requests_for(&job.id)[1];
    assert_eq!(retry.url, "https://storage.example.com/upload/c2");
    let snapshot = h.service.get(&job.id).await.unwrap().unwrap();
    assert_eq!(snapshot.restart_count, 0);
}

#[tokio::test]
async fn closing_session_abandons_transfers_until_reopened() {
    let root = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let h = Harness::open(root.path(), backend.clone(), one_credential(true)).await;

    let job = h
        .service
        .submit(Submission::copy(source_file(src.path(), "clip.mp4", 128)))
        .await
        .unwrap();

    h.service.close_session().await.unwrap();
    assert!(backend.cancelled().contains(&job.id));
    assert!(h.service.list().await.unwrap().is_empty());
    assert!(store(root.path()).metadata_path(&job.id).exists());

    assert_eq!(h.service.open_session().await.unwrap(), 1);
    wait_until(|| backend.requests_for(&job.id).len() == 2).await;
    assert!(backend.is_running(&job.id));
}

#[tokio::test]
async fn expired_credentials_are_not_saved() {
    let root = tempfile::tempdir().unwrap();
    let mut short = credential("short", 0, true);
    short.expires_at = Utc::now() + TimeDelta::seconds(1);
    let allocator = FakeAllocator::with_batches(vec![vec![short, credential("long", 48, true)]]);
    let config = UploaderConfig {
        usable_margin_secs: 0,
        ..common::config(root.path())
    };
    let h = Harness::spawn_with(config, Arc::new(FakeBackend::default()), allocator);
    h.service.open_session().await.unwrap();

    h.service.refill("video/mp4").await.unwrap();
    let info = store(root.path()).dir().join("workspace.json");
    let saved = std::fs::read_to_string(&info).unwrap();
    assert!(saved.contains("\"short\""));
    assert!(saved.contains("\"long\""));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.service.close_session().await.unwrap();

    let saved = std::fs::read_to_string(&info).unwrap();
    assert!(!saved.contains("short"));
    assert!(saved.contains("\"long\""));
}

#[tokio::test]
async fn events_can_be_taken_once() {
    let root = tempfile::tempdir().unwrap();
    let h = Harness::spawn(
        root.path(),
        Arc::new(FakeBackend::default()),
        FakeAllocator::default(),
    );
    assert!(h.service.take_events().is_none());
    h.service.shutdown().await.unwrap();
    assert!(matches!(
        h.service.list().await,
        Err(SubmitError::Stopped)
    ));
}
