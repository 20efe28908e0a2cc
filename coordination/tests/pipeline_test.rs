//! End-to-end review pipeline: phases, persistence, resume, and failure paths.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{arc, finding_json, key, sample_context, test_config, FakeContextProvider, RecordingPoster, Reply, ScriptedClient};
use mockall::mock;
use review_coordination::{
    CallError, DecisionKind, InMemoryStatePersistence, JsonFileStatePersistence, PersistenceError,
    ReviewError, ReviewKey, ReviewPhase, ReviewPipeline, ReviewState, StatePersistence,
};

mock! {
    pub Store {}

    #[async_trait]
    impl StatePersistence for Store {
        async fn save(&self, key: &ReviewKey, state: &ReviewState) -> Result<(), PersistenceError>;
        async fn load(&self, key: &ReviewKey) -> Result<Option<ReviewState>, PersistenceError>;
        async fn delete_older_than(&self, age: Duration) -> Result<usize, PersistenceError>;
    }
}

fn client_with_critical() -> ScriptedClient {
    ScriptedClient::new()
        .text("tests", finding_json("src/api.rs", 2, "minor"))
        .text("security", finding_json("src/api.rs", 3, "critical"))
}

fn phases(state: &ReviewState) -> Vec<(ReviewPhase, ReviewPhase)> {
    state.checkpoints.iter().map(|c| (c.from, c.to)).collect()
}

#[tokio::test]
async fn test_review_runs_to_completion() {
    let poster = arc(RecordingPoster::new());
    let store = arc(InMemoryStatePersistence::new());
    let provider = arc(FakeContextProvider::ok());
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(client_with_critical()),
        provider.clone(),
        poster.clone(),
        store.clone(),
    )
    .unwrap();

    let state = pipeline.run(key("1")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    assert_eq!(
        phases(&state),
        vec![
            (ReviewPhase::Initializing, ReviewPhase::ContextGathering),
            (ReviewPhase::ContextGathering, ReviewPhase::Review),
            (ReviewPhase::Review, ReviewPhase::ParallelAnalysis),
            (ReviewPhase::ParallelAnalysis, ReviewPhase::Synthesis),
            (ReviewPhase::Synthesis, ReviewPhase::Output),
            (ReviewPhase::Output, ReviewPhase::Completed),
        ]
    );
    assert!(state.errors.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let synthesis = state.synthesis.as_ref().unwrap();
    assert_eq!(synthesis.decision.decision, DecisionKind::ChangesRequested);
    assert_eq!(synthesis.decision.critical_count, 1);
    // Critical first.
    assert_eq!(synthesis.merged[0].line, Some(3));

    let output = state.output.as_ref().unwrap();
    assert!(output.posted);
    assert!(output.posted_at.is_some());
    assert_eq!(output.comments.len(), 2);
    assert!(output.summary.contains("changes_requested"));

    let posted = poster.posted.lock().unwrap();
    assert_eq!(posted.get(&key("1")).unwrap().decision, DecisionKind::ChangesRequested);

    let stored = store.load(&key("1")).await.unwrap().unwrap();
    assert_eq!(stored.phase, ReviewPhase::Completed);
    assert_eq!(stored.run_id, state.run_id);
    stored.validate().unwrap();
}

#[tokio::test]
async fn test_clean_review_is_approved() {
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let state = pipeline.run(key("2")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    let decision = &state.synthesis.as_ref().unwrap().decision;
    assert_eq!(decision.decision, DecisionKind::Approved);
    assert_eq!(decision.total_findings, 0);
}

#[tokio::test]
async fn test_all_tasks_failing_still_completes() {
    let client = ScriptedClient::new()
        .reply("tests", Reply::Fail(CallError::http(401, "bad key")))
        .reply("security", Reply::Fail(CallError::http(401, "bad key")))
        .reply("performance", Reply::Fail(CallError::http(401, "bad key")))
        .reply("design", Reply::Fail(CallError::http(401, "bad key")));
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(client),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let state = pipeline.run(key("3")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    assert_eq!(state.errors.len(), 4);
    assert!(state
        .errors
        .iter()
        .all(|e| e.phase == ReviewPhase::ParallelAnalysis));
    let output = state.output.as_ref().unwrap();
    assert!(output.summary.contains("4 analysis task(s) failed"));
}

#[tokio::test(start_paused = true)]
async fn test_context_failure_fails_review() {
    let provider = arc(FakeContextProvider::failing(10, CallError::http(503, "unavailable")));
    let client = arc(ScriptedClient::new());
    let store = arc(InMemoryStatePersistence::new());
    let pipeline = ReviewPipeline::new(
        test_config(),
        client.clone(),
        provider.clone(),
        arc(RecordingPoster::new()),
        store.clone(),
    )
    .unwrap();

    let state = pipeline.run(key("4")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Failed);
    // One attempt plus two retries.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].phase, ReviewPhase::ContextGathering);
    assert!(state.errors[0].error.contains("503"));

    let stored = store.load(&key("4")).await.unwrap().unwrap();
    assert_eq!(stored.phase, ReviewPhase::Failed);
}

#[tokio::test]
async fn test_permanent_context_error_is_not_retried() {
    let provider = arc(FakeContextProvider::failing(1, CallError::http(404, "no such pull request")));
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        provider.clone(),
        arc(RecordingPoster::new()),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let state = pipeline.run(key("5")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Failed);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_context_error_recovers() {
    let provider = arc(FakeContextProvider::failing(1, CallError::network("ECONNRESET", "reset")));
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        provider.clone(),
        arc(RecordingPoster::new()),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let state = pipeline.run(key("6")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_poster_failure_keeps_output_unposted() {
    let poster = arc(RecordingPoster::failing(CallError::http(502, "bad gateway")));
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(client_with_critical()),
        arc(FakeContextProvider::ok()),
        poster.clone(),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let state = pipeline.run(key("7")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    assert_eq!(poster.attempts.load(Ordering::SeqCst), 3);
    let output = state.output.as_ref().unwrap();
    assert!(!output.posted);
    assert!(output.posted_at.is_none());
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].phase, ReviewPhase::Output);
    assert_eq!(state.errors[0].task.as_deref(), Some("poster"));
}

fn saved_in_parallel_analysis(id: &str) -> ReviewState {
    let mut state = ReviewState::new(key(id));
    state
        .transition_to(ReviewPhase::ContextGathering, "review initialized")
        .unwrap();
    state.context = Some(sample_context());
    state.transition_to(ReviewPhase::Review, "context").unwrap();
    state
        .transition_to(ReviewPhase::ParallelAnalysis, "planned")
        .unwrap();
    state
}

#[tokio::test]
async fn test_resume_continues_from_saved_phase() {
    let store = arc(InMemoryStatePersistence::new());
    let saved = saved_in_parallel_analysis("8");
    store.save(&saved.key, &saved).await.unwrap();

    let provider = arc(FakeContextProvider::ok());
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(client_with_critical()),
        provider.clone(),
        arc(RecordingPoster::new()),
        store.clone(),
    )
    .unwrap();

    let state = pipeline.resume(&key("8")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Completed);
    assert_eq!(state.run_id, saved.run_id);
    // Context was already gathered.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.checkpoints.len(), 6);
    assert_eq!(state.checkpoints[..3], saved.checkpoints[..]);
    assert_eq!(state.planned_tasks.len(), 4);
}

#[tokio::test]
async fn test_resume_unknown_review_is_not_found() {
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(InMemoryStatePersistence::new()),
    )
    .unwrap();

    let err = pipeline.resume(&key("missing")).await.unwrap_err();
    assert!(matches!(err, ReviewError::NotFound(_)));
}

#[tokio::test]
async fn test_resume_terminal_review_is_noop() {
    let store = arc(InMemoryStatePersistence::new());
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        store.clone(),
    )
    .unwrap();
    let first = pipeline.run(key("9")).await.unwrap();

    let again = pipeline.resume(&key("9")).await.unwrap();

    assert_eq!(again.phase, ReviewPhase::Completed);
    assert_eq!(again.checkpoints.len(), first.checkpoints.len());
}

#[tokio::test]
async fn test_json_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = JsonFileStatePersistence::open(dir.path()).await.unwrap();
        let saved = saved_in_parallel_analysis("10");
        store.save(&saved.key, &saved).await.unwrap();
    }

    let store = arc(JsonFileStatePersistence::open(dir.path()).await.unwrap());
    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(client_with_critical()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        store,
    )
    .unwrap();
    let state = pipeline.resume(&key("10")).await.unwrap();
    assert_eq!(state.phase, ReviewPhase::Completed);

    let reopened = JsonFileStatePersistence::open(dir.path()).await.unwrap();
    let stored = reopened.load(&key("10")).await.unwrap().unwrap();
    assert_eq!(stored.phase, ReviewPhase::Completed);
    assert_eq!(
        stored.synthesis.unwrap().decision.decision,
        DecisionKind::ChangesRequested
    );
}

#[tokio::test]
async fn test_checkpoint_save_failure_fails_review() {
    let saves = Arc::new(AtomicU32::new(0));
    let counter = saves.clone();
    let mut store = MockStore::new();
    store.expect_save().times(3).returning(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(PersistenceError::Io("disk full".into()))
        }
    });

    let client = arc(ScriptedClient::new());
    let pipeline = ReviewPipeline::new(
        test_config(),
        client.clone(),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(store),
    )
    .unwrap();

    let state = pipeline.run(key("11")).await.unwrap();

    assert_eq!(state.phase, ReviewPhase::Failed);
    // Initial save, failed checkpoint, failed best-effort save.
    assert_eq!(saves.load(Ordering::SeqCst), 3);
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert!(state.errors[0].error.contains("disk full"));
}

#[tokio::test]
async fn test_initial_save_failure_is_returned() {
    let mut store = MockStore::new();
    store
        .expect_save()
        .times(1)
        .returning(|_, _| Err(PersistenceError::Backend("unreachable".into())));

    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(store),
    )
    .unwrap();

    let err = pipeline.run(key("12")).await.unwrap_err();
    assert!(matches!(err, ReviewError::Persistence(_)));
}

#[tokio::test]
async fn test_purge_delegates_to_store() {
    let mut store = MockStore::new();
    store
        .expect_delete_older_than()
        .withf(|age| *age == Duration::from_secs(3600))
        .times(1)
        .returning(|_| Ok(2));

    let pipeline = ReviewPipeline::new(
        test_config(),
        arc(ScriptedClient::new()),
        arc(FakeContextProvider::ok()),
        arc(RecordingPoster::new()),
        arc(store),
    )
    .unwrap();

    assert_eq!(pipeline.purge(Duration::from_secs(3600)).await.unwrap(), 2);
}
