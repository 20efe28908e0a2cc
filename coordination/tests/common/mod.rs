//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use review_coordination::{
    AnalysisClient, CallError, CompletionRequest, CompletionResponse, ContextProvider,
    CoordinationConfig, DiffFile, ReviewContext, ReviewKey, ReviewOutput, ReviewPoster,
    RetryConfig,
};

/// Scripted reply for one task.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Fail(CallError),
    /// Never answers.
    Hang,
}

/// Analysis client answering by task name.
#[derive(Default)]
pub struct ScriptedClient {
    replies: BTreeMap<String, Reply>,
    pub calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, task: &str, reply: Reply) -> Self {
        self.replies.insert(task.to_string(), reply);
        self
    }

    pub fn text(self, task: &str, text: impl Into<String>) -> Self {
        self.reply(task, Reply::Text(text.into()))
    }
}

#[async_trait]
impl AnalysisClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(&request.task) {
            Some(Reply::Text(text)) => Ok(CompletionResponse::new(text.clone()).with_usage(100, 50)),
            Some(Reply::Fail(e)) => Err(e.clone()),
            Some(Reply::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(CompletionResponse::new(r#"{"findings": []}"#)),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// One-finding JSON response.
pub fn finding_json(file: &str, line: u32, severity: &str) -> String {
    format!(
        r#"Review complete.
```json
{{"findings": [{{"file": "{file}", "line": {line}, "severity": "{severity}", "message": "issue in {file}"}}]}}
```"#
    )
}

pub fn key(id: &str) -> ReviewKey {
    ReviewKey::new("github", "acme/widgets", id)
}

pub fn sample_context() -> ReviewContext {
    ReviewContext::from_files(vec![
        DiffFile {
            path: "src/api.rs".into(),
            patch: "@@ -1,2 +1,3 @@\n fn handler() {\n+    let q = format!(\"SELECT * FROM t WHERE id = {}\", id);\n }".into(),
            additions: 1,
            deletions: 0,
        },
        DiffFile {
            path: "src/cache.rs".into(),
            patch: "@@ -10 +10 @@\n-    let v = map.get(k);\n+    let v = map.get(k).cloned();".into(),
            additions: 1,
            deletions: 1,
        },
    ])
    .with_title("Add query handler")
}

/// Context provider that fails a fixed number of times first.
pub struct FakeContextProvider {
    failures_left: Mutex<u32>,
    error: CallError,
    pub calls: AtomicU32,
}

impl FakeContextProvider {
    pub fn ok() -> Self {
        Self::failing(0, CallError::http(503, "unavailable"))
    }

    pub fn failing(times: u32, error: CallError) -> Self {
        Self {
            failures_left: Mutex::new(times),
            error,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ContextProvider for FakeContextProvider {
    async fn fetch(&self, _key: &ReviewKey) -> Result<ReviewContext, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(self.error.clone());
        }
        Ok(sample_context())
    }
}

/// Poster that records every output it accepts, keyed like an upsert.
#[derive(Default)]
pub struct RecordingPoster {
    pub posted: Mutex<BTreeMap<ReviewKey, ReviewOutput>>,
    pub attempts: AtomicU32,
    fail_with: Option<CallError>,
}

impl RecordingPoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: CallError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ReviewPoster for RecordingPoster {
    async fn post(&self, key: &ReviewKey, output: &ReviewOutput) -> Result<(), CallError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        self.posted.lock().unwrap().insert(key.clone(), output.clone());
        Ok(())
    }
}

/// Fast, deterministic configuration for tests.
pub fn test_config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.retry = RetryConfig {
        max_retries: 2,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    config.orchestrator.task_timeout_ms = Duration::from_secs(5).as_millis() as u64;
    config
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
