//! The firing loop for one scope (global or one tenant).
//!
//! A scheduler ticks every 30 seconds and fires every enabled job whose
//! next occurrence since the previous tick has passed. Runs execute
//! sequentially within a scope; scopes are independent tasks.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gatehouse_core::{AgentRunner, ChatMessage, EventSink, RunInput, StateLayout};

use crate::job::{ScheduledJob, due_between, validate_schedule};
use crate::store::{JobStore, StoreResult};

/// Default tick interval.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Fallback agent id when neither the job nor the tenant overlay names one.
const FALLBACK_AGENT: &str = "main";

/// Which scope a scheduler fires for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerScope {
    /// The host-wide store.
    Global,
    /// One tenant's store.
    Tenant(String),
}

impl SchedulerScope {
    /// Event name runs are broadcast under.
    #[must_use]
    pub fn event_name(&self) -> String {
        match self {
            Self::Global => "cron".to_string(),
            Self::Tenant(tenant) => format!("tenant:{tenant}:cron"),
        }
    }

    /// Session key for one job run. Cron-initiated runs live in their own
    /// namespace, distinct from user sessions.
    #[must_use]
    pub fn session_key(&self, job_id: &str, agent_id: &str) -> String {
        match self {
            Self::Global => format!("agent:{agent_id}:cron:{job_id}"),
            Self::Tenant(tenant) => format!("tenant:{tenant}:cron:{job_id}"),
        }
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Whether the run succeeded.
    pub ok: bool,
    /// Error message on failure.
    pub error: Option<String>,
    /// The session key the run executed under.
    pub session_key: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

struct Inner {
    scope: SchedulerScope,
    store: Arc<JobStore>,
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn EventSink>,
    layout: StateLayout,
    tick_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A single scope's scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Construct a stopped scheduler.
    #[must_use]
    pub fn new(
        scope: SchedulerScope,
        store: Arc<JobStore>,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn EventSink>,
        layout: StateLayout,
    ) -> Self {
        Self::with_tick_interval(scope, store, runner, sink, layout, TICK_INTERVAL)
    }

    /// Construct with a custom tick interval (tests).
    #[must_use]
    pub fn with_tick_interval(
        scope: SchedulerScope,
        store: Arc<JobStore>,
        runner: Arc<dyn AgentRunner>,
        sink: Arc<dyn EventSink>,
        layout: StateLayout,
        tick_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                store,
                runner,
                sink,
                layout,
                tick_interval,
                task: Mutex::new(None),
            }),
        }
    }

    /// The scope this scheduler fires for.
    #[must_use]
    pub fn scope(&self) -> &SchedulerScope {
        &self.inner.scope
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Whether the firing loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Start the firing loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        info!(scope = ?inner.scope, "starting scheduler");
        *guard = Some(tokio::spawn(async move {
            let mut last_tick = Utc::now();
            let mut ticker = tokio::time::interval(inner.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` completes immediately; consume
            // it so the loop fires only for occurrences after start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                run_due_jobs(&inner, last_tick, now).await;
                last_tick = now;
            }
        }));
    }

    /// Stop the firing loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!(scope = ?self.inner.scope, "stopped scheduler");
        }
    }

    /// Fire one job immediately, regardless of schedule or enabled flag.
    /// Backs the `cron.run` RPC.
    ///
    /// # Errors
    ///
    /// Propagates store I/O failures. An unknown job id is `Ok(None)`.
    pub async fn run_now(&self, job_id: &str) -> StoreResult<Option<RunSummary>> {
        let Some(job) = self.inner.store.get(job_id)? else {
            return Ok(None);
        };
        Ok(Some(fire_job(&self.inner, &job).await))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn run_due_jobs(inner: &Arc<Inner>, since: DateTime<Utc>, now: DateTime<Utc>) {
    let jobs = match inner.store.load() {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(scope = ?inner.scope, error = %e, "failed to load job store");
            return;
        },
    };
    for job in jobs.iter().filter(|j| j.enabled) {
        let schedule = match validate_schedule(&job.schedule) {
            Ok(s) => s,
            Err(e) => {
                warn!(job = %job.id, error = %e, "skipping job with invalid schedule");
                continue;
            },
        };
        if due_between(&schedule, since, now).is_some() {
            fire_job(inner, job).await;
        }
    }
}

/// Execute one job run: resolve the agent, invoke the runner under the
/// cron session key, emit lifecycle events, and append the run log.
async fn fire_job(inner: &Arc<Inner>, job: &ScheduledJob) -> RunSummary {
    let agent_id = resolve_agent_id(inner, job);
    let session_key = inner.scope.session_key(&job.id, &agent_id);
    let event_name = inner.scope.event_name();
    let started_at = Utc::now();

    debug!(job = %job.id, session = %session_key, "firing job");
    inner.sink.broadcast(
        &event_name,
        json!({
            "jobId": job.id,
            "name": job.name,
            "agentId": agent_id,
            "phase": "started",
            "delivery": job.delivery,
        }),
        true,
    );

    let message = payload_text(&job.payload);
    let result = inner
        .runner
        .run(
            &session_key,
            RunInput {
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: message,
                }],
                agent_id: Some(agent_id.clone()),
            },
        )
        .await;

    let finished_at = Utc::now();
    let duration_ms = u64::try_from(
        finished_at
            .signed_duration_since(started_at)
            .num_milliseconds(),
    )
    .unwrap_or(0);

    let (ok, error, output) = match result {
        Ok(out) => (true, None::<String>, Some(out.text)),
        Err(e) => (false, Some(e.to_string()), None),
    };

    inner.sink.broadcast(
        &event_name,
        json!({
            "jobId": job.id,
            "name": job.name,
            "agentId": agent_id,
            "phase": if ok { "finished" } else { "error" },
            "error": error.as_deref(),
            "durationMs": duration_ms,
            "delivery": job.delivery,
        }),
        true,
    );

    // Best-effort bookkeeping: neither the run log nor the state blob may
    // fail the job.
    let entry = json!({
        "jobId": job.id,
        "sessionKey": session_key,
        "agentId": agent_id,
        "startedAt": started_at,
        "finishedAt": finished_at,
        "durationMs": duration_ms,
        "ok": ok,
        "error": error.as_deref(),
        "output": output,
    });
    if let Err(e) = append_run_log(&run_log_path(inner, &job.id), &entry) {
        warn!(job = %job.id, error = %e, "failed to append run log");
    }
    let state = json!({
        "lastRunAt": started_at,
        "lastStatus": if ok { "ok" } else { "error" },
    });
    if let Err(e) = inner.store.set_state(&job.id, state) {
        warn!(job = %job.id, error = %e, "failed to update job state");
    }

    RunSummary {
        ok,
        error,
        session_key,
        duration_ms,
    }
}

/// Job's own agent id, else the tenant overlay's `defaultAgent`, else
/// `main`.
fn resolve_agent_id(inner: &Arc<Inner>, job: &ScheduledJob) -> String {
    if let Some(agent) = &job.agent_id {
        return gatehouse_core::normalize_agent_id(agent);
    }
    if let SchedulerScope::Tenant(tenant) = &inner.scope {
        let overlay = inner.layout.tenant_config_file(tenant);
        if let Ok(bytes) = fs::read(overlay)
            && let Ok(doc) = serde_json::from_slice::<Value>(&bytes)
            && let Some(agent) = doc.get("defaultAgent").and_then(Value::as_str)
        {
            return gatehouse_core::normalize_agent_id(agent);
        }
    }
    FALLBACK_AGENT.to_string()
}

fn payload_text(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| payload.to_string(), str::to_string)
}

fn run_log_path(inner: &Arc<Inner>, job_id: &str) -> PathBuf {
    match &inner.scope {
        SchedulerScope::Global => inner.layout.global_run_log(job_id),
        SchedulerScope::Tenant(tenant) => inner.layout.tenant_run_log(tenant, job_id),
    }
}

fn append_run_log(path: &PathBuf, entry: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{entry}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gatehouse_core::{ConnId, RunOutput, RunnerError};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        calls: StdMutex<Vec<(String, RunInput)>>,
        fail: bool,
    }

    impl RecordingRunner {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl AgentRunner for RecordingRunner {
        async fn run(
            &self,
            session_key: &str,
            input: RunInput,
        ) -> Result<RunOutput, RunnerError> {
            self.calls
                .lock()
                .unwrap()
                .push((session_key.to_string(), input));
            if self.fail {
                return Err(RunnerError::Unavailable("runner down".into()));
            }
            Ok(RunOutput {
                text: "done".into(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    struct RecordingSink {
        events: StdMutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for RecordingSink {
        fn broadcast(&self, event: &str, payload: Value, drop_if_slow: bool) {
            assert!(drop_if_slow, "cron events must be droppable");
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }

        fn send_to(&self, _: &[ConnId], event: &str, payload: Value, _: bool) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }
    }

    fn scheduler(
        scope: SchedulerScope,
        runner: Arc<RecordingRunner>,
        sink: Arc<RecordingSink>,
    ) -> (tempfile::TempDir, Scheduler) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        let store_path = match &scope {
            SchedulerScope::Global => layout.global_jobs_file(),
            SchedulerScope::Tenant(t) => layout.tenant_jobs_file(t),
        };
        let sched = Scheduler::new(
            scope,
            Arc::new(JobStore::new(store_path)),
            runner,
            sink,
            layout,
        );
        (tmp, sched)
    }

    #[tokio::test]
    async fn run_now_uses_tenant_cron_namespace() {
        let runner = RecordingRunner::new(false);
        let sink = RecordingSink::new();
        let (_tmp, sched) = scheduler(
            SchedulerScope::Tenant("tenant-a".into()),
            Arc::clone(&runner),
            Arc::clone(&sink),
        );
        let job = sched
            .store()
            .add(ScheduledJob::new("j", "0 * * * * *", json!({"message": "go"})))
            .unwrap();

        let summary = sched.run_now(&job.id).await.unwrap().unwrap();
        assert!(summary.ok);
        assert_eq!(
            summary.session_key,
            format!("tenant:tenant-a:cron:{}", job.id)
        );

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.messages[0].content, "go");
        assert_eq!(calls[0].1.agent_id.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn events_flow_to_tenant_scope() {
        let runner = RecordingRunner::new(false);
        let sink = RecordingSink::new();
        let (_tmp, sched) = scheduler(
            SchedulerScope::Tenant("tenant-a".into()),
            runner,
            Arc::clone(&sink),
        );
        let job = sched
            .store()
            .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
            .unwrap();
        sched.run_now(&job.id).await.unwrap().unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(name, _)| name == "tenant:tenant-a:cron"));
        assert_eq!(events[0].1["phase"], "started");
        assert_eq!(events[1].1["phase"], "finished");
    }

    #[tokio::test]
    async fn failed_run_emits_error_phase_and_logs() {
        let runner = RecordingRunner::new(true);
        let sink = RecordingSink::new();
        let (tmp, sched) = scheduler(
            SchedulerScope::Tenant("tenant-a".into()),
            runner,
            Arc::clone(&sink),
        );
        let job = sched
            .store()
            .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
            .unwrap();
        let summary = sched.run_now(&job.id).await.unwrap().unwrap();
        assert!(!summary.ok);

        let events = sink.events.lock().unwrap();
        assert_eq!(events[1].1["phase"], "error");

        // Run log was appended despite the failure.
        let log = std::fs::read_to_string(
            tmp.path()
                .join(format!("tenants/tenant-a/cron/runs/{}.jsonl", job.id)),
        )
        .unwrap();
        let entry: Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(entry["ok"], false);
        assert!(entry["error"].as_str().unwrap().contains("runner down"));
    }

    #[tokio::test]
    async fn run_now_unknown_job_is_none() {
        let runner = RecordingRunner::new(false);
        let sink = RecordingSink::new();
        let (_tmp, sched) = scheduler(SchedulerScope::Tenant("t".into()), runner, sink);
        assert!(sched.run_now("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlay_default_agent_is_used() {
        let runner = RecordingRunner::new(false);
        let sink = RecordingSink::new();
        let (tmp, sched) = scheduler(
            SchedulerScope::Tenant("tenant-a".into()),
            Arc::clone(&runner),
            sink,
        );
        std::fs::create_dir_all(tmp.path().join("tenants/tenant-a")).unwrap();
        std::fs::write(
            tmp.path().join("tenants/tenant-a/openclaw.json"),
            serde_json::to_vec(&json!({"defaultAgent": "beta"})).unwrap(),
        )
        .unwrap();

        let job = sched
            .store()
            .add(ScheduledJob::new("j", "0 * * * * *", json!({})))
            .unwrap();
        sched.run_now(&job.id).await.unwrap().unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1.agent_id.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn firing_loop_fires_due_jobs() {
        let runner = RecordingRunner::new(false);
        let sink = RecordingSink::new();
        let tmp = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(tmp.path());
        let sched = Scheduler::with_tick_interval(
            SchedulerScope::Tenant("tenant-a".into()),
            Arc::new(JobStore::new(layout.tenant_jobs_file("tenant-a"))),
            Arc::clone(&runner) as Arc<dyn AgentRunner>,
            sink,
            layout,
            Duration::from_millis(25),
        );
        // Every second — the next occurrence lands within the test window.
        sched
            .store()
            .add(ScheduledJob::new("tick", "* * * * * *", json!({})))
            .unwrap();
        sched.start();
        assert!(sched.is_running());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        sched.stop();
        assert!(!sched.is_running());
        assert!(!runner.calls.lock().unwrap().is_empty());
    }
}
