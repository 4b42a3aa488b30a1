use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, JobError};
use crate::jobs::store::JobStore;
use crate::jobs::types::{
    Job, JobStatus, JobType, TranscribeParams, TranscribeResult, TranslateParams,
};

/// Bursts beyond this are absorbed by the periodic pending sweep instead of
/// blocking the enqueueing request.
const LANE_CAPACITY: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Write handle for a handler to report fractional progress.
#[derive(Clone)]
pub struct ProgressReporter {
    store: JobStore,
    id: Uuid,
}

impl ProgressReporter {
    pub fn new(store: JobStore, id: Uuid) -> Self {
        Self { store, id }
    }

    pub async fn set(&self, progress: f64) {
        if let Err(e) = self.store.update_progress(self.id, progress).await {
            warn!(job_id = %self.id, error = %e, "progress update failed");
        }
    }
}

/// A lane's work implementation, injected so tests substitute fakes.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Persistent queue with one worker per lane. The job row is authoritative:
/// channel membership and cancellation tokens are rebuilt from it on
/// restart.
pub struct JobQueue {
    store: JobStore,
    transcribe_tx: mpsc::Sender<Uuid>,
    translate_tx: mpsc::Sender<Uuid>,
    cancels: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl JobQueue {
    /// Open the queue: recover rows orphaned by a previous run, re-enqueue
    /// pending work in creation order, then start the two lane workers.
    pub async fn start(
        store: JobStore,
        transcribe_handler: Arc<dyn JobHandler>,
        translate_handler: Arc<dyn JobHandler>,
    ) -> Result<Arc<Self>, JobError> {
        let (transcribe_tx, transcribe_rx) = mpsc::channel(LANE_CAPACITY);
        let (translate_tx, translate_rx) = mpsc::channel(LANE_CAPACITY);

        let queue = Arc::new(Self {
            store,
            transcribe_tx,
            translate_tx,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        });

        let recovered = queue.store.reset_running_to_pending().await?;
        if recovered > 0 {
            info!(count = recovered, "requeued jobs interrupted by restart");
        }

        for lane in [JobType::Transcribe, JobType::Translate] {
            for id in queue.store.pending_ids(lane).await? {
                let _ = queue.sender(lane).try_send(id);
            }
        }

        queue
            .clone()
            .spawn_worker(JobType::Transcribe, transcribe_rx, transcribe_handler);
        queue
            .clone()
            .spawn_worker(JobType::Translate, translate_rx, translate_handler);

        Ok(queue)
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        file_path: String,
        params: serde_json::Value,
    ) -> Result<Job, JobError> {
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            file_path,
            params,
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        self.store.insert(job.clone()).await?;

        // Non-blocking: a full lane just means the sweep picks the row up.
        if self.sender(job_type).try_send(job.id).is_err() {
            debug!(job_id = %job.id, lane = job_type.as_str(), "lane full, deferring to sweep");
        }

        info!(job_id = %job.id, lane = job_type.as_str(), "job enqueued");
        Ok(job)
    }

    /// Cancel a pending or running job. Returns whether a row transitioned.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool, JobError> {
        let token = self.cancels.lock().get(&id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        self.store.mark_cancelled(id, Utc::now()).await
    }

    /// Re-run a failed or cancelled job.
    pub async fn retry_job(&self, id: Uuid) -> Result<Job, JobError> {
        let job = self.store.get(id).await?.ok_or(JobError::NotFound(id))?;

        if !self.store.reset_for_retry(id).await? {
            return Err(JobError::InvalidState {
                id,
                status: job.status.as_str().to_string(),
                expected: "failed or cancelled",
            });
        }

        let _ = self.sender(job.job_type).try_send(id);
        info!(job_id = %id, "job queued for retry");

        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    fn sender(&self, lane: JobType) -> &mpsc::Sender<Uuid> {
        match lane {
            JobType::Transcribe => &self.transcribe_tx,
            JobType::Translate => &self.translate_tx,
        }
    }

    fn spawn_worker(
        self: Arc<Self>,
        lane: JobType,
        mut rx: mpsc::Receiver<Uuid>,
        handler: Arc<dyn JobHandler>,
    ) {
        tokio::spawn(async move {
            info!(lane = lane.as_str(), "worker started");
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    maybe_id = rx.recv() => match maybe_id {
                        Some(id) => self.process(lane, id, &handler).await,
                        None => break,
                    },
                    _ = sweep.tick() => {
                        // Catch rows that never made it into the channel.
                        match self.store.pending_ids(lane).await {
                            Ok(ids) => {
                                for id in ids {
                                    self.process(lane, id, &handler).await;
                                }
                            }
                            Err(e) => warn!(lane = lane.as_str(), error = %e, "pending sweep failed"),
                        }
                    }
                }
            }
            info!(lane = lane.as_str(), "worker stopped");
        });
    }

    async fn process(&self, lane: JobType, id: Uuid, handler: &Arc<dyn JobHandler>) {
        // Re-read the row: it may have been cancelled, retried, or already
        // handled through the other intake path.
        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id = %id, error = %e, "job lookup failed");
                return;
            }
        };

        if job.status != JobStatus::Pending || job.job_type != lane {
            return;
        }

        if let Err(e) = self.store.mark_running(id, Utc::now()).await {
            warn!(job_id = %id, error = %e, "could not mark job running");
            return;
        }

        let token = CancellationToken::new();
        self.cancels.lock().insert(id, token.clone());

        info!(job_id = %id, lane = lane.as_str(), file = %job.file_path, "job started");
        let progress = ProgressReporter::new(self.store.clone(), id);

        // Biased so a cancel-aware handler returns through its own
        // cancellation path; the token branch only fires while the handler
        // is blocked somewhere it cannot observe the token.
        let outcome = tokio::select! {
            biased;
            res = handler.run(&job, &token, &progress) => res,
            _ = token.cancelled() => Err(HandlerError::Cancelled),
        };

        self.cancels.lock().remove(&id);

        match outcome {
            Ok(result) => {
                if let Err(e) = self.store.mark_completed(id, result.clone(), Utc::now()).await {
                    error!(job_id = %id, error = %e, "could not persist completion");
                    return;
                }
                info!(job_id = %id, "job completed");
                if lane == JobType::Transcribe {
                    self.chain_translation(&job, &result).await;
                }
            }
            Err(HandlerError::Cancelled) => {
                let _ = self.store.mark_cancelled(id, Utc::now()).await;
                info!(job_id = %id, "job cancelled");
            }
            Err(e) => {
                let _ = self.store.mark_failed(id, e.to_string(), Utc::now()).await;
                warn!(job_id = %id, error = %e, "job failed");
            }
        }
    }

    /// A transcription that carries an embedded translation config chains a
    /// translate job for the produced subtitle. Chain problems are logged,
    /// never propagated back onto the finished job.
    async fn chain_translation(&self, job: &Job, result: &serde_json::Value) {
        let params: TranscribeParams = match serde_json::from_value(job.params.clone()) {
            Ok(p) => p,
            Err(_) => return,
        };
        let Some(config) = params.translate else {
            return;
        };
        let produced: TranscribeResult = match serde_json::from_value(result.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "transcribe result not chainable");
                return;
            }
        };

        let translate_params = TranslateParams {
            source: produced.subtitle_path,
            config,
        };
        let params_value = match serde_json::to_value(&translate_params) {
            Ok(v) => v,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not serialize chained params");
                return;
            }
        };

        match self
            .enqueue(JobType::Translate, job.file_path.clone(), params_value)
            .await
        {
            Ok(chained) => {
                info!(job_id = %job.id, chained_id = %chained.id, "chained translation job")
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to chain translation job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct MockHandler {
        delay: Duration,
        fail: bool,
        calls: Arc<Mutex<Vec<Uuid>>>,
        observed_cancel: Arc<AtomicBool>,
    }

    impl MockHandler {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
                calls: Arc::new(Mutex::new(Vec::new())),
                observed_cancel: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl JobHandler for MockHandler {
        async fn run(
            &self,
            job: &Job,
            cancel: &CancellationToken,
            progress: &ProgressReporter,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.lock().push(job.id);
            progress.set(0.1).await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    Err(HandlerError::Cancelled)
                }
                _ = tokio::time::sleep(self.delay) => {
                    if self.fail {
                        Err(HandlerError::Fatal("mock failure".to_string()))
                    } else {
                        Ok(serde_json::json!({
                            "subtitle_path": "generated/whisper_ja.vtt",
                            "language": "ja"
                        }))
                    }
                }
            }
        }
    }

    async fn wait_for_status(store: &JobStore, id: Uuid, status: JobStatus) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if job.status == status {
                    return job;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", status);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_success_chains_translation() {
        let store = JobStore::open_in_memory().unwrap();
        let transcribe = Arc::new(MockHandler::new(Duration::from_millis(10)));
        let translate = Arc::new(MockHandler::new(Duration::from_millis(10)));
        let translate_calls = translate.calls.clone();

        let queue = JobQueue::start(store.clone(), transcribe, translate)
            .await
            .unwrap();

        let job = queue
            .enqueue(
                JobType::Transcribe,
                "/media/ep1.mkv".to_string(),
                serde_json::json!({
                    "engine": "local",
                    "language": "auto",
                    "translate": {
                        "engine": "gemini",
                        "target_language": "ko",
                        "preset": "anime"
                    }
                }),
            )
            .await
            .unwrap();

        wait_for_status(&store, job.id, JobStatus::Completed).await;

        // Exactly one follow-up translate job, referencing the produced vtt.
        let deadline = Instant::now() + Duration::from_secs(5);
        let chained = loop {
            let all = store.list().await.unwrap();
            if let Some(j) = all.iter().find(|j| j.job_type == JobType::Translate) {
                break j.clone();
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(chained.params["source"], "generated/whisper_ja.vtt");
        assert_eq!(chained.params["target_language"], "ko");

        wait_for_status(&store, chained.id, JobStatus::Completed).await;
        assert_eq!(translate_calls.lock().len(), 1);

        let translate_jobs = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.job_type == JobType::Translate)
            .count();
        assert_eq!(translate_jobs, 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_chain() {
        let store = JobStore::open_in_memory().unwrap();
        let mut transcribe = MockHandler::new(Duration::from_millis(10));
        transcribe.fail = true;
        let translate = Arc::new(MockHandler::new(Duration::from_millis(10)));

        let queue = JobQueue::start(store.clone(), Arc::new(transcribe), translate)
            .await
            .unwrap();

        let job = queue
            .enqueue(
                JobType::Transcribe,
                "/media/ep1.mkv".to_string(),
                serde_json::json!({
                    "translate": {"engine": "gemini", "target_language": "ko"}
                }),
            )
            .await
            .unwrap();

        let failed = wait_for_status(&store, job.id, JobStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("mock failure"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let translate_jobs = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.job_type == JobType::Translate)
            .count();
        assert_eq!(translate_jobs, 0);
    }

    #[tokio::test]
    async fn test_cancellation_reaches_handler_quickly() {
        let store = JobStore::open_in_memory().unwrap();
        let transcribe = Arc::new(MockHandler::new(Duration::from_secs(30)));
        let observed = transcribe.observed_cancel.clone();
        let translate = Arc::new(MockHandler::new(Duration::from_millis(10)));

        let queue = JobQueue::start(store.clone(), transcribe, translate)
            .await
            .unwrap();

        let job = queue
            .enqueue(
                JobType::Transcribe,
                "/media/ep1.mkv".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        wait_for_status(&store, job.id, JobStatus::Running).await;

        let cancelled_at = Instant::now();
        assert!(queue.cancel_job(job.id).await.unwrap());
        wait_for_status(&store, job.id, JobStatus::Cancelled).await;
        assert!(cancelled_at.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observed.load(Ordering::SeqCst));

        // The row transitioned exactly once; a second cancel is a no-op.
        assert!(!queue.cancel_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_pending_job_is_skipped() {
        let store = JobStore::open_in_memory().unwrap();

        // Row goes in before the queue exists, then gets cancelled.
        let job = Job {
            id: Uuid::new_v4(),
            job_type: JobType::Transcribe,
            status: JobStatus::Pending,
            file_path: "/media/ep1.mkv".to_string(),
            params: serde_json::json!({}),
            progress: 0.0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        store.insert(job.clone()).await.unwrap();
        store.mark_cancelled(job.id, Utc::now()).await.unwrap();

        let transcribe = Arc::new(MockHandler::new(Duration::from_millis(5)));
        let calls = transcribe.calls.clone();
        let translate = Arc::new(MockHandler::new(Duration::from_millis(5)));
        let _queue = JobQueue::start(store.clone(), transcribe, translate)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.lock().is_empty());
        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_reruns_interrupted_jobs_in_order() {
        let store = JobStore::open_in_memory().unwrap();
        let base = Utc::now();

        let mut expected_order = Vec::new();
        for offset in [0i64, 1, 2] {
            let job = Job {
                id: Uuid::new_v4(),
                job_type: JobType::Transcribe,
                status: JobStatus::Pending,
                file_path: format!("/media/ep{}.mkv", offset),
                params: serde_json::json!({}),
                progress: 0.0,
                result: None,
                error: None,
                created_at: base + chrono::Duration::seconds(offset),
                started_at: None,
                completed_at: None,
            };
            store.insert(job.clone()).await.unwrap();
            // Simulate a worker killed mid-flight.
            store.mark_running(job.id, base).await.unwrap();
            expected_order.push(job.id);
        }

        let transcribe = Arc::new(MockHandler::new(Duration::from_millis(5)));
        let calls = transcribe.calls.clone();
        let translate = Arc::new(MockHandler::new(Duration::from_millis(5)));
        let _queue = JobQueue::start(store.clone(), transcribe, translate)
            .await
            .unwrap();

        for id in &expected_order {
            wait_for_status(&store, *id, JobStatus::Completed).await;
        }
        assert_eq!(*calls.lock(), expected_order);
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_failure() {
        let store = JobStore::open_in_memory().unwrap();
        let mut transcribe = MockHandler::new(Duration::from_millis(5));
        transcribe.fail = true;
        let translate = Arc::new(MockHandler::new(Duration::from_millis(5)));
        let queue = JobQueue::start(store.clone(), Arc::new(transcribe), translate)
            .await
            .unwrap();

        let job = queue
            .enqueue(
                JobType::Transcribe,
                "/media/ep1.mkv".to_string(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        wait_for_status(&store, job.id, JobStatus::Failed).await;

        let retried = queue.retry_job(job.id).await.unwrap();
        assert!(matches!(
            retried.status,
            JobStatus::Pending | JobStatus::Running | JobStatus::Failed
        ));

        // Retrying a completed job is rejected.
        wait_for_status(&store, job.id, JobStatus::Failed).await;
        store
            .mark_completed(job.id, serde_json::json!({}), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            queue.retry_job(job.id).await,
            Err(JobError::InvalidState { .. })
        ));
    }
}
