// ============================
// viewsync-lib/src/jobs.rs
// ============================
//! Media tools job queue: remux, re-encode, and sidecar extraction run as
//! asynchronous jobs against an in-process queue, gated behind a separate
//! password. None of this sits on the sync hot path; a job's only contact
//! with playback is that extraction updates a track manifest on completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;
use viewsync_common::model::TrackKind;

use crate::error::AppError;

/// What a job does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    /// Copy streams into a new container, no re-encode.
    Remux { container: String },
    /// Decode, optionally scale, encode with the chosen codec/bitrate.
    #[serde(rename_all = "camelCase")]
    Reencode {
        codec: String,
        bitrate_kbps: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        scale_width: Option<u32>,
    },
    /// One sidecar per matching stream; VTT output is post-processed to
    /// drop duplicate cues.
    #[serde(rename_all = "camelCase")]
    Extract {
        kind: TrackKind,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        language: Option<String>,
    },
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Remux { .. } => "remux",
            JobKind::Reencode { .. } => "reencode",
            JobKind::Extract { .. } => "extract",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A job as exposed over `/api/ffmpeg/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub filename: String,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// What the worker hands a runner.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub kind: JobKind,
    pub filename: String,
}

/// Live handle a runner uses to report progress and observe cancellation.
pub struct JobContext {
    id: String,
    jobs: Arc<DashMap<String, JobRecord>>,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn set_progress(&self, progress: u8) {
        if let Some(mut record) = self.jobs.get_mut(&self.id) {
            record.progress = progress.min(100);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Executes one job. Real runners drive an encoder subprocess; the queue
/// only cares about the outcome. Partial outputs on failure or cancel are
/// left on disk for the operator.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<(), String>;
}

/// Runner used when no encoder toolchain is wired up: every job fails with
/// a clear operator-facing error instead of hanging.
pub struct UnavailableRunner;

#[async_trait]
impl JobRunner for UnavailableRunner {
    async fn run(&self, _spec: &JobSpec, _ctx: &JobContext) -> Result<(), String> {
        Err("no encoder toolchain configured on this host".to_string())
    }
}

struct Queued {
    spec: JobSpec,
}

/// The in-process job queue. Jobs run one at a time, in submission order.
pub struct JobQueue {
    password_hash: Option<[u8; 32]>,
    jobs: Arc<DashMap<String, JobRecord>>,
    cancel_flags: Arc<DashMap<String, Arc<AtomicBool>>>,
    tx: mpsc::UnboundedSender<Queued>,
}

impl JobQueue {
    /// An empty password leaves the queue disabled: authentication always
    /// fails and enqueueing is refused.
    pub fn new(password: &str, runner: Arc<dyn JobRunner>) -> Arc<Self> {
        let password_hash = if password.is_empty() {
            None
        } else {
            let digest = Sha256::digest(password.as_bytes());
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&digest);
            Some(hash)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            password_hash,
            jobs: Arc::new(DashMap::new()),
            cancel_flags: Arc::new(DashMap::new()),
            tx,
        });

        tokio::spawn(Self::worker(
            queue.jobs.clone(),
            queue.cancel_flags.clone(),
            runner,
            rx,
        ));
        queue
    }

    pub fn enabled(&self) -> bool {
        self.password_hash.is_some()
    }

    /// SHA-256 compare of the presented password.
    pub fn verify_password(&self, presented: &str) -> bool {
        match &self.password_hash {
            Some(hash) => {
                let digest = Sha256::digest(presented.as_bytes());
                digest[..] == hash[..]
            },
            None => false,
        }
    }

    pub fn enqueue(&self, kind: JobKind, filename: String) -> Result<String, AppError> {
        if !self.enabled() {
            return Err(AppError::Auth("media tools are disabled".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            type_name: kind.type_name().to_string(),
            filename: filename.clone(),
            status: JobStatus::Pending,
            progress: 0,
            start_time: Utc::now(),
            duration: None,
            error: None,
        };
        self.jobs.insert(id.clone(), record);
        self.cancel_flags
            .insert(id.clone(), Arc::new(AtomicBool::new(false)));

        self.tx
            .send(Queued {
                spec: JobSpec {
                    id: id.clone(),
                    kind,
                    filename,
                },
            })
            .map_err(|_| AppError::Internal("job worker is gone".to_string()))?;
        Ok(id)
    }

    /// Mark a job cancelled. Pending jobs are skipped by the worker;
    /// running jobs observe the flag through their context.
    pub fn cancel(&self, job_id: &str) -> Result<(), AppError> {
        let flag = self
            .cancel_flags
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        flag.store(true, Ordering::SeqCst);

        if let Some(mut record) = self.jobs.get_mut(job_id) {
            if record.status == JobStatus::Pending {
                record.status = JobStatus::Cancelled;
            }
        }
        info!(job = job_id, "job cancel requested");
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.iter().map(|r| r.value().clone()).collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        jobs
    }

    async fn worker(
        jobs: Arc<DashMap<String, JobRecord>>,
        cancel_flags: Arc<DashMap<String, Arc<AtomicBool>>>,
        runner: Arc<dyn JobRunner>,
        mut rx: mpsc::UnboundedReceiver<Queued>,
    ) {
        while let Some(Queued { spec }) = rx.recv().await {
            let cancelled = cancel_flags
                .get(&spec.id)
                .map(|f| f.value().clone())
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

            if cancelled.load(Ordering::SeqCst) {
                // cancelled while still pending
                continue;
            }

            let started = Utc::now();
            if let Some(mut record) = jobs.get_mut(&spec.id) {
                record.status = JobStatus::Running;
                record.start_time = started;
            }

            let ctx = JobContext {
                id: spec.id.clone(),
                jobs: jobs.clone(),
                cancelled: cancelled.clone(),
            };
            let result = runner.run(&spec, &ctx).await;

            let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
            if let Some(mut record) = jobs.get_mut(&spec.id) {
                record.duration = Some(elapsed);
                if cancelled.load(Ordering::SeqCst) {
                    record.status = JobStatus::Cancelled;
                } else {
                    match result {
                        Ok(()) => {
                            record.status = JobStatus::Completed;
                            record.progress = 100;
                        },
                        Err(message) => {
                            warn!(job = %spec.id, error = %message, "job failed");
                            record.status = JobStatus::Failed;
                            record.error = Some(message);
                        },
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use tokio::time::{sleep, Duration};

    struct InstantRunner;

    #[async_trait]
    impl JobRunner for InstantRunner {
        async fn run(&self, _spec: &JobSpec, ctx: &JobContext) -> Result<(), String> {
            ctx.set_progress(50);
            Ok(())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl JobRunner for FailingRunner {
        async fn run(&self, _spec: &JobSpec, _ctx: &JobContext) -> Result<(), String> {
            Err("encoder exploded".to_string())
        }
    }

    struct GatedRunner {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, _spec: &JobSpec, ctx: &JobContext) -> Result<(), String> {
            self.release.notified().await;
            if ctx.is_cancelled() {
                return Err("killed".to_string());
            }
            Ok(())
        }
    }

    async fn wait_for_status(queue: &JobQueue, id: &str, status: JobStatus) -> JobRecord {
        for _ in 0..100 {
            if let Some(record) = queue.get(id) {
                if record.status == status {
                    return record;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn password_gate_is_sha256_compare() {
        let queue = JobQueue::new("hunter2", Arc::new(InstantRunner));
        assert!(queue.enabled());
        assert!(queue.verify_password("hunter2"));
        assert!(!queue.verify_password("wrong"));
    }

    #[tokio::test]
    async fn empty_password_disables_queue() {
        let queue = JobQueue::new("", Arc::new(InstantRunner));
        assert!(!queue.enabled());
        assert!(!queue.verify_password(""));
        assert!(matches!(
            queue.enqueue(
                JobKind::Remux {
                    container: "mp4".to_string()
                },
                "a.mkv".to_string()
            ),
            Err(AppError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn job_completes_with_full_progress() {
        let queue = JobQueue::new("pw", Arc::new(InstantRunner));
        let id = queue
            .enqueue(
                JobKind::Extract {
                    kind: TrackKind::Subtitle,
                    language: Some("en".to_string()),
                },
                "movie.mkv".to_string(),
            )
            .unwrap();

        let record = wait_for_status(&queue, &id, JobStatus::Completed).await;
        assert_eq!(record.progress, 100);
        assert_eq!(record.type_name, "extract");
        assert!(record.duration.is_some());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn failed_job_keeps_error_string() {
        let queue = JobQueue::new("pw", Arc::new(FailingRunner));
        let id = queue
            .enqueue(
                JobKind::Reencode {
                    codec: "libx265".to_string(),
                    bitrate_kbps: 2000,
                    scale_width: Some(1280),
                },
                "movie.mkv".to_string(),
            )
            .unwrap();

        let record = wait_for_status(&queue, &id, JobStatus::Failed).await;
        assert_eq!(record.error.as_deref(), Some("encoder exploded"));
    }

    #[tokio::test]
    async fn running_job_can_be_cancelled() {
        let release = Arc::new(Notify::new());
        let queue = JobQueue::new(
            "pw",
            Arc::new(GatedRunner {
                release: release.clone(),
            }),
        );
        let id = queue
            .enqueue(
                JobKind::Remux {
                    container: "mkv".to_string(),
                },
                "movie.avi".to_string(),
            )
            .unwrap();

        wait_for_status(&queue, &id, JobStatus::Running).await;
        queue.cancel(&id).unwrap();
        release.notify_one();

        let record = wait_for_status(&queue, &id, JobStatus::Cancelled).await;
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let queue = JobQueue::new("pw", Arc::new(InstantRunner));
        assert!(matches!(
            queue.cancel("nope"),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn completed_extract_is_visible_to_rescan() {
        use crate::media::{
            FsMediaLibrary, MediaLibrary, NoProbe, SidecarRecord, TrackManifest,
        };
        use tempfile::TempDir;
        use viewsync_common::model::EXTERNAL_TRACK_BASE;

        struct ExtractRunner {
            library: Arc<FsMediaLibrary>,
        }

        #[async_trait]
        impl JobRunner for ExtractRunner {
            async fn run(&self, spec: &JobSpec, ctx: &JobContext) -> Result<(), String> {
                ctx.set_progress(90);
                let manifest = TrackManifest {
                    last_seen: Utc::now(),
                    external_tracks: vec![SidecarRecord {
                        kind: TrackKind::Subtitle,
                        lang: "en".to_string(),
                        title: "English".to_string(),
                        path: format!("/tmp/{}.en.vtt", spec.filename),
                        url: format!("/tracks/{}.en.vtt", spec.filename),
                    }],
                };
                self.library
                    .write_manifest(&spec.filename, &manifest)
                    .await
                    .map_err(|e| e.to_string())
            }
        }

        let media_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        let library = Arc::new(
            FsMediaLibrary::new(
                media_dir.path().to_path_buf(),
                data_dir.path(),
                Box::new(NoProbe),
            )
            .unwrap(),
        );

        let queue = JobQueue::new(
            "pw",
            Arc::new(ExtractRunner {
                library: library.clone(),
            }),
        );
        let id = queue
            .enqueue(
                JobKind::Extract {
                    kind: TrackKind::Subtitle,
                    language: Some("en".to_string()),
                },
                "movie.mkv".to_string(),
            )
            .unwrap();
        wait_for_status(&queue, &id, JobStatus::Completed).await;

        let tracks = library.tracks_for("movie.mkv").await.unwrap();
        let sidecar = tracks.subtitles.first().expect("no sidecar after extract");
        assert!(sidecar.index >= EXTERNAL_TRACK_BASE);
        assert!(sidecar.is_external);
        assert_eq!(sidecar.language, "en");
    }
}
