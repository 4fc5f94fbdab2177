// ============================================================================
// FILTER WORKER: one background job at a time, results over a channel
// ============================================================================
//
// A worker owns at most one running job. Submitting a new job cancels the
// running one and joins its thread first, so two jobs never touch the same
// document concurrently. Each job works on its own copy of the bitmap and
// reports back through `WorkerMessage`s tagged with the job id; callers drop
// messages from jobs they no longer care about.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbaImage};

use crate::error::{Result, StudioError};
use crate::ops::{CancelToken, Filter, JobContext, apply_filters};

/// Identifies one submitted job.
pub type JobId = u64;

#[derive(Debug)]
pub enum WorkerMessage {
    /// Overall progress of the job, 0.0..=1.0, non-decreasing.
    Progress { job: JobId, fraction: f32 },
    Completed { job: JobId, image: RgbaImage, elapsed_ms: u64 },
    /// The job saw its cancel token and stopped; no image is produced.
    Cancelled { job: JobId },
    Failed { job: JobId, error: String },
}

impl WorkerMessage {
    pub fn job(&self) -> JobId {
        match self {
            WorkerMessage::Progress { job, .. }
            | WorkerMessage::Completed { job, .. }
            | WorkerMessage::Cancelled { job }
            | WorkerMessage::Failed { job, .. } => *job,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, WorkerMessage::Progress { .. })
    }
}

struct RunningJob {
    id: JobId,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Background filter runner for one document.
pub struct FilterWorker {
    sender: Sender<WorkerMessage>,
    receiver: Receiver<WorkerMessage>,
    current: Option<RunningJob>,
    next_id: JobId,
}

impl Default for FilterWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterWorker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            current: None,
            next_id: 1,
        }
    }

    /// Run `filters` over `image` (optionally masked) on a worker thread.
    pub fn submit(&mut self, image: RgbaImage, filters: Vec<Filter>, mask: Option<GrayImage>) -> Result<JobId> {
        let label = filters.iter().map(|f| f.name()).collect::<Vec<_>>().join(" > ");
        self.submit_with(label, image, move |img, ctx| {
            apply_filters(img, &filters, mask.as_ref(), ctx)
        })
    }

    /// Run an arbitrary job closure. The closure receives the bitmap and a
    /// context wired to this worker's cancel token and progress channel.
    pub fn submit_with<F>(&mut self, label: impl Into<String>, image: RgbaImage, job: F) -> Result<JobId>
    where
        F: FnOnce(&RgbaImage, &JobContext) -> Result<RgbaImage> + Send + 'static,
    {
        self.cancel();

        let id = self.next_id;
        self.next_id += 1;
        let label = label.into();
        let cancel = CancelToken::new();
        let progress_tx = self.sender.clone();
        let ctx = JobContext::new()
            .with_cancel(cancel.clone())
            .with_progress(move |fraction| {
                let _ = progress_tx.send(WorkerMessage::Progress { job: id, fraction });
            });
        let tx = self.sender.clone();

        let handle = thread::Builder::new()
            .name(format!("filter-job-{id}"))
            .spawn(move || {
                tracing::debug!(job = id, %label, "filter job started");
                let started = Instant::now();
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&image, &ctx)));
                let message = match outcome {
                    Ok(Ok(image)) => WorkerMessage::Completed {
                        job: id,
                        image,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    Ok(Err(StudioError::Cancelled)) => WorkerMessage::Cancelled { job: id },
                    Ok(Err(e)) => WorkerMessage::Failed { job: id, error: e.to_string() },
                    Err(panic_info) => {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic payload".to_string()
                        };
                        tracing::error!(job = id, %label, "filter job panicked: {msg}");
                        WorkerMessage::Failed { job: id, error: format!("panicked: {msg}") }
                    }
                };
                tracing::debug!(job = id, %label, elapsed_ms = started.elapsed().as_millis() as u64, "filter job finished");
                let _ = tx.send(message);
            })?;

        self.current = Some(RunningJob { id, cancel, handle });
        Ok(id)
    }

    /// Cancel the running job (if any) and wait for its thread to exit.
    pub fn cancel(&mut self) {
        if let Some(job) = self.current.take() {
            job.cancel.cancel();
            if job.handle.join().is_err() {
                tracing::warn!(job = job.id, "filter job thread panicked while joining");
            }
        }
    }

    /// Id of the job submitted last, if its thread is still running.
    pub fn running_job(&self) -> Option<JobId> {
        self.current.as_ref().filter(|j| !j.handle.is_finished()).map(|j| j.id)
    }

    pub fn is_busy(&self) -> bool {
        self.running_job().is_some()
    }

    /// Next message, if one is waiting.
    pub fn try_recv(&self) -> Option<WorkerMessage> {
        self.receiver.try_recv().ok()
    }

    /// Block up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerMessage> {
        match self.receiver.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Block until `job` finishes, handing each of its progress reports to
    /// `on_progress`. Messages from other jobs are discarded.
    pub fn wait(&self, job: JobId, mut on_progress: impl FnMut(f32)) -> Result<RgbaImage> {
        loop {
            let msg = self
                .receiver
                .recv()
                .map_err(|_| StudioError::JobFailed("worker channel closed".into()))?;
            if msg.job() != job {
                continue;
            }
            match msg {
                WorkerMessage::Progress { fraction, .. } => on_progress(fraction),
                WorkerMessage::Completed { image, .. } => return Ok(image),
                WorkerMessage::Cancelled { .. } => return Err(StudioError::Cancelled),
                WorkerMessage::Failed { error, .. } => return Err(StudioError::JobFailed(error)),
            }
        }
    }
}

impl Drop for FilterWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn img() -> RgbaImage {
        RgbaImage::from_pixel(64, 64, Rgba([100, 100, 100, 255]))
    }

    /// Blocks until the job's token is tripped.
    fn spin_until_cancelled(_: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.check()?;
        unreachable!()
    }

    #[test]
    fn completed_job_reports_progress_then_image() {
        let mut worker = FilterWorker::new();
        let job = worker
            .submit(img(), vec![Filter::Brightness { amount: 50.0 }, Filter::Sepia { amount: 100.0 }], None)
            .unwrap();
        let mut seen = Vec::new();
        let out = worker.wait(job, |p| seen.push(p)).unwrap();
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn cancel_yields_cancelled_message() {
        let mut worker = FilterWorker::new();
        let job = worker.submit_with("spin", img(), spin_until_cancelled).unwrap();
        assert!(worker.is_busy());
        worker.cancel();
        assert!(!worker.is_busy());
        assert!(matches!(worker.wait(job, |_| {}), Err(StudioError::Cancelled)));
    }

    /// A new submission supersedes the running job.
    #[test]
    fn submit_cancels_previous_job() {
        let mut worker = FilterWorker::new();
        let first = worker.submit_with("spin", img(), spin_until_cancelled).unwrap();
        let second = worker.submit(img(), vec![Filter::Invert], None).unwrap();
        assert_ne!(first, second);

        let mut first_outcome = None;
        let mut second_image = None;
        while first_outcome.is_none() || second_image.is_none() {
            match worker.recv_timeout(Duration::from_secs(10)).expect("worker stalled") {
                WorkerMessage::Cancelled { job } if job == first => first_outcome = Some(()),
                WorkerMessage::Completed { job, image, .. } if job == second => second_image = Some(image),
                WorkerMessage::Progress { .. } => {}
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(second_image.unwrap().get_pixel(0, 0).0, [155, 155, 155, 255]);
    }

    #[test]
    fn failures_and_panics_are_reported() {
        let mut worker = FilterWorker::new();
        let job = worker
            .submit_with("bad", img(), |_, _| Err(StudioError::invalid("x", "nope")))
            .unwrap();
        assert!(matches!(worker.wait(job, |_| {}), Err(StudioError::JobFailed(msg)) if msg.contains("nope")));

        let job = worker.submit_with("boom", img(), |_, _| panic!("kaboom")).unwrap();
        assert!(matches!(worker.wait(job, |_| {}), Err(StudioError::JobFailed(msg)) if msg.contains("kaboom")));
    }
}
