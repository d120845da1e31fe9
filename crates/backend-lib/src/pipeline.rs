// ============================
// crates/backend-lib/src/pipeline.rs
// ============================
//! Ordered persistence pipeline.
//!
//! One lane per session: a spawned task that owns the receiving end of an
//! unbounded channel and awaits each job to completion before taking the
//! next. Jobs for one session therefore perform their store writes in
//! submission order (a track insert submitted before a like always lands
//! first), while lanes of different sessions run independently.
//!
//! A failing or panicking job never stops its lane. Lanes are created on
//! first submission and closed by [`PersistencePipeline::close`]; a closed
//! lane drains what is already queued and then its task exits.
use dashmap::DashMap;
use futures_util::{future::BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// A unit of persistence work
pub type Job = BoxFuture<'static, ()>;

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<()>,
}

#[derive(Clone)]
struct LaneHandle {
    id: u64,
    tx: mpsc::UnboundedSender<QueuedJob>,
}

/// Resolves once the submitted job has finished, whatever its outcome
pub struct JobCompletion(oneshot::Receiver<()>);

impl JobCompletion {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

#[derive(Clone, Default)]
pub struct PersistencePipeline {
    lanes: Arc<DashMap<String, LaneHandle>>,
    next_lane: Arc<AtomicU64>,
}

impl PersistencePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `job` to the lane of `session_id`.
    ///
    /// The job does not start until every job submitted earlier for the same
    /// session has completed.
    pub fn enqueue<F>(&self, session_id: &str, job: F) -> JobCompletion
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, completion) = oneshot::channel();
        let mut queued = QueuedJob {
            job: job.boxed(),
            done,
        };

        loop {
            let lane = self
                .lanes
                .entry(session_id.to_string())
                .or_insert_with(|| self.spawn_lane(session_id))
                .clone();

            match lane.tx.send(queued) {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    // The lane task is gone; replace it
                    self.lanes.remove_if(session_id, |_, l| l.id == lane.id);
                    queued = returned;
                },
            }
        }

        JobCompletion(completion)
    }

    /// Stop accepting work on a session's lane; queued jobs still run
    pub fn close(&self, session_id: &str) {
        if self.lanes.remove(session_id).is_some() {
            debug!(session_id, "Closed persistence lane");
        }
    }

    pub fn has_lane(&self, session_id: &str) -> bool {
        self.lanes.contains_key(session_id)
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn spawn_lane(&self, session_id: &str) -> LaneHandle {
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(session_id.to_string(), rx));
        debug!(session_id, lane = id, "Opened persistence lane");
        LaneHandle { id, tx }
    }
}

async fn run_lane(session_id: String, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { job, done }) = rx.recv().await {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(session_id = %session_id, "Persistence job panicked, continuing with next job");
        }
        let _ = done.send(());
    }
    debug!(session_id = %session_id, "Persistence lane drained");
}
