//! The background assignment worker.

use crate::assignment::{AssignmentEngine, AssignmentResult};
use crate::config::AssignmentConfig;
use crate::demand::OdDemand;
use crate::error::Error;
use crate::RoadGraph;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// An assignment run over frozen copies of the graph and demand.
struct AssignmentJob {
    id: u64,
    graph: Arc<RoadGraph>,
    demand: Arc<OdDemand>,
    config: AssignmentConfig,
    cancel: Arc<AtomicBool>,
}

/// A message from the worker thread.
#[derive(Debug)]
pub(crate) enum WorkerReply {
    Finished {
        job: u64,
        result: Box<AssignmentResult>,
    },
    Cancelled {
        job: u64,
    },
}

/// Owns the assignment thread and the channels to it.
pub(crate) struct AssignmentWorker {
    jobs: Option<Sender<AssignmentJob>>,
    replies: Receiver<WorkerReply>,
    thread: Option<JoinHandle<()>>,
    next_id: u64,
    in_flight: Option<(u64, Arc<AtomicBool>)>,
}

impl AssignmentWorker {
    /// Starts the worker thread.
    pub fn spawn() -> Result<Self, Error> {
        let (jobs, job_rx) = unbounded::<AssignmentJob>();
        let (reply_tx, replies) = unbounded();
        let thread = std::thread::Builder::new()
            .name("traffic-assignment".into())
            .spawn(move || run_jobs(job_rx, reply_tx))?;
        Ok(Self {
            jobs: Some(jobs),
            replies,
            thread: Some(thread),
            next_id: 1,
            in_flight: None,
        })
    }

    /// Whether a job has been submitted and not yet answered.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Submits a new run, cancelling any run still in flight.
    pub fn submit(
        &mut self,
        graph: Arc<RoadGraph>,
        demand: Arc<OdDemand>,
        config: &AssignmentConfig,
    ) -> Result<u64, Error> {
        self.cancel_in_flight();
        let id = self.next_id;
        self.next_id += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let job = AssignmentJob {
            id,
            graph,
            demand,
            config: config.clone(),
            cancel: cancel.clone(),
        };
        self.jobs
            .as_ref()
            .ok_or(Error::WorkerDisconnected)?
            .send(job)
            .map_err(|_| Error::WorkerDisconnected)?;
        self.in_flight = Some((id, cancel));
        log::debug!("submitted assignment job {}", id);
        Ok(id)
    }

    /// Asks the in-flight run, if any, to stop. Its reply will be discarded.
    /// Returns whether a run was cancelled.
    pub fn cancel_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some((id, flag)) => {
                flag.store(true, Ordering::Relaxed);
                log::debug!("cancelled assignment job {}", id);
                true
            }
            None => false,
        }
    }

    /// Returns the reply to the in-flight job if it has arrived, without blocking.
    pub fn try_recv(&mut self) -> Result<Option<WorkerReply>, Error> {
        loop {
            match self.replies.try_recv() {
                Ok(reply) => {
                    if let Some(reply) = self.accept(reply) {
                        return Ok(Some(reply));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(Error::WorkerDisconnected),
            }
        }
    }

    /// Waits up to `timeout` for the reply to the in-flight job.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<WorkerReply>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) => {
                    if let Some(reply) = self.accept(reply) {
                        return Ok(Some(reply));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::WorkerDisconnected),
            }
        }
    }

    /// Filters out replies to superseded jobs.
    fn accept(&mut self, reply: WorkerReply) -> Option<WorkerReply> {
        let job = match &reply {
            WorkerReply::Finished { job, .. } | WorkerReply::Cancelled { job } => *job,
        };
        match &self.in_flight {
            Some((id, _)) if *id == job => {
                self.in_flight = None;
                Some(reply)
            }
            _ => {
                log::trace!("discarding reply to stale assignment job {}", job);
                None
            }
        }
    }
}

impl Drop for AssignmentWorker {
    fn drop(&mut self) {
        self.cancel_in_flight();
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("assignment worker panicked");
            }
        }
    }
}

fn run_jobs(jobs: Receiver<AssignmentJob>, replies: Sender<WorkerReply>) {
    for job in jobs.iter() {
        let start = Instant::now();
        let engine = AssignmentEngine::new(&job.graph, &job.config).with_cancellation(&job.cancel);
        let reply = match engine.run(&job.demand) {
            Ok(result) => {
                log::debug!(
                    "assignment job {} finished in {:?} after {} iterations (gap {:.4})",
                    job.id,
                    start.elapsed(),
                    result.iterations,
                    result.relative_gap
                );
                WorkerReply::Finished {
                    job: job.id,
                    result: Box::new(result),
                }
            }
            Err(_) => WorkerReply::Cancelled { job: job.id },
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
}
