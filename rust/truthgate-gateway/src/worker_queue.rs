//! A bounded pool of job workers behind a FIFO queue.
//!
//! [WorkerQueue] is a handle to the pool; submitting is non-blocking and
//! jobs run on whichever worker frees up first. Workers that exceed the
//! configured timeout are cycled and their job requeued, up to the retry
//! limit. Dropping the handle terminates all processing.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// An interface to perform work within the context of a [WorkerQueue].
#[async_trait]
pub trait Processor: Clone {
    /// Shared context handed to every job.
    type Context: Clone + Send + Sync + 'static;
    /// An individual unit of work.
    type Job: Debug + Clone + Send + 'static;

    /// Process one job. On success, may return a follow-up job to queue.
    async fn process(context: Self::Context, job: Self::Job) -> Result<Option<Self::Job>>;
}

type WorkerResponse<J> = (usize, Result<Option<J>>);

/// A job plus the metadata needed for timeout and retry accounting.
struct JobRequest<P: Processor> {
    job: P::Job,
    attempt: usize,
    start_time: Option<SystemTime>,
}

impl<P: Processor> JobRequest<P> {
    fn new(job: P::Job) -> Self {
        JobRequest {
            job,
            attempt: 0,
            start_time: None,
        }
    }

    /// Record a failed attempt; returns whether the job gets another try.
    fn mark_attempt_failed(&mut self, retries: usize) -> bool {
        self.start_time = None;
        self.attempt < retries
    }
}

impl<P: Processor> Debug for JobRequest<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("job", &self.job)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// One worker task and its bookkeeping.
struct Worker<P: Processor> {
    active_job: Option<JobRequest<P>>,
    request_tx: UnboundedSender<P::Job>,
    handle: JoinHandle<Result<()>>,
}

impl<P: Processor + 'static> Worker<P> {
    fn spawn(
        worker_id: usize,
        context: P::Context,
        response_tx: UnboundedSender<WorkerResponse<P::Job>>,
    ) -> Self {
        let (request_tx, mut request_rx) = unbounded_channel::<P::Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = request_rx.recv().await {
                let result = P::process(context.clone(), job).await;
                response_tx
                    .send((worker_id, result))
                    .map_err(|error| anyhow!("error sending worker response: {}", error))?;
            }
            Ok(())
        });
        Worker {
            active_job: None,
            request_tx,
            handle,
        }
    }

    fn idle(&self) -> bool {
        self.active_job.is_none()
    }

    fn job_elapsed_time(&self, now: &SystemTime) -> Option<Duration> {
        let start = self.active_job.as_ref()?.start_time?;
        now.duration_since(start).ok()
    }

    fn clear(&mut self) -> Option<JobRequest<P>> {
        self.active_job.take()
    }

    fn process_job(&mut self, mut request: JobRequest<P>) -> Result<()> {
        if !self.idle() {
            return Err(anyhow!("worker is busy"));
        }
        let job = request.job.clone();
        request.attempt += 1;
        request.start_time = Some(SystemTime::now());
        self.active_job = Some(request);
        self.request_tx
            .send(job)
            .map_err(|_| anyhow!("error sending job to worker"))
    }

    fn terminate(&mut self) -> Option<JobRequest<P>> {
        let request = self.active_job.take();
        self.handle.abort();
        request
    }
}

impl<P: Processor> Drop for Worker<P> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Orchestrator<P: Processor> {
    workers: Vec<Worker<P>>,
    retries: usize,
    timeout: Duration,
    job_queue: VecDeque<JobRequest<P>>,
    worker_context: P::Context,
    response_tx: UnboundedSender<WorkerResponse<P::Job>>,
}

impl<P: Processor + 'static> Orchestrator<P> {
    fn process_queue(&mut self) {
        if self.job_queue.is_empty() {
            return;
        }
        for worker in self.workers.iter_mut() {
            if worker.idle() {
                match self.job_queue.pop_front() {
                    Some(request) => {
                        if let Err(error) = worker.process_job(request) {
                            error!("failed to hand job to worker: {}", error);
                        }
                    }
                    None => return,
                }
            }
        }
    }

    fn process_failed_job(&mut self, mut request: JobRequest<P>) {
        if request.mark_attempt_failed(self.retries) {
            self.job_queue.push_back(request);
        } else {
            error!("job reached retry limit: {:?}", request);
        }
    }

    fn process_result(&mut self, worker_id: usize, result: Result<Option<P::Job>>) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };
        let Some(request) = worker.clear() else {
            return;
        };
        match result {
            Ok(Some(follow_up)) => self.job_queue.push_back(JobRequest::new(follow_up)),
            Ok(None) => {}
            Err(error) => {
                error!("error processing job: {}", error);
                self.process_failed_job(request);
            }
        }
    }

    fn process_timed_out_jobs(&mut self) {
        let now = SystemTime::now();
        let timeout = self.timeout;
        let stuck: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter_map(|(index, worker)| {
                (worker.job_elapsed_time(&now)? >= timeout).then_some(index)
            })
            .collect();
        for index in stuck {
            let replacement = Worker::spawn(
                index,
                self.worker_context.clone(),
                self.response_tx.clone(),
            );
            let mut old = std::mem::replace(&mut self.workers[index], replacement);
            if let Some(request) = old.terminate() {
                warn!("cycling timed out worker {}", index);
                self.process_failed_job(request);
            }
        }
    }

    /// When to next check for timeouts: the remaining allowance of the
    /// longest running job, or the full timeout when everything is idle.
    fn timeout_check_in(&self) -> Duration {
        let now = SystemTime::now();
        let mut next = self.timeout;
        for worker in self.workers.iter() {
            if let Some(elapsed) = worker.job_elapsed_time(&now) {
                next = next.min(self.timeout.saturating_sub(elapsed));
            }
        }
        next.max(Duration::from_millis(10))
    }

    async fn run(
        mut self,
        mut request_rx: UnboundedReceiver<P::Job>,
        mut response_rx: UnboundedReceiver<WorkerResponse<P::Job>>,
    ) {
        loop {
            let timeout_check = tokio::time::sleep(self.timeout_check_in());
            tokio::pin!(timeout_check);

            tokio::select! {
                Some(job) = request_rx.recv() => {
                    self.job_queue.push_back(JobRequest::new(job));
                }
                Some((worker_id, result)) = response_rx.recv() => {
                    self.process_result(worker_id, result);
                }
                _ = &mut timeout_check => {
                    self.process_timed_out_jobs();
                }
            }
            self.process_queue();
        }
    }
}

/// Handle to a pool of workers; all processing stops when dropped.
pub struct WorkerQueue<P: Processor + 'static> {
    handle: JoinHandle<()>,
    request_tx: UnboundedSender<P::Job>,
}

impl<P: Processor + 'static> WorkerQueue<P> {
    /// Spawn the pool. `retries` and `timeout` default to 0 and 5 minutes.
    pub fn spawn(
        worker_count: usize,
        worker_context: P::Context,
        retries: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(anyhow!("worker_count must be greater than 0"));
        }
        let (request_tx, request_rx) = unbounded_channel();
        let (response_tx, response_rx) = unbounded_channel();

        let workers = (0..worker_count)
            .map(|id| Worker::spawn(id, worker_context.clone(), response_tx.clone()))
            .collect();
        let orchestrator = Orchestrator::<P> {
            workers,
            retries: retries.unwrap_or(0),
            timeout: timeout.unwrap_or_else(|| Duration::from_secs(60 * 5)),
            job_queue: VecDeque::new(),
            worker_context,
            response_tx,
        };
        let handle = tokio::spawn(orchestrator.run(request_rx, response_rx));

        Ok(WorkerQueue { handle, request_tx })
    }

    /// Queue a job for the next available worker.
    pub fn submit(&self, job: P::Job) -> Result<()> {
        self.request_tx
            .send(job)
            .map_err(|_| anyhow!("worker queue is shut down"))
    }
}

impl<P: Processor + 'static> Drop for WorkerQueue<P> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct Recorder;

    #[async_trait]
    impl Processor for Recorder {
        type Context = Arc<AtomicUsize>;
        type Job = usize;

        async fn process(context: Self::Context, job: Self::Job) -> Result<Option<Self::Job>> {
            if job == 0 {
                return Err(anyhow!("job zero always fails"));
            }
            context.fetch_add(job, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn jobs_run_on_the_pool() {
        let total = Arc::new(AtomicUsize::new(0));
        let queue = WorkerQueue::<Recorder>::spawn(2, total.clone(), None, None).unwrap();
        for job in [1usize, 2, 3, 4] {
            queue.submit(job).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_up_to_the_limit() {
        #[derive(Clone)]
        struct FailOnce;

        #[async_trait]
        impl Processor for FailOnce {
            type Context = Arc<AtomicUsize>;
            type Job = usize;

            async fn process(context: Self::Context, _job: Self::Job) -> Result<Option<Self::Job>> {
                let attempts = context.fetch_add(1, Ordering::SeqCst);
                if attempts == 0 {
                    Err(anyhow!("first attempt fails"))
                } else {
                    Ok(None)
                }
            }
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        let queue = WorkerQueue::<FailOnce>::spawn(1, attempts.clone(), Some(1), None).unwrap();
        queue.submit(7).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
