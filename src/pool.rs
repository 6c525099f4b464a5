//! Bounded worker pools fronting a named group of backend endpoints
//!
//! Every endpoint gets one long-lived worker task. Workers share a single
//! bounded job queue, so whichever worker is idle picks up the next job.
//! The queue holds [`QUEUE_DEPTH_PER_ENDPOINT`] jobs per endpoint; once it
//! is full, [`BackendPool::submit`] waits for room instead of failing.

use crate::config::Config;
use crate::error::{BackendError, ConfigError};
use crate::fcgi::FcgiClient;
use crate::proxy::ProxyClient;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info};

/// Queue slots reserved for each endpoint of a pool
pub const QUEUE_DEPTH_PER_ENDPOINT: usize = 100;

/// A unit of work waiting for a backend; completed exactly once by a worker
#[derive(Debug)]
pub struct Job<T> {
    reply: oneshot::Sender<T>,
}

impl<T> Job<T> {
    /// Hand the lease back to the submitter. A submitter that has gone away
    /// is not an error.
    pub fn complete(self, lease: T) {
        let _ = self.reply.send(lease);
    }
}

/// One endpoint's job processor
pub trait Worker: Send + Sync + 'static {
    /// What a submitter receives for its job
    type Lease: Send + 'static;

    fn endpoint(&self) -> &str;

    /// Service one job. Holding the returned future keeps this worker busy.
    fn serve(&self, job: Job<Self::Lease>) -> impl Future<Output = ()> + Send;
}

pub struct BackendPool<W: Worker> {
    name: String,
    endpoints: Vec<String>,
    jobs: mpsc::Sender<Job<W::Lease>>,
    shutdown: mpsc::Sender<()>,
    capacity: usize,
    closed: AtomicBool,
}

impl<W: Worker> BackendPool<W> {
    /// Spawn one worker task per endpoint
    pub fn start(name: impl Into<String>, workers: Vec<W>) -> Self {
        let name = name.into();
        let capacity = workers.len().max(1) * QUEUE_DEPTH_PER_ENDPOINT;
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(workers.len().max(1));
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let shutdown_rx = Arc::new(Mutex::new(shutdown_rx));

        let endpoints = workers.iter().map(|w| w.endpoint().to_string()).collect();
        for worker in workers {
            info!(pool = %name, server = %worker.endpoint(), "Starting backend worker");
            tokio::spawn(run_worker(
                name.clone(),
                worker,
                Arc::clone(&jobs_rx),
                Arc::clone(&shutdown_rx),
            ));
        }

        Self {
            name,
            endpoints,
            jobs: jobs_tx,
            shutdown: shutdown_tx,
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a job and wait for a worker to complete it.
    ///
    /// Waits for queue space when the pool is saturated. Fails only when the
    /// pool has been shut down.
    pub async fn submit(&self) -> Result<W::Lease, BackendError> {
        if self.is_closed() {
            return Err(BackendError::PoolClosed(self.name.clone()));
        }

        let (reply, lease) = oneshot::channel();
        self.jobs
            .send(Job { reply })
            .await
            .map_err(|_| BackendError::PoolClosed(self.name.clone()))?;

        lease
            .await
            .map_err(|_| BackendError::PoolClosed(self.name.clone()))
    }

    /// Signal every worker to stop after its current job.
    ///
    /// Jobs already picked up are not cancelled; jobs still queued when the
    /// last worker exits are dropped and their submitters see `PoolClosed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in &self.endpoints {
            let _ = self.shutdown.try_send(());
        }
        debug!(pool = %self.name, "Backend pool shutdown signalled");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Queue capacity (endpoint count times the per-endpoint depth)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.capacity - self.jobs.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn run_worker<W: Worker>(
    pool: String,
    worker: W,
    jobs: Arc<Mutex<mpsc::Receiver<Job<W::Lease>>>>,
    shutdown: Arc<Mutex<mpsc::Receiver<()>>>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = async { shutdown.lock().await.recv().await } => None,
            job = async { jobs.lock().await.recv().await } => job,
        };

        match job {
            Some(job) => worker.serve(job).await,
            None => break,
        }
    }
    debug!(pool = %pool, server = %worker.endpoint(), "Backend worker stopped");
}

/// Dials a fresh FastCGI connection for every job
#[derive(Debug)]
pub struct FcgiWorker {
    addr: String,
}

impl FcgiWorker {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Worker for FcgiWorker {
    type Lease = Result<FcgiClient, BackendError>;

    fn endpoint(&self) -> &str {
        &self.addr
    }

    fn serve(&self, job: Job<Self::Lease>) -> impl Future<Output = ()> + Send {
        let addr = self.addr.clone();
        async move {
            // The dial runs on its own task so the worker can take the next job
            tokio::spawn(async move {
                job.complete(FcgiClient::dial(&addr).await);
            });
        }
    }
}

/// Hands out the endpoint's long-lived proxy client
#[derive(Debug)]
pub struct ProxyWorker {
    client: Arc<ProxyClient>,
}

impl ProxyWorker {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client: Arc::new(ProxyClient::new(base_url)?),
        })
    }
}

impl Worker for ProxyWorker {
    type Lease = Arc<ProxyClient>;

    fn endpoint(&self) -> &str {
        self.client.base_url()
    }

    fn serve(&self, job: Job<Self::Lease>) -> impl Future<Output = ()> + Send {
        job.complete(Arc::clone(&self.client));
        std::future::ready(())
    }
}

pub type FcgiPool = BackendPool<FcgiWorker>;
pub type ProxyPool = BackendPool<ProxyWorker>;

impl BackendPool<FcgiWorker> {
    pub fn fastcgi(name: &str, servers: &[String]) -> Self {
        Self::start(name, servers.iter().map(FcgiWorker::new).collect())
    }
}

impl BackendPool<ProxyWorker> {
    /// Build one proxy client per upstream; any invalid URL fails the group
    pub fn proxy(name: &str, upstreams: &[String]) -> Result<Self, ConfigError> {
        let workers = upstreams
            .iter()
            .map(|url| ProxyWorker::new(url))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::start(name, workers))
    }
}

/// Every pool of one server generation, by group name
#[derive(Default)]
pub struct BackendPools {
    fcgi: BTreeMap<String, Arc<FcgiPool>>,
    proxy: BTreeMap<String, Arc<ProxyPool>>,
}

impl BackendPools {
    /// Start a pool per configured group. A proxy group with an unusable
    /// upstream URL is logged and left out.
    pub fn start(config: &Config) -> Self {
        let mut pools = Self::default();
        for (name, servers) in &config.fcgi {
            pools
                .fcgi
                .insert(name.clone(), Arc::new(FcgiPool::fastcgi(name, servers)));
        }
        for (name, upstreams) in &config.proxy {
            match ProxyPool::proxy(name, upstreams) {
                Ok(pool) => {
                    pools.proxy.insert(name.clone(), Arc::new(pool));
                }
                Err(e) => error!(pool = %name, error = %e, "Skipping proxy group"),
            }
        }
        pools
    }

    pub fn fcgi(&self, name: &str) -> Option<Arc<FcgiPool>> {
        self.fcgi.get(name).cloned()
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<ProxyPool>> {
        self.proxy.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.fcgi.len() + self.proxy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal shutdown to every pool
    pub fn shutdown(&self) {
        for pool in self.fcgi.values() {
            pool.shutdown();
        }
        for pool in self.proxy.values() {
            pool.shutdown();
        }
    }
}
