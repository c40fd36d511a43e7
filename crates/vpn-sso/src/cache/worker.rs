//! Runs cache operations off the connection loop.
//!
//! A single worker thread executes jobs in submission order, so a `Clear`
//! queued before a `Lookup` is always observed by that lookup.

use super::{CachedCredential, CredentialCache};
use crate::config::Protocol;
use crate::error::VpnSsoError;
use crate::secret::Credential;
use crossbeam_channel::{bounded, unbounded, Sender};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub enum CacheOp {
    Lookup {
        gateway: String,
        protocol: Protocol,
    },
    Store {
        gateway: String,
        protocol: Protocol,
        credential: Credential,
        ttl_hours: i64,
    },
    Clear {
        gateway: String,
        protocol: Protocol,
    },
    ClearAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReply {
    Lookup(Result<Option<CachedCredential>, VpnSsoError>),
    Stored(Result<CachedCredential, VpnSsoError>),
    Cleared(Result<(), VpnSsoError>),
}

type Completion = Box<dyn FnOnce(CacheReply) + Send>;

struct Job {
    op: CacheOp,
    done: Option<Completion>,
}

pub struct CacheWorker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    backend: &'static str,
}

impl CacheWorker {
    pub fn spawn(cache: CredentialCache) -> Self {
        let backend = cache.backend_name();
        let (jobs, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("credential-cache".into())
            .spawn(move || {
                for job in rx {
                    let reply = execute(&cache, job.op);
                    match job.done {
                        Some(done) => done(reply),
                        None => log_failure(&reply),
                    }
                }
                log::debug!("Credential cache worker stopped");
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Could not start the credential cache worker: {}", e);
                None
            }
        };

        Self {
            jobs: handle.as_ref().map(|_| jobs),
            handle,
            backend,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    /// Queues `op`; `done` runs on the worker thread with the result.
    pub fn submit(&self, op: CacheOp, done: impl FnOnce(CacheReply) + Send + 'static) {
        self.enqueue(Job {
            op,
            done: Some(Box::new(done)),
        });
    }

    /// Queues `op` whose result only matters if it failed.
    pub fn submit_logged(&self, op: CacheOp) {
        self.enqueue(Job { op, done: None });
    }

    /// Runs `op` and waits for its result.
    pub fn call(&self, op: CacheOp) -> CacheReply {
        let (tx, rx) = bounded(1);
        let fallback = unavailable_reply(&op);
        self.submit(op, move |reply| {
            let _ = tx.send(reply);
        });
        rx.recv().unwrap_or(fallback)
    }

    fn enqueue(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            let reply = unavailable_reply(&job.op);
            match job.done {
                Some(done) => done(reply),
                None => log_failure(&reply),
            }
            return;
        };
        if let Err(e) = jobs.send(job) {
            let job = e.into_inner();
            let reply = unavailable_reply(&job.op);
            if let Some(done) = job.done {
                done(reply);
            }
        }
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish pending jobs and exit.
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn execute(cache: &CredentialCache, op: CacheOp) -> CacheReply {
    match op {
        CacheOp::Lookup { gateway, protocol } => CacheReply::Lookup(cache.lookup(&gateway, protocol)),
        CacheOp::Store {
            gateway,
            protocol,
            mut credential,
            ttl_hours,
        } => {
            let result = cache.store(&gateway, protocol, &credential, ttl_hours);
            credential.wipe();
            CacheReply::Stored(result)
        }
        CacheOp::Clear { gateway, protocol } => CacheReply::Cleared(cache.clear(&gateway, protocol)),
        CacheOp::ClearAll => CacheReply::Cleared(cache.clear_all()),
    }
}

fn unavailable_reply(op: &CacheOp) -> CacheReply {
    let err = VpnSsoError::CacheIo("cache worker is not running".into());
    match op {
        CacheOp::Lookup { .. } => CacheReply::Lookup(Err(err)),
        CacheOp::Store { .. } => CacheReply::Stored(Err(err)),
        CacheOp::Clear { .. } | CacheOp::ClearAll => CacheReply::Cleared(Err(err)),
    }
}

fn log_failure(reply: &CacheReply) {
    let err = match reply {
        CacheReply::Lookup(Err(e)) | CacheReply::Stored(Err(e)) | CacheReply::Cleared(Err(e)) => e,
        _ => return,
    };
    log::warn!("Credential cache operation failed: {}", err);
}
