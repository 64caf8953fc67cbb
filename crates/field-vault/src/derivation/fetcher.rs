//! [`SecretFetcher`]: runs root secret fetches on one long-lived worker thread.
//!
//! Callers queue a request and wait for the reply up to their timeout. A
//! caller that gives up leaves its request queued; the worker skips requests
//! whose deadline has passed. At most [`MAX_PENDING_FETCHES`] requests may be
//! queued or running at once, so a source that hangs costs one blocked thread
//! and a bounded queue, and later callers fail fast instead of waiting.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::secret::{RootSecret, SecretSource, SecretSourceError};

/// Upper bound on fetch requests queued or running on the worker.
pub const MAX_PENDING_FETCHES: usize = 64;

type FetchResult = Result<RootSecret, SecretSourceError>;

struct FetchRequest {
    deadline: Instant,
    reply: mpsc::SyncSender<FetchResult>,
    pending: Arc<AtomicUsize>,
}

impl Drop for FetchRequest {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct SecretFetcher {
    source: Arc<dyn SecretSource>,
    worker: Mutex<Option<mpsc::Sender<FetchRequest>>>,
    pending: Arc<AtomicUsize>,
}

impl SecretFetcher {
    pub(crate) fn new(source: Arc<dyn SecretSource>) -> Self {
        Self {
            source,
            worker: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests queued or running on the worker.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Fetch the root secret, waiting at most `timeout` for the worker.
    pub(crate) fn fetch(&self, timeout: Duration) -> FetchResult {
        if self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING_FETCHES).then_some(n + 1)
            })
            .is_err()
        {
            warn!(pending = MAX_PENDING_FETCHES, "secret fetch queue full");
            return Err(SecretSourceError::Busy(MAX_PENDING_FETCHES));
        }

        let (reply, rx) = mpsc::sync_channel(1);
        self.submit(FetchRequest {
            deadline: Instant::now() + timeout,
            reply,
            pending: Arc::clone(&self.pending),
        })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(timeout = ?timeout, "secret source fetch timed out");
                Err(SecretSourceError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SecretSourceError::Aborted),
        }
    }

    /// Hand `request` to the worker, starting a new one if there is none or
    /// the previous one died.
    fn submit(&self, request: FetchRequest) -> Result<(), SecretSourceError> {
        let mut worker = self.worker.lock();
        let request = match worker.as_ref() {
            Some(tx) => match tx.send(request) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(request)) => request,
            },
            None => request,
        };

        let (tx, rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        thread::Builder::new()
            .name("secret-fetch".into())
            .spawn(move || run_worker(source, rx))?;
        debug!("secret fetch worker started");

        tx.send(request).map_err(|_| SecretSourceError::Aborted)?;
        *worker = Some(tx);
        Ok(())
    }
}

/// Serve requests until every sender is gone.
fn run_worker(source: Arc<dyn SecretSource>, requests: mpsc::Receiver<FetchRequest>) {
    for request in requests {
        if Instant::now() >= request.deadline {
            continue;
        }
        let result = source.fetch();
        // release the slot before the caller wakes
        let reply = request.reply.clone();
        drop(request);
        let _ = reply.send(result);
    }
}
