//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Session worker pool
//!
//! Each [`SessionWorker`] is a long-lived task that serves one connection at a
//! time. The accept loop hands a new connection to the first idle worker and
//! only spawns a new one when every worker is busy, so the pool grows to the
//! peak number of concurrent sessions and stays there until shutdown.
//!
//! ```text
//! accept loop ──dispatch──▶ WorkerPool ──mpsc(1)──▶ SessionWorker ──▶ SessionEngine::run
//! ```

use crate::session::panic_message;
use crate::{ConnectionId, DeviceConnection, SessionEngine, WorkerId};
use futures::FutureExt;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

#[cfg(feature = "tls")]
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

/// Connection state as handed to a worker
pub(crate) enum Pending {
    /// Ready to run a session
    Ready(DeviceConnection),
    /// TLS handshake still to be done, on the worker
    #[cfg(feature = "tls")]
    Tls {
        stream: TcpStream,
        acceptor: TlsAcceptor,
    },
}

/// One connection on its way to a worker
pub(crate) struct Assignment {
    id: ConnectionId,
    peer: SocketAddr,
    closer: CancellationToken,
    pending: Pending,
}

impl Assignment {
    pub(crate) fn ready(connection: DeviceConnection) -> Self {
        Self {
            id: connection.id(),
            peer: connection.peer_addr(),
            closer: connection.close_handle(),
            pending: Pending::Ready(connection),
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn tls(
        id: ConnectionId,
        peer: SocketAddr,
        stream: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Self {
        Self {
            id,
            peer,
            closer: CancellationToken::new(),
            pending: Pending::Tls { stream, acceptor },
        }
    }
}

/// What a busy worker is serving
#[derive(Debug)]
struct ActiveSession {
    connection_id: ConnectionId,
    peer: SocketAddr,
    closer: CancellationToken,
    since: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one worker task
///
/// The task owns only the receiving end of the channel, so dropping the
/// handle lets the task finish its current session and exit.
struct SessionWorker {
    id: WorkerId,
    slot: Arc<Mutex<Option<ActiveSession>>>,
    tx: mpsc::Sender<Assignment>,
}

impl SessionWorker {
    fn spawn(id: WorkerId, engine: Arc<SessionEngine>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let slot = Arc::new(Mutex::new(None));
        tokio::spawn(
            worker_loop(engine, slot.clone(), rx).instrument(info_span!("worker", worker_id = %id)),
        );
        Self { id, slot, tx }
    }

    fn is_idle(&self) -> bool {
        lock(&self.slot).is_none()
    }

    /// Hand `assignment` over if this worker is idle, otherwise give it back
    ///
    /// The slot stays locked until the send succeeded so two dispatches can
    /// never both see the worker as idle.
    fn try_assign(&self, assignment: Assignment) -> Result<(), Assignment> {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return Err(assignment);
        }
        let active = ActiveSession {
            connection_id: assignment.id,
            peer: assignment.peer,
            closer: assignment.closer.clone(),
            since: Instant::now(),
        };
        match self.tx.try_send(assignment) {
            Ok(()) => {
                *slot = Some(active);
                Ok(())
            }
            Err(TrySendError::Full(assignment)) | Err(TrySendError::Closed(assignment)) => {
                Err(assignment)
            }
        }
    }

    /// Close the connection the worker is serving, if any
    fn close_session(&self) -> bool {
        match lock(&self.slot).as_ref() {
            Some(active) => {
                debug!(
                    worker_id = %self.id,
                    connection_id = %active.connection_id,
                    peer = %active.peer,
                    busy_for = ?active.since.elapsed(),
                    "Closing connection"
                );
                active.closer.cancel();
                true
            }
            None => false,
        }
    }
}

async fn worker_loop(
    engine: Arc<SessionEngine>,
    slot: Arc<Mutex<Option<ActiveSession>>>,
    mut rx: mpsc::Receiver<Assignment>,
) {
    debug!("Worker started");
    while let Some(assignment) = rx.recv().await {
        let connection_id = assignment.id;
        let served = AssertUnwindSafe(serve(&engine, assignment))
            .catch_unwind()
            .await;
        if let Err(panic) = served {
            error!(
                %connection_id,
                reason = %panic_message(panic.as_ref()),
                "Session panicked"
            );
            counter!("trackwire.errors.panic").increment(1);
        }
        *lock(&slot) = None;
        trace!(%connection_id, "Worker idle");
    }
    debug!("Worker stopped");
}

async fn serve(engine: &SessionEngine, assignment: Assignment) {
    let mut connection = match assignment.pending {
        Pending::Ready(connection) => connection,
        #[cfg(feature = "tls")]
        Pending::Tls { stream, acceptor } => {
            match DeviceConnection::accept_tls(
                stream,
                &acceptor,
                assignment.id,
                assignment.closer,
                engine.config().idle_timeout,
            )
            .await
            {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(
                        connection_id = %assignment.id,
                        peer = %assignment.peer,
                        error = %err,
                        "TLS handshake failed"
                    );
                    counter!("trackwire.errors.tls").increment(1);
                    return;
                }
            }
        }
    };
    engine.run(&mut connection).await;
}

/// Pool of session workers for one listener
pub(crate) struct WorkerPool {
    engine: Arc<SessionEngine>,
    workers: Mutex<Vec<SessionWorker>>,
    next_worker_id: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(engine: Arc<SessionEngine>) -> Self {
        Self {
            engine,
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    /// Run a ready connection on a worker
    pub(crate) fn assign(&self, connection: DeviceConnection) -> WorkerId {
        self.dispatch(Assignment::ready(connection))
    }

    /// Hand an assignment to the first idle worker, spawning one when all are busy
    pub(crate) fn dispatch(&self, mut assignment: Assignment) -> WorkerId {
        let mut workers = lock(&self.workers);
        for worker in workers.iter() {
            match worker.try_assign(assignment) {
                Ok(()) => {
                    self.engine.metrics().worker_reused();
                    trace!(worker_id = %worker.id, "Reusing idle worker");
                    return worker.id;
                }
                Err(busy) => assignment = busy,
            }
        }

        let id = WorkerId::new(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let worker = SessionWorker::spawn(id, self.engine.clone());
        self.engine.metrics().worker_spawned();
        if let Err(assignment) = worker.try_assign(assignment) {
            // A fresh worker has an empty channel; only a dead runtime lands here.
            error!(
                worker_id = %id,
                connection_id = %assignment.id,
                "New worker refused its first connection"
            );
            assignment.closer.cancel();
        }
        workers.push(worker);
        gauge!("trackwire.workers").set(workers.len() as f64);
        debug!(worker_id = %id, workers = workers.len(), "Spawned worker");
        id
    }

    pub(crate) fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Workers currently serving a connection
    pub(crate) fn active_sessions(&self) -> usize {
        lock(&self.workers)
            .iter()
            .filter(|worker| !worker.is_idle())
            .count()
    }

    /// Close every assigned connection and release the workers
    ///
    /// Returns the number of connections closed. In-flight handler calls are
    /// not awaited; each session ends on its own once its next read or write
    /// fails.
    pub(crate) fn close_all(&self) -> usize {
        let workers = std::mem::take(&mut *lock(&self.workers));
        let closed = workers.iter().filter(|worker| worker.close_session()).count();
        gauge!("trackwire.workers").set(0.0);
        debug!(workers = workers.len(), closed, "Worker pool closed");
        closed
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}
