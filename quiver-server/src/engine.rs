//! The engine: one writer thread owning the keyspace and a set of reader
//! threads, each pinned to its own core.
//!
//! Requests are routed by [`route`]. Mutations queue on the writer; reads
//! queue on the reader picked by hashing their first key, so the same keys
//! stay hot in the same core's cache. Replies travel back on a oneshot
//! channel, which lets async and blocking callers share one engine.
//!
//! # Logging
//!
//! - **INFO** `quiver::engine`: `engine started`, `engine stopped`.
//! - **DEBUG** `quiver::engine`: every propagated command, every active
//!   expire cycle that removed keys.
//! - **WARN** `quiver::engine`: a worker thread panicked.

use std::{
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use quiver_core::{
    Error, Keyspace, KeyspaceHandle, KeyspaceReader, KeyspaceStats, KeyspaceWriter, Notifier,
    Reply,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    config::EngineOptions,
    process::{Route, process_read, process_write, route},
    thread::{ThreadError, WorkerThread, spawn_pinned},
};

/// A mutation in the canonical form to journal or replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propagated {
    pub db: u32,
    pub argv: Vec<Vec<u8>>,
}

struct Job {
    argv: Vec<Vec<u8>>,
    reply: oneshot::Sender<Reply>,
}

/// Point-in-time counters of a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub keyspace: KeyspaceStats,
    /// Requests answered by each reader thread
    pub served: Vec<u64>,
}

impl Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.keyspace)?;
        write!(f, "Served per reader: {:?}", self.served)
    }
}

fn shutting_down() -> Reply {
    Error::out_of_range("engine is shutting down").into()
}

pub struct Engine {
    options: EngineOptions,
    handle: KeyspaceHandle,
    writer_tx: Option<Sender<Job>>,
    reader_txs: Vec<Sender<Job>>,
    writer: Option<WorkerThread<()>>,
    readers: Vec<WorkerThread<()>>,
    served: Vec<Arc<AtomicU64>>,
}

impl Engine {
    /// Spawns the writer and reader threads.
    ///
    /// # Arguments
    /// * `options` - thread layout and expiry settings
    /// * `notifier` - receives every keyspace event
    /// * `journal` - receives every mutation in canonical form, if given
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use libquiver::{Engine, EngineOptions};
    /// use quiver_core::{Reply, TracingNotifier};
    ///
    /// let engine = Engine::start(EngineOptions::default().readers(1), Arc::new(TracingNotifier), None).unwrap();
    /// let argv = |parts: &[&str]| parts.iter().map(|p| p.as_bytes().to_vec()).collect::<Vec<_>>();
    ///
    /// assert_eq!(engine.execute_blocking(argv(&["SET", "k", "v"])), Reply::Ok);
    /// assert_eq!(engine.execute_blocking(argv(&["GET", "k"])), Reply::bulk("v"));
    /// engine.shutdown();
    /// ```
    pub fn start(
        options: EngineOptions,
        notifier: Arc<dyn Notifier>,
        journal: Option<Sender<Propagated>>,
    ) -> Result<Engine, ThreadError> {
        let ks = Keyspace::new(options.db, notifier);
        let handle = ks.handle();

        let (writer_tx, writer_rx) = crossbeam_channel::unbounded();
        let writer = {
            let options = options.clone();
            spawn_pinned(options.writer_cpu, "quiver-writer", move || {
                writer_loop(ks, writer_rx, options, journal)
            })?
        };

        let mut engine = Engine {
            options,
            handle,
            writer_tx: Some(writer_tx),
            reader_txs: Vec::new(),
            writer: Some(writer),
            readers: Vec::new(),
            served: Vec::new(),
        };

        for i in 0..engine.options.readers {
            let (tx, rx) = crossbeam_channel::unbounded();
            let reader = engine.handle.reader();
            let served = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&served);
            let worker = spawn_pinned(
                engine.options.reader_cpu(i),
                format!("quiver-reader-{i}"),
                move || reader_loop(reader, rx, counter),
            )?;
            engine.reader_txs.push(tx);
            engine.readers.push(worker);
            engine.served.push(served);
        }

        info!(target: "quiver::engine", options = %engine.options, "engine started");
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// A handle for creating extra readers outside the engine's threads.
    pub fn handle(&self) -> KeyspaceHandle {
        self.handle.clone()
    }

    /// Queues `argv` on the thread that has to run it. The receiver yields
    /// the reply; rejected requests are answered right away.
    pub fn dispatch(&self, argv: Vec<Vec<u8>>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let queue = match route(&argv) {
            Route::Reject(reply) => {
                let _ = tx.send(reply);
                return rx;
            }
            Route::Read { shard_key } if !self.reader_txs.is_empty() => {
                let idx = (shard_key % self.reader_txs.len() as u64) as usize;
                self.reader_txs.get(idx)
            }
            Route::Read { .. } | Route::Write => self.writer_tx.as_ref(),
        };

        let job = Job { argv, reply: tx };
        match queue {
            Some(queue) => {
                if let Err(e) = queue.send(job) {
                    let _ = e.into_inner().reply.send(shutting_down());
                }
            }
            None => {
                let _ = job.reply.send(shutting_down());
            }
        }
        rx
    }

    /// Runs a command and waits for its reply.
    pub async fn execute(&self, argv: Vec<Vec<u8>>) -> Reply {
        self.dispatch(argv).await.unwrap_or_else(|_| shutting_down())
    }

    /// Blocking version of [`Engine::execute`]. Must not be called from
    /// inside an async runtime.
    pub fn execute_blocking(&self, argv: Vec<Vec<u8>>) -> Reply {
        self.dispatch(argv)
            .blocking_recv()
            .unwrap_or_else(|_| shutting_down())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            keyspace: self.handle.stats(),
            served: self
                .served
                .iter()
                .map(|s| s.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Closes the queues and waits for every thread. Requests already
    /// queued are answered first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        self.writer_tx = None;
        self.reader_txs.clear();

        for worker in self.readers.drain(..) {
            if let Err(e) = worker.join() {
                warn!(target: "quiver::engine", error = %e, "reader thread failed");
            }
        }
        if let Err(e) = writer.join() {
            warn!(target: "quiver::engine", error = %e, "writer thread failed");
        }
        info!(target: "quiver::engine", "engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn propagate(journal: &Option<Sender<Propagated>>, db: u32, argv: Vec<Vec<u8>>) {
    let Some(journal) = journal else {
        return;
    };
    debug!(
        target: "quiver::engine",
        command = %String::from_utf8_lossy(argv.first().map_or(&[][..], Vec::as_slice)),
        args = argv.len().saturating_sub(1),
        "propagated"
    );
    let _ = journal.send(Propagated { db, argv });
}

/// Expired keys are journaled as plain deletes so replicas never depend on
/// their own clocks.
fn propagate_expired(ks: &mut KeyspaceWriter, journal: &Option<Sender<Propagated>>) {
    for key in ks.take_expired() {
        propagate(journal, ks.db(), vec![b"DEL".to_vec(), key]);
    }
}

fn writer_loop(
    mut ks: KeyspaceWriter,
    rx: Receiver<Job>,
    options: EngineOptions,
    journal: Option<Sender<Propagated>>,
) {
    // Only used when no reader threads exist.
    let local = ks.handle().reader();

    loop {
        match rx.recv_timeout(options.expire_interval) {
            Ok(job) => {
                let reply = match route(&job.argv) {
                    Route::Write => {
                        let dirty = ks.dirty();
                        let executed = process_write(&mut ks, &job.argv);
                        propagate_expired(&mut ks, &journal);
                        if ks.dirty() != dirty {
                            let argv = executed.rewrite.unwrap_or(job.argv);
                            propagate(&journal, ks.db(), argv);
                        }
                        executed.reply
                    }
                    Route::Read { .. } => process_read(&local, &job.argv),
                    Route::Reject(reply) => reply,
                };
                let _ = job.reply.send(reply);
            }
            Err(RecvTimeoutError::Timeout) => {
                let removed = ks.active_expire_cycle(options.expire_samples);
                if removed > 0 {
                    debug!(target: "quiver::engine", removed, "expire_cycle");
                }
                propagate_expired(&mut ks, &journal);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(local);
    ks.synchronize();
}

fn reader_loop(reader: KeyspaceReader, rx: Receiver<Job>, served: Arc<AtomicU64>) {
    for job in rx.iter() {
        let reply = process_read(&reader, &job.argv);
        served.fetch_add(1, Ordering::Relaxed);
        let _ = job.reply.send(reply);
    }
}
