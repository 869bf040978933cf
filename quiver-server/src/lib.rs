/*!
 * # Quiver Server - Pinned Writer and Reader Threads
 *
 * This crate runs the quiver keyspace as a service:
 * - One writer thread owns the `KeyspaceWriter` and executes every mutation
 * - Reader threads, each pinned to its own core, answer lookups lock-free
 * - Mutations are journaled in canonical form for replication
 * - A RESP3 TCP front end (`quiver-server` binary)
 *
 * ## Core Modules
 *
 * ### Commands (`command`, `strings`, `generic`)
 * - `Command`: the command table with arity and read/write flags
 * - String commands: GET, SET and its variants, APPEND, SETRANGE, GETRANGE,
 *   MGET, MSET, MSETNX, the INCR family, INCRBYFLOAT, STRLEN
 * - Key commands: DEL, EXISTS, TTL, PTTL
 *
 * ### Processing (`process`)
 * - `route()`: decides whether a request needs the writer or any reader
 * - `process_write()` / `process_read()`: execute a request on a role handle
 *
 * ### Threads (`thread`, `engine`, `config`)
 * - `ThreadDescriptor` / `spawn_pinned()`: worker threads pinned to one core
 * - `Engine`: the writer and reader threads with their queues
 * - `EngineOptions`: thread layout and active expiry settings
 *
 * ## Example Usage
 *
 * ```rust
 * use std::sync::Arc;
 * use libquiver::{Engine, EngineOptions, Propagated};
 * use quiver_core::{EventLog, Reply};
 *
 * let (journal_tx, journal_rx) = crossbeam_channel::unbounded::<Propagated>();
 * let events = Arc::new(EventLog::new());
 * let engine = Engine::start(EngineOptions::default().readers(2), events.clone(), Some(journal_tx)).unwrap();
 *
 * let argv = |parts: &[&str]| parts.iter().map(|p| p.as_bytes().to_vec()).collect::<Vec<_>>();
 * assert_eq!(engine.execute_blocking(argv(&["INCRBY", "counter", "5"])), Reply::Integer(5));
 * assert_eq!(engine.execute_blocking(argv(&["APPEND", "log", "hello"])), Reply::Integer(5));
 * assert_eq!(engine.execute_blocking(argv(&["GET", "log"])), Reply::bulk("hello"));
 *
 * engine.shutdown();
 * assert_eq!(journal_rx.try_iter().count(), 2);
 * assert_eq!(events.names(), vec!["incrby", "append"]);
 * ```
 */

pub mod command;
pub mod config;
pub mod engine;
pub mod generic;
pub mod process;
pub mod strings;
pub mod thread;

pub use command::*;
pub use config::*;
pub use engine::*;
pub use generic::*;
pub use process::*;
pub use strings::*;
pub use thread::*;
