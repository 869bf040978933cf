/*!
 * # Quiver - Single-Writer, Multi-Reader Keyspace
 *
 * Quiver keeps a Redis-compatible string keyspace in memory. Exactly one
 * thread mutates it while any number of reader threads look keys up
 * concurrently, without locks, under a read-copy-update discipline.
 *
 * ## Core Modules
 *
 * ### RCU (`rcu`)
 * Grace-period based reclamation:
 * - `RcuWriter`: the single writer; publishes into cells and frees retired values
 * - `RcuReader` / `ReadSection`: wait-free read-side critical sections
 * - `RcuCell`: an atomically replaceable heap value
 * - `Retired`: a replaced value waiting for its grace period
 *
 * ### Objects (`object`)
 * - `Object`: a stored value with its type and encoding
 * - `Unshared`: proof that an object may be edited in place
 *
 * ### Keyspace (`keyspace`)
 * - `KeyspaceWriter`: all mutations, lazy and active expiry, shared integers
 * - `KeyspaceHandle` / `KeyspaceReader` / `ReadView`: lock-free lookups
 *
 * ### Protocol (`resp3`)
 * - `parse_frame()`: incremental RESP3 framing
 * - `Reply`: command replies and their encoding
 */

pub mod error;
pub mod keyspace;
pub mod notify;
pub mod object;
pub mod random;
pub mod rcu;
pub mod resp3;

pub use error::*;
pub use keyspace::*;
pub use notify::*;
pub use object::*;
pub use random::*;
pub use rcu::*;
pub use resp3::*;
