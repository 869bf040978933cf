//! Worker threads pinned to a single CPU core.
//!
//! A [`ThreadDescriptor`] goes through `new` (initialized), `with_entry`
//! (configured) and `start` (running). The started thread seeds its random
//! generator, pins itself to the requested core once, then runs the entry
//! function. Its return value becomes the join value.
//!
//! Pinning failures are logged and the thread keeps running unpinned.

use std::{
    fmt,
    hash::{BuildHasher, RandomState},
    io,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};

use quiver_core::seed_thread_rng;
use tracing::{debug, warn};

/// Size of the kernel affinity mask, the exclusive upper bound for core ids.
#[cfg(target_os = "linux")]
pub const MAX_CPUS: usize = libc::CPU_SETSIZE as usize;
#[cfg(not(target_os = "linux"))]
pub const MAX_CPUS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("thread has no entry function")]
    MissingEntry,
    #[error("cpu {cpu} is outside the affinity mask (limit {limit})")]
    InvalidCpu { cpu: usize, limit: usize },
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("thread panicked")]
    Panicked,
}

type Entry<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// A worker thread that has not been started yet.
pub struct ThreadDescriptor<T> {
    id: usize,
    name: Option<String>,
    entry: Option<Entry<T>>,
}

impl<T> fmt::Debug for ThreadDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("configured", &self.entry.is_some())
            .finish()
    }
}

impl<T: Send + 'static> ThreadDescriptor<T> {
    pub fn new(id: usize) -> Self {
        ThreadDescriptor {
            id,
            name: None,
            entry: None,
        }
    }

    /// Sets the function the thread runs.
    pub fn with_entry(mut self, entry: impl FnOnce() -> T + Send + 'static) -> Self {
        self.entry = Some(Box::new(entry));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_configured(&self) -> bool {
        self.entry.is_some()
    }

    /// Launches the thread pinned to `cpu`.
    ///
    /// # Errors
    /// `MissingEntry` if no entry function was set, `InvalidCpu` if `cpu`
    /// does not fit the affinity mask, `Spawn` if the OS refused the thread.
    pub fn start(self, cpu: usize) -> Result<WorkerThread<T>, ThreadError> {
        let entry = self.entry.ok_or(ThreadError::MissingEntry)?;
        if cpu >= MAX_CPUS {
            return Err(ThreadError::InvalidCpu {
                cpu,
                limit: MAX_CPUS,
            });
        }

        let name = self
            .name
            .unwrap_or_else(|| format!("quiver-worker-{}", self.id));
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || trampoline(cpu, entry))?;

        Ok(WorkerThread {
            id: self.id,
            cpu,
            handle,
        })
    }

    /// Clears the descriptor. A thread already started from it is not
    /// affected.
    pub fn deinit(&mut self) {
        self.id = 0;
        self.name = None;
        self.entry = None;
    }
}

fn trampoline<T>(cpu: usize, entry: Entry<T>) -> T {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let identity = RandomState::new().hash_one(thread::current().id());
    seed_thread_rng(micros ^ identity);

    if pin_to_cpu(cpu) {
        debug!(
            target: "quiver::thread",
            thread = thread::current().name().unwrap_or("unnamed"),
            cpu,
            current = ?current_cpu(),
            "pinned"
        );
    }
    entry()
}

/// A started worker thread.
#[derive(Debug)]
pub struct WorkerThread<T> {
    id: usize,
    cpu: usize,
    handle: JoinHandle<T>,
}

impl<T> WorkerThread<T> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The core the thread was pinned to.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Waits for the thread and returns what its entry function returned.
    pub fn join(self) -> Result<T, ThreadError> {
        self.handle.join().map_err(|_| ThreadError::Panicked)
    }
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Spawns `f` on a new thread pinned to `cpu`.
///
/// # Example
/// ```rust
/// use libquiver::spawn_pinned;
///
/// let worker = spawn_pinned(0, "answer", || 6 * 7).unwrap();
/// assert_eq!(worker.join().unwrap(), 42);
/// ```
pub fn spawn_pinned<T, F>(
    cpu: usize,
    name: impl Into<String>,
    f: F,
) -> Result<WorkerThread<T>, ThreadError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    ThreadDescriptor::new(NEXT_ID.fetch_add(1, Ordering::Relaxed))
        .name(name)
        .with_entry(f)
        .start(cpu)
}

/// Restricts the calling thread to `cpu`. Returns false if the kernel
/// refused. Only the trampoline calls this, so a worker never migrates.
#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> bool {
    if cpu >= MAX_CPUS {
        return false;
    }
    // SAFETY: cpu_set_t is plain data, zeroed is the empty set, and cpu was
    // checked against the mask size.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        warn!(
            target: "quiver::thread",
            cpu,
            error = %io::Error::last_os_error(),
            "affinity_failed"
        );
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(cpu: usize) -> bool {
    warn!(target: "quiver::thread", cpu, "affinity_unsupported");
    false
}

/// The core the calling thread is running on right now.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}

/// Cores available to this process.
pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}
