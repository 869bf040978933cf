//! Read-copy-update domain for one writer and any number of readers.
//!
//! Readers bracket their lookups with [`RcuReader::enter_read_section`]; the
//! returned [`ReadSection`] closes the section when dropped. Entering and
//! leaving never block and never allocate: a reader only stores a snapshot of
//! the global grace-period counter into its own slot.
//!
//! The writer replaces values with [`RcuCell::publish`], which hands back the
//! previous allocation as a [`Retired`] record. The record may be freed only
//! after [`RcuWriter::synchronize`] has observed every section that was open
//! when it was called. Freeing is reachable exclusively through `&mut
//! RcuWriter`, which is why the writer can read cells without a section.
//!
//! A cell belongs to the first domain that reads or publishes it. Guards and
//! writers of any other domain are refused, since their grace periods do not
//! cover that domain's readers.
//!
//! # Logging
//!
//! - **DEBUG** `quiver::rcu`: `grace_period` with the number of readers the
//!   writer had to wait for and the number of records reclaimed.

use std::{
    cell::Cell,
    fmt::{self, Display},
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::{
        Arc, Weak,
        atomic::{AtomicPtr, AtomicU64, Ordering, fence},
    },
    time::Instant,
};

use parking_lot::Mutex;
use tracing::debug;

/// Slot value of a reader that is not inside a read section.
const QUIESCENT: u64 = 0;

/// Busy-wait iterations on a slow reader before yielding the cpu.
const SPINS_BEFORE_YIELD: u32 = 128;

pub(crate) mod sealed {
    pub trait Sealed {
        /// Identity of the domain the guard belongs to.
        fn domain_id(&self) -> *const ();
    }
}

/// Proof that the holder may dereference an [`RcuCell`] right now.
///
/// Implemented by an open [`ReadSection`] and by the writer itself.
pub trait Protect: sealed::Sealed {}

struct ReaderSlot {
    ctr: AtomicU64,
}

/// A type-erased allocation waiting for a grace period.
struct Deferred {
    epoch: u64,
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// The pointee is `Send`, enforced by `Deferred::new`.
unsafe impl Send for Deferred {}

impl Deferred {
    fn new<T: Send + 'static>(ptr: NonNull<T>, epoch: u64) -> Self {
        unsafe fn drop_boxed<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
        }

        Deferred {
            epoch,
            ptr: ptr.as_ptr().cast(),
            drop_fn: drop_boxed::<T>,
        }
    }

    /// # Safety
    /// No reader may still hold a reference into the allocation.
    unsafe fn free(self) {
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

fn domain_id(domain: &Arc<DomainInner>) -> *const () {
    Arc::as_ptr(domain).cast()
}

struct DomainInner {
    gp_ctr: AtomicU64,
    readers: Mutex<Vec<Weak<ReaderSlot>>>,
    /// Records dropped without going through the writer.
    orphans: Mutex<Vec<Deferred>>,
    published: AtomicU64,
    reclaimed: AtomicU64,
    grace_periods: AtomicU64,
}

impl DomainInner {
    fn new() -> Self {
        DomainInner {
            gp_ctr: AtomicU64::new(1),
            readers: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            grace_periods: AtomicU64::new(0),
        }
    }
}

impl Drop for DomainInner {
    fn drop(&mut self) {
        // Readers and the writer hold an Arc to the domain, so none are left.
        for deferred in self.orphans.get_mut().drain(..) {
            unsafe { deferred.free() };
        }
    }
}

/// Counters describing the reclamation state of a domain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RcuStats {
    /// Values replaced through [`RcuCell::publish`].
    pub published: u64,
    /// Replaced values that have been freed.
    pub reclaimed: u64,
    /// Completed calls to [`RcuWriter::synchronize`].
    pub grace_periods: u64,
    /// Registered readers that are still alive.
    pub readers: usize,
}

impl RcuStats {
    /// Replaced values still waiting for a grace period.
    pub fn pending(&self) -> u64 {
        self.published.saturating_sub(self.reclaimed)
    }
}

impl Display for RcuStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Published: {}, Reclaimed: {}, Pending: {}, Grace Periods: {}, Readers: {}",
            self.published,
            self.reclaimed,
            self.pending(),
            self.grace_periods,
            self.readers,
        )
    }
}

/// Shareable handle used to register readers with a domain.
#[derive(Clone)]
pub struct RcuDomain {
    inner: Arc<DomainInner>,
}

impl RcuDomain {
    pub fn register_reader(&self) -> RcuReader {
        let slot = Arc::new(ReaderSlot {
            ctr: AtomicU64::new(QUIESCENT),
        });
        self.inner.readers.lock().push(Arc::downgrade(&slot));
        RcuReader {
            slot,
            domain: Arc::clone(&self.inner),
            nesting: Cell::new(0),
        }
    }

    pub fn stats(&self) -> RcuStats {
        let readers = self
            .inner
            .readers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count();
        RcuStats {
            published: self.inner.published.load(Ordering::Relaxed),
            reclaimed: self.inner.reclaimed.load(Ordering::Relaxed),
            grace_periods: self.inner.grace_periods.load(Ordering::Relaxed),
            readers,
        }
    }
}

/// A registered reader. Owned by exactly one thread at a time.
pub struct RcuReader {
    slot: Arc<ReaderSlot>,
    domain: Arc<DomainInner>,
    nesting: Cell<u32>,
}

impl RcuReader {
    /// Opens a read-side critical section. Sections may nest; only the
    /// outermost one is visible to the writer.
    #[inline]
    pub fn enter_read_section(&self) -> ReadSection<'_> {
        let depth = self.nesting.get();
        if depth == 0 {
            let gp = self.domain.gp_ctr.load(Ordering::SeqCst);
            self.slot.ctr.store(gp, Ordering::SeqCst);
            // Pairs with the fence in `synchronize`: either the writer sees
            // this slot, or every load below sees the writer's publish.
            fence(Ordering::SeqCst);
        }
        self.nesting.set(depth + 1);
        ReadSection {
            reader: self,
            _not_send: PhantomData,
        }
    }

    pub fn domain(&self) -> RcuDomain {
        RcuDomain {
            inner: Arc::clone(&self.domain),
        }
    }

    fn exit_read_section(&self) {
        let depth = self.nesting.get() - 1;
        self.nesting.set(depth);
        if depth == 0 {
            self.slot.ctr.store(QUIESCENT, Ordering::Release);
        }
    }
}

impl Drop for RcuReader {
    fn drop(&mut self) {
        let slot = Arc::as_ptr(&self.slot);
        self.domain
            .readers
            .lock()
            .retain(|w| !ptr::eq(w.as_ptr(), slot) && w.strong_count() > 0);
    }
}

/// An open read-side critical section. Dropping it exits the section.
pub struct ReadSection<'r> {
    reader: &'r RcuReader,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadSection<'_> {
    #[inline]
    fn drop(&mut self) {
        self.reader.exit_read_section();
    }
}

impl sealed::Sealed for ReadSection<'_> {
    fn domain_id(&self) -> *const () {
        domain_id(&self.reader.domain)
    }
}
impl Protect for ReadSection<'_> {}

/// Witness that every section open before a given point has closed.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod {
    epoch: u64,
    domain: *const (),
}

/// The single writer of a domain. It is the only party allowed to publish
/// into cells and the only party that frees replaced values.
pub struct RcuWriter {
    domain: Arc<DomainInner>,
    deferred: Vec<Deferred>,
}

impl Default for RcuWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RcuWriter {
    /// Creates a new domain together with its writer.
    pub fn new() -> Self {
        RcuWriter {
            domain: Arc::new(DomainInner::new()),
            deferred: Vec::new(),
        }
    }

    pub fn domain(&self) -> RcuDomain {
        RcuDomain {
            inner: Arc::clone(&self.domain),
        }
    }

    /// Records awaiting the next grace period.
    pub fn pending(&self) -> usize {
        self.deferred.len() + self.domain.orphans.lock().len()
    }

    /// Queues a replaced value to be freed by a later grace period.
    pub fn retire<T: Send + 'static>(&mut self, retired: Retired<T>) {
        if let Some(deferred) = retired.into_deferred() {
            self.deferred.push(deferred);
        }
    }

    /// Waits for a grace period and frees `retired` right after it.
    pub fn reclaim<T: Send + 'static>(&mut self, retired: Retired<T>) {
        let gp = self.synchronize();
        retired.free_after(&gp);
    }

    /// Blocks until every read section that was open when this was called
    /// has exited, then frees everything retired before the call.
    pub fn synchronize(&mut self) -> GracePeriod {
        let started = Instant::now();
        let mut garbage = std::mem::take(&mut self.deferred);
        garbage.append(&mut self.domain.orphans.lock());

        fence(Ordering::SeqCst);
        let target = self.domain.gp_ctr.fetch_add(1, Ordering::SeqCst) + 1;

        let slots: Vec<Arc<ReaderSlot>> = {
            let mut readers = self.domain.readers.lock();
            readers.retain(|w| w.strong_count() > 0);
            readers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut waited = 0usize;
        for slot in &slots {
            let mut spins = 0u32;
            loop {
                let ctr = slot.ctr.load(Ordering::Acquire);
                if ctr == QUIESCENT || ctr >= target {
                    break;
                }
                if spins < SPINS_BEFORE_YIELD {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                spins = spins.saturating_add(1);
            }
            if spins > 0 {
                waited += 1;
            }
        }
        fence(Ordering::SeqCst);

        let freed = garbage.len() as u64;
        for deferred in garbage {
            debug_assert!(deferred.epoch < target);
            unsafe { deferred.free() };
        }
        self.domain.reclaimed.fetch_add(freed, Ordering::Relaxed);
        self.domain.grace_periods.fetch_add(1, Ordering::Relaxed);

        debug!(
            target: "quiver::rcu",
            epoch = target,
            readers = slots.len(),
            waited,
            freed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "grace_period"
        );

        GracePeriod {
            epoch: target,
            domain: domain_id(&self.domain),
        }
    }
}

impl Drop for RcuWriter {
    fn drop(&mut self) {
        if !self.deferred.is_empty() {
            self.synchronize();
        }
    }
}

impl sealed::Sealed for RcuWriter {
    fn domain_id(&self) -> *const () {
        domain_id(&self.domain)
    }
}
impl Protect for RcuWriter {}

/// A value detached from an [`RcuCell`] by a publish. Readers that entered
/// their section before the publish may still be looking at it.
///
/// Dropping the record hands it to the domain, which frees it during the next
/// grace period.
#[must_use = "a retired value is only freed after a grace period"]
pub struct Retired<T: Send + 'static> {
    ptr: Option<NonNull<T>>,
    epoch: u64,
    domain: Arc<DomainInner>,
}

unsafe impl<T: Send + 'static> Send for Retired<T> {}

impl<T: Send + 'static> Retired<T> {
    /// Frees the value if `gp` started after it was published, otherwise
    /// defers it to the next grace period.
    pub fn free_after(mut self, gp: &GracePeriod) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };
        let same_domain = ptr::eq(gp.domain, domain_id(&self.domain));
        if same_domain && self.epoch < gp.epoch {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            self.domain.reclaimed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.domain
                .orphans
                .lock()
                .push(Deferred::new(ptr, self.epoch));
        }
    }

    fn into_deferred(mut self) -> Option<Deferred> {
        self.ptr.take().map(|ptr| Deferred::new(ptr, self.epoch))
    }
}

impl<T: Send + 'static> Drop for Retired<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            self.domain
                .orphans
                .lock()
                .push(Deferred::new(ptr, self.epoch));
        }
    }
}

/// A heap value that readers dereference at most once per section and the
/// writer replaces atomically.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    /// Domain bound on first use, null until then.
    domain: AtomicPtr<()>,
    _owns: PhantomData<Box<T>>,
}

unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        RcuCell {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            domain: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Binds the cell to `domain` unless it already belongs to one.
    ///
    /// A domain that has been dropped may share its address with a later
    /// one. That is harmless: the old domain took all of its readers with it.
    #[inline]
    fn bind(&self, domain: *const ()) {
        let owner = self.domain.load(Ordering::Acquire);
        if ptr::eq(owner, domain) {
            return;
        }
        let owner = match self.domain.compare_exchange(
            ptr::null_mut(),
            domain.cast_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(owner) => owner,
        };
        assert!(
            ptr::eq(owner, domain),
            "rcu cell accessed through a guard of another domain"
        );
    }

    /// Returns the current value. The reference lives no longer than the
    /// protection that vouches for it.
    ///
    /// # Panics
    /// If the cell already belongs to a domain other than the guard's.
    #[inline]
    pub fn load<'a, P: Protect + ?Sized>(&'a self, guard: &'a P) -> &'a T {
        self.bind(sealed::Sealed::domain_id(guard));
        // Never null: set from a Box at construction and on every publish.
        // Replaced values are only freed after a grace period of the bound
        // domain, and only through `&mut RcuWriter`.
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }

    /// Unique access, e.g. before the cell is shared with readers.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut **self.ptr.get_mut() }
    }
}

impl<T: Send + 'static> RcuCell<T> {
    /// Atomically replaces the value readers will see next and returns the
    /// previous one.
    ///
    /// # Panics
    /// If the cell already belongs to a domain other than the writer's.
    pub fn publish(&self, value: T, writer: &RcuWriter) -> Retired<T> {
        self.bind(domain_id(&writer.domain));
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, Ordering::SeqCst);
        writer.domain.published.fetch_add(1, Ordering::Relaxed);
        Retired {
            ptr: NonNull::new(old),
            epoch: writer.domain.gp_ctr.load(Ordering::SeqCst),
            domain: Arc::clone(&writer.domain),
        }
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(*self.ptr.get_mut()) });
    }
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("ptr", &self.ptr.load(Ordering::Relaxed))
            .finish()
    }
}
