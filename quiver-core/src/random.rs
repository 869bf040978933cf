//! Per-thread random generator. Worker threads seed it once at startup so
//! two threads started in the same microsecond still diverge.

use std::cell::RefCell;

use rand::{SeedableRng, rngs::StdRng};

thread_local! {
    static THREAD_RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Reseeds the calling thread's generator.
pub fn seed_thread_rng(seed: u64) {
    THREAD_RNG.with(|rng| *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed)));
}

/// Whether the calling thread's generator has been seeded, explicitly or by
/// a previous [`with_thread_rng`].
pub fn thread_rng_is_seeded() -> bool {
    THREAD_RNG.with(|rng| rng.borrow().is_some())
}

/// Runs `f` with the calling thread's generator, seeding it from the OS on
/// first use when no explicit seed was set.
pub fn with_thread_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    THREAD_RNG.with(|rng| {
        let mut slot = rng.borrow_mut();
        let rng = slot.get_or_insert_with(|| StdRng::from_rng(&mut rand::rng()));
        f(rng)
    })
}
