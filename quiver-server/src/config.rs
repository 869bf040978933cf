use std::{fmt::Display, time::Duration};

use crate::thread::available_cores;

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Reader threads to spawn. Zero makes the writer serve reads too.
    pub readers: usize,
    /// Core the writer thread is pinned to
    pub writer_cpu: usize,
    /// Core of the first reader; the others take the following cores,
    /// wrapping around the available ones
    pub first_reader_cpu: usize,
    /// Idle time after which the writer runs an active expire cycle
    pub expire_interval: Duration,
    /// Keys with a time to live sampled per expire cycle
    pub expire_samples: usize,
    /// Namespace id reported in notifications and propagated commands
    pub db: u32,
}

impl EngineOptions {
    /// Creates engine options with the specified parameters.
    ///
    /// # Example
    /// ```rust
    /// use std::time::Duration;
    /// use libquiver::EngineOptions;
    ///
    /// let options = EngineOptions::new(
    ///     3,                          // reader threads
    ///     0,                          // writer core
    ///     1,                          // first reader core
    ///     Duration::from_millis(100), // active expire interval
    /// );
    /// assert_eq!(options.readers, 3);
    /// ```
    pub fn new(
        readers: usize,
        writer_cpu: usize,
        first_reader_cpu: usize,
        expire_interval: Duration,
    ) -> Self {
        Self {
            readers,
            writer_cpu,
            first_reader_cpu,
            expire_interval,
            ..Self::default()
        }
    }

    pub fn readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }

    pub fn writer_cpu(mut self, cpu: usize) -> Self {
        self.writer_cpu = cpu;
        self
    }

    pub fn first_reader_cpu(mut self, cpu: usize) -> Self {
        self.first_reader_cpu = cpu;
        self
    }

    pub fn expire_interval(mut self, interval: Duration) -> Self {
        self.expire_interval = interval;
        self
    }

    pub fn expire_samples(mut self, samples: usize) -> Self {
        self.expire_samples = samples;
        self
    }

    pub fn db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Core for reader `index`.
    pub fn reader_cpu(&self, index: usize) -> usize {
        (self.first_reader_cpu + index) % available_cores()
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            readers: available_cores().saturating_sub(1).max(1),
            writer_cpu: 0,
            first_reader_cpu: 1,
            expire_interval: Duration::from_millis(100),
            expire_samples: 20,
            db: 0,
        }
    }
}

impl Display for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "READERS: {}, WRITERCPU: {}, FIRSTREADERCPU: {}, EXPIREINTERVAL: {}ms, EXPIRESAMPLES: {}, DB: {}",
            self.readers,
            self.writer_cpu,
            self.first_reader_cpu,
            self.expire_interval.as_millis(),
            self.expire_samples,
            self.db,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert!(options.readers >= 1);
        assert_eq!(options.writer_cpu, 0);
        assert_eq!(options.expire_samples, 20);
    }

    #[test]
    fn test_reader_cpus_wrap() {
        let cores = available_cores();
        let options = EngineOptions::default().first_reader_cpu(1);
        assert_eq!(options.reader_cpu(cores - 1), 0);
        assert!((0..8).all(|i| options.reader_cpu(i) < cores));
    }

    #[test]
    fn test_display() {
        let options = EngineOptions::new(2, 0, 1, Duration::from_millis(50)).db(3);
        assert_eq!(
            options.to_string(),
            "READERS: 2, WRITERCPU: 0, FIRSTREADERCPU: 1, EXPIREINTERVAL: 50ms, EXPIRESAMPLES: 20, DB: 3"
        );
    }
}
