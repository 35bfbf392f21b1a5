//! Parallel processing strategies

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::ops::Range;

/// Processing mode for algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// Single-threaded processing
    Sequential,
    /// Parallel processing using all available cores
    #[default]
    Parallel,
    /// Parallel with specified number of threads
    ParallelWith(usize),
}

impl ProcessingMode {
    /// `0` means all cores, `1` sequential, anything else a dedicated pool
    pub fn from_threads(threads: usize) -> Self {
        match threads {
            0 => ProcessingMode::Parallel,
            1 => ProcessingMode::Sequential,
            n => ProcessingMode::ParallelWith(n),
        }
    }
}

/// Strategy for parallel execution
pub trait ParallelStrategy {
    /// Map a function over indices and collect results in index order
    fn par_map<T, F>(&self, range: Range<usize>, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send;
}

impl ParallelStrategy for ProcessingMode {
    #[cfg(feature = "parallel")]
    fn par_map<T, F>(&self, range: Range<usize>, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        match self {
            ProcessingMode::Sequential => range.map(f).collect(),
            ProcessingMode::Parallel => range.into_par_iter().map(f).collect(),
            ProcessingMode::ParallelWith(threads) => {
                match rayon::ThreadPoolBuilder::new().num_threads(*threads).build() {
                    Ok(pool) => pool.install(|| range.into_par_iter().map(f).collect()),
                    Err(e) => {
                        tracing::warn!(threads, error = %e, "cannot build thread pool, using global pool");
                        range.into_par_iter().map(f).collect()
                    }
                }
            }
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn par_map<T, F>(&self, range: Range<usize>, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        range.map(f).collect()
    }
}
