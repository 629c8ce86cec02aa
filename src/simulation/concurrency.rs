use std::sync::Arc;

use log::warn;
use rayon::prelude::*;

use crate::error::SimulationError;

/// Execution context for the data-parallel kernels.
///
/// Every kernel of one substep runs to completion before the next one starts
/// (each `par_iter_*` call returns only after all of its work items are done),
/// which is the only synchronization the pipeline relies on.
#[derive(Clone, Default)]
pub struct ComputeContext {
    // None: run on the global rayon pool
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ComputeContext {
    /// Kernels run on rayon's global pool.
    pub fn global() -> Self {
        ComputeContext { pool: None }
    }

    /// Kernels run on a dedicated pool with `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Result<Self, SimulationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sph-worker-{}", i))
            .build()?;
        Ok(ComputeContext { pool: Some(Arc::new(pool)) })
    }

    /// Like `with_threads`, but degrades to the global pool instead of failing.
    pub fn with_threads_or_global(num_threads: Option<usize>) -> Self {
        match num_threads {
            None => Self::global(),
            Some(n) => Self::with_threads(n).unwrap_or_else(|err| {
                warn!("{}; falling back to the global thread pool", err);
                Self::global()
            }),
        }
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
    arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
        f(idx, v1);
    });
}

pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
    arr1: &mut [T1],
    arr2: &mut [T2],
    f: F,
) {
    arr1.into_par_iter()
        .zip(arr2.into_par_iter())
        .enumerate()
        .for_each(|(idx, (v1, v2))| {
            f(idx, v1, v2);
        });
}
