//! Optional dedicated rayon pool shared by the CPU-side kernels.

use std::sync::Arc;

use rayon::ThreadPool;

use crate::backend::ComputeError;

#[derive(Clone, Default)]
pub(crate) struct ThreadTeam {
    pool: Option<Arc<ThreadPool>>,
}

impl ThreadTeam {
    /// Run on the global rayon pool.
    pub(crate) fn global() -> Self {
        Self { pool: None }
    }

    /// Run on a private pool of `num_threads` workers.
    pub(crate) fn with_threads(num_threads: usize) -> Result<Self, ComputeError> {
        if num_threads == 0 {
            return Err(ComputeError::InvalidArgument(
                "thread count must be positive".into(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sgmv-worker-{i}"))
            .build()
            .map_err(|e| ComputeError::DeviceError(e.to_string()))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    pub(crate) fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    pub(crate) fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}
