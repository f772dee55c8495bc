//! Thread policy for fitting many independent candidates.
//!
//! Each candidate decay is fitted on its own particles, and the field provider is shared
//! read-only, so batches of fits parallelize without synchronization. An [`ExecutionContext`]
//! decides where that work runs.
//!
//! Lifecycle:
//! - Create once with [`ExecutionContext::new`].
//! - Reuse in repeated calls to [`fit_candidates`](crate::vertex::fit_candidates).
//! - Drop when reconstruction is complete; a dedicated thread pool is released with it.
//!
//! Thread policy guidance:
//! - [`ThreadPolicy::Single`]: runs on the caller thread.
//! - [`ThreadPolicy::GlobalPool`]: uses Rayon global parallelism when available.
//! - [`ThreadPolicy::Dedicated`]: creates a private Rayon pool; setup is higher-cost, so it
//!   should be reused across many calls.

use crate::{KFError, KFResult};

/// Thread-policy options for [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPolicy {
    /// Run work on the current thread.
    Single,
    /// Use the global Rayon pool.
    GlobalPool,
    /// Use a dedicated Rayon pool with `n_threads`.
    Dedicated(usize),
}

/// Execution context owning a thread policy and, for [`ThreadPolicy::Dedicated`], its pool.
#[derive(Debug)]
pub struct ExecutionContext {
    thread_policy: ThreadPolicy,
    #[cfg(feature = "rayon")]
    dedicated_pool: Option<rayon::ThreadPool>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            thread_policy: ThreadPolicy::Single,
            #[cfg(feature = "rayon")]
            dedicated_pool: None,
        }
    }
}

impl ExecutionContext {
    /// Create a new context with the requested thread policy.
    ///
    /// Returns an error when the requested policy is incompatible with the current feature set
    /// (for example, non-single policy without `rayon`) or when a dedicated pool size is invalid.
    pub fn new(thread_policy: ThreadPolicy) -> KFResult<Self> {
        #[cfg(not(feature = "rayon"))]
        {
            if thread_policy != ThreadPolicy::Single {
                return Err(KFError::ExecutionContextError {
                    reason: "Rayon feature is required for non-single thread policies".into(),
                });
            }
        }

        #[cfg(feature = "rayon")]
        let dedicated_pool = match thread_policy {
            ThreadPolicy::Dedicated(n_threads) => {
                if n_threads == 0 {
                    return Err(KFError::ExecutionContextError {
                        reason: "Dedicated thread pool size must be >= 1".into(),
                    });
                }
                Some(
                    rayon::ThreadPoolBuilder::new()
                        .num_threads(n_threads)
                        .build()?,
                )
            }
            ThreadPolicy::Single | ThreadPolicy::GlobalPool => None,
        };

        Ok(Self {
            thread_policy,
            #[cfg(feature = "rayon")]
            dedicated_pool,
        })
    }

    /// Return the configured thread policy.
    pub fn thread_policy(&self) -> ThreadPolicy {
        self.thread_policy
    }

    /// Whether work should be spread over threads rather than run on the caller.
    pub fn is_parallel(&self) -> bool {
        self.thread_policy != ThreadPolicy::Single
    }

    /// Execute work under this context's thread policy.
    ///
    /// `Dedicated` runs inside the dedicated pool. Other policies run the closure directly.
    #[cfg(feature = "rayon")]
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.dedicated_pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Execute work under this context's thread policy.
    #[cfg(not(feature = "rayon"))]
    pub fn install<R>(&self, op: impl FnOnce() -> R) -> R {
        op()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_policy() {
        let ctx = ExecutionContext::new(ThreadPolicy::Single).unwrap();
        assert_eq!(ctx.thread_policy(), ThreadPolicy::Single);
        assert!(!ctx.is_parallel());
        assert_eq!(ctx.install(|| 2 + 2), 4);
        assert_eq!(
            ExecutionContext::default().thread_policy(),
            ThreadPolicy::Single
        );
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_dedicated_policy() {
        let ctx = ExecutionContext::new(ThreadPolicy::Dedicated(2)).unwrap();
        assert!(ctx.is_parallel());
        assert_eq!(ctx.install(rayon::current_num_threads), 2);
        assert!(matches!(
            ExecutionContext::new(ThreadPolicy::Dedicated(0)),
            Err(KFError::ExecutionContextError { .. })
        ));
    }

    #[cfg(not(feature = "rayon"))]
    #[test]
    fn test_parallel_policy_requires_rayon() {
        assert!(matches!(
            ExecutionContext::new(ThreadPolicy::GlobalPool),
            Err(KFError::ExecutionContextError { .. })
        ));
    }
}
