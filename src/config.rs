//! Process-wide configuration.
//!
//! A [`Context`] bundles the shared thread pool, the optional log sink, and
//! the inline-value ceiling. Stores built without an explicit context share
//! [`Context::global`], so embedding applications get one pool and one
//! logger per process unless they choose otherwise.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::kv::constants::{INTERNAL_LIMIT_DEFAULT, INTERNAL_LIMIT_MAX, INTERNAL_LIMIT_MIN};
use crate::util::executor::ThreadPool;

/// Pluggable log sink. Every callback identifies the store by name.
pub trait Logger: Send + Sync {
    fn info(&self, name: &str, message: &str);
    fn warning(&self, name: &str, error: &dyn std::error::Error);
    fn error(&self, name: &str, error: &dyn std::error::Error);
}

/// Default sink: forwards to the `log` crate facade.
pub struct LogFacade;

impl Logger for LogFacade {
    fn info(&self, name: &str, message: &str) {
        log::info!("[{}] {}", name, message);
    }

    fn warning(&self, name: &str, error: &dyn std::error::Error) {
        log::warn!("[{}] {}", name, error);
    }

    fn error(&self, name: &str, error: &dyn std::error::Error) {
        log::error!("[{}] {}", name, error);
    }
}

/// Shared runtime configuration for one or more stores.
pub struct Context {
    pool: Arc<ThreadPool>,
    logger: Option<Arc<dyn Logger>>,
    internal_limit: usize,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The process-wide default: four pooled workers with a ten-second idle
    /// timeout, the `log`-facade sink, and the default inline limit.
    pub fn global() -> Arc<Context> {
        static GLOBAL: OnceLock<Arc<Context>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Context::builder().build()))
    }

    pub(crate) fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub(crate) fn logger(&self) -> Option<&Arc<dyn Logger>> {
        self.logger.as_ref()
    }

    pub fn internal_limit(&self) -> usize {
        self.internal_limit
    }
}

pub struct ContextBuilder {
    pool: Option<Arc<ThreadPool>>,
    logger: Option<Arc<dyn Logger>>,
    internal_limit: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        ContextBuilder {
            pool: None,
            logger: Some(Arc::new(LogFacade)),
            internal_limit: INTERNAL_LIMIT_DEFAULT,
        }
    }
}

impl ContextBuilder {
    /// Replace the default worker pool.
    pub fn pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Install a custom log sink.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Disable logging entirely.
    pub fn no_logger(mut self) -> Self {
        self.logger = None;
        self
    }

    /// Inline-value ceiling; clamped to the supported range.
    pub fn internal_limit(mut self, limit: usize) -> Self {
        self.internal_limit = limit.clamp(INTERNAL_LIMIT_MIN, INTERNAL_LIMIT_MAX);
        self
    }

    pub fn build(self) -> Arc<Context> {
        Arc::new(Context {
            pool: self
                .pool
                .unwrap_or_else(|| Arc::new(ThreadPool::new(4, Duration::from_secs(10)))),
            logger: self.logger,
            internal_limit: self.internal_limit,
        })
    }
}
