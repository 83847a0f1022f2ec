//! The explicit runtime handle: registries, logging, and the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::actor::WorkerActor;
use crate::block::{Block, BlockHandle, PortLayout};
use crate::errors::{Error, Result};
use crate::logging::{SchedulerEvent, SCHEDULER_STREAM};
use crate::scheduler::{Config, ThreadPool};
use crate::topology::Topology;
use crate::value::{Comparators, Value};

/// Builds a block and its port layout from configuration arguments.
pub type BlockFactory = Box<dyn Fn(&[Value]) -> Result<(Box<dyn Block>, PortLayout)> + Send + Sync>;

pub(crate) struct RuntimeInner {
    pub(crate) pool: ThreadPool,
    pub(crate) log_registry: Arc<sigflow_logging::Registry>,
    factories: Mutex<HashMap<String, BlockFactory>>,
    comparators: Comparators,
    uid: AtomicU64,
}

/// The handle everything hangs off: block factories, value comparators,
/// the logging registry, and the scheduler thread pool.
///
/// There is no global state; plug-ins register into a `Runtime` and
/// topologies are created from one. Clones share the same runtime. The
/// pool shuts down when the last clone drops.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime with the default scheduler configuration.
    pub fn new() -> Result<Runtime> {
        Runtime::with_config(Config::default())
    }

    /// A runtime with an explicit scheduler configuration.
    pub fn with_config(config: Config) -> Result<Runtime> {
        let log_registry = Arc::new(sigflow_logging::Registry::default());
        let pool = ThreadPool::new(config, Arc::clone(&log_registry));
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                pool,
                log_registry,
                factories: Mutex::new(HashMap::new()),
                comparators: Comparators::default(),
                uid: AtomicU64::new(1),
            }),
        })
    }

    /// The logging registry. Install actions here before building blocks
    /// so their loggers bind to the installed destinations.
    pub fn log_registry(&self) -> &sigflow_logging::Registry {
        &self.inner.log_registry
    }

    /// The opaque-value comparator table.
    pub fn comparators(&self) -> &Comparators {
        &self.inner.comparators
    }

    /// Registers structural equality for an opaque value type.
    pub fn register_comparator<T: std::any::Any + PartialEq>(&self) {
        self.inner.comparators.register::<T>();
    }

    /// Compares two values using the registered comparators.
    pub fn eq_values(&self, a: &Value, b: &Value) -> bool {
        self.inner.comparators.eq_values(a, b)
    }

    /// Registers a named block factory.
    pub fn register_factory(
        &self,
        name: &str,
        factory: impl Fn(&[Value]) -> Result<(Box<dyn Block>, PortLayout)> + Send + Sync + 'static,
    ) {
        self.inner.factories.lock().unwrap().insert(name.to_owned(), Box::new(factory));
    }

    /// Instantiates a registered block by factory name.
    pub fn make(&self, name: &str, args: &[Value]) -> Result<BlockHandle> {
        let (block, layout) = {
            let factories = self.inner.factories.lock().unwrap();
            let factory = factories
                .get(name)
                .ok_or_else(|| Error::InvalidArgument(format!("no block factory registered as '{}'", name)))?;
            factory(args)?
        };
        Ok(self.block_boxed(name, block, &layout))
    }

    /// Wraps a block instance for use in topologies.
    pub fn block(&self, name: &str, block: impl Block, layout: &PortLayout) -> BlockHandle {
        self.block_boxed(name, Box::new(block), layout)
    }

    fn block_boxed(&self, name: &str, block: Box<dyn Block>, layout: &PortLayout) -> BlockHandle {
        let logger = self.inner.log_registry.get::<SchedulerEvent>(SCHEDULER_STREAM);
        let actor = WorkerActor::new(name.to_owned(), self.next_uid(), block, layout, logger);
        BlockHandle { actor }
    }

    /// A new, empty topology bound to this runtime.
    pub fn topology(&self, name: &str) -> Topology {
        Topology::new(self.clone(), name)
    }

    /// Stops the scheduler; waiting external callers receive `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    pub(crate) fn next_uid(&self) -> u64 {
        self.inner.uid.fetch_add(1, Ordering::Relaxed)
    }
}
