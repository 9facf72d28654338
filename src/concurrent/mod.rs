//! Worker pools and the cooperative interrupt shared by all pipeline stages

mod interrupt;
mod pool;

pub use interrupt::{Interrupt, InterruptKind, InterruptSignal};
pub use pool::{PoolError, PoolSizeAdaptation, Worker, WorkerFactory, WorkerPool};
