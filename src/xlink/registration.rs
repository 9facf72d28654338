//! Persists emitted xlinks to the cache table store

use super::{table_name, Xlink};
use crate::cache::CacheTableStore;
use crate::concurrent::{Worker, WorkerFactory};
use crate::import::ImportContext;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Appends each batch of xlinks to the tables of their kinds
pub struct XlinkRegistrationWorker {
    store: Arc<CacheTableStore>,
    context: Arc<ImportContext>,
}

impl Worker<Vec<Xlink>> for XlinkRegistrationWorker {
    fn do_work(&mut self, batch: Vec<Xlink>) {
        let mut by_kind: BTreeMap<_, Vec<Xlink>> = BTreeMap::new();
        for xlink in batch {
            by_kind.entry(xlink.kind).or_default().push(xlink);
        }

        for (kind, xlinks) in by_kind {
            let written = self
                .store
                .table(&table_name(kind))
                .and_then(|table| table.append(&xlinks));
            match written {
                Ok(count) => self.context.xlinks_emitted(count),
                Err(e) => error!("Failed to register {} {} xlinks: {}", xlinks.len(), kind, e),
            }
        }
    }
}

pub struct XlinkRegistrationFactory {
    store: Arc<CacheTableStore>,
    context: Arc<ImportContext>,
}

impl XlinkRegistrationFactory {
    pub fn new(store: Arc<CacheTableStore>, context: Arc<ImportContext>) -> Self {
        Self { store, context }
    }
}

impl WorkerFactory<Vec<Xlink>> for XlinkRegistrationFactory {
    fn create_worker(&self) -> Option<Box<dyn Worker<Vec<Xlink>>>> {
        Some(Box::new(XlinkRegistrationWorker {
            store: Arc::clone(&self.store),
            context: Arc::clone(&self.context),
        }))
    }
}
