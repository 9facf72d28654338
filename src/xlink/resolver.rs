//! Resolves replayed xlinks against the identifier caches

use super::Xlink;
use crate::cache::UidCacheManager;
use crate::concurrent::{InterruptKind, Worker, WorkerFactory};
use crate::config::LogLevel;
use crate::database::{DatabaseAdapter, DatabaseConnection, DatabaseError};
use crate::import::ImportContext;
use std::sync::Arc;
use tracing::{error, warn};

/// Looks up the target of each xlink and patches its source row
pub struct XlinkResolverWorker {
    connection: Box<dyn DatabaseConnection>,
    caches: Arc<UidCacheManager>,
    context: Arc<ImportContext>,
}

impl XlinkResolverWorker {
    fn resolve(&mut self, xlink: &Xlink) -> Result<bool, DatabaseError> {
        let target = match self.caches.lookup(xlink.cache_type(), &xlink.target) {
            Ok(target) => target,
            Err(e) => {
                error!("Cache lookup for '{}' failed: {}", xlink.target, e);
                None
            }
        };

        let Some(target) = target else {
            return Ok(false);
        };

        let patch = xlink.patch(target.id);
        if let Err(e) = self.connection.update(&patch).and_then(|_| self.connection.commit()) {
            if let Err(rollback) = self.connection.rollback() {
                warn!("Rollback failed: {}", rollback);
            }
            return Err(e);
        }
        Ok(true)
    }
}

impl Worker<Xlink> for XlinkResolverWorker {
    fn do_work(&mut self, xlink: Xlink) {
        match self.resolve(&xlink) {
            Ok(true) => self.context.xlink_resolved(),
            Ok(false) => {
                warn!(
                    "Unresolved {} reference from {}.{} (id {}) to '{}'",
                    xlink.kind, xlink.table, xlink.column, xlink.source_id, xlink.target
                );
                self.context.xlink_unresolved();
            }
            Err(DatabaseError::Connection(msg)) => {
                self.context.interrupt(
                    InterruptKind::DatabaseFailure,
                    Some(format!("Aborting xlink resolution: {}", msg)),
                    LogLevel::Error,
                );
            }
            Err(e) => {
                error!(
                    "Failed to resolve reference to '{}' on {}.{}: {}",
                    xlink.target, xlink.table, xlink.column, e
                );
                self.context.xlink_unresolved();
            }
        }
    }

    fn recover(&mut self) {
        if let Err(e) = self.connection.rollback() {
            warn!("Rollback failed: {}", e);
        }
        self.context.xlink_unresolved();
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.connection.commit() {
            warn!("Final commit of xlink resolver failed: {}", e);
        }
    }
}

pub struct XlinkResolverFactory {
    database: Arc<dyn DatabaseAdapter>,
    caches: Arc<UidCacheManager>,
    context: Arc<ImportContext>,
}

impl XlinkResolverFactory {
    pub fn new(
        database: Arc<dyn DatabaseAdapter>,
        caches: Arc<UidCacheManager>,
        context: Arc<ImportContext>,
    ) -> Self {
        Self {
            database,
            caches,
            context,
        }
    }
}

impl WorkerFactory<Xlink> for XlinkResolverFactory {
    fn create_worker(&self) -> Option<Box<dyn Worker<Xlink>>> {
        match self.database.connect() {
            Ok(connection) => Some(Box::new(XlinkResolverWorker {
                connection,
                caches: Arc::clone(&self.caches),
                context: Arc::clone(&self.context),
            })),
            Err(e) => {
                warn!("Failed to open a connection for the xlink resolver: {}", e);
                None
            }
        }
    }
}
