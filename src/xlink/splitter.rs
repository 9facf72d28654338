//! Replays persisted xlinks into the resolver pool

use super::{table_name, Xlink};
use crate::cache::{CacheError, CacheTableStore};
use crate::concurrent::{InterruptSignal, WorkerPool};
use crate::types::XlinkKind;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Records dispatched between two interrupt checks
pub const SPLITTER_CHECK_INTERVAL: usize = 1000;

/// Outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitterStats {
    pub dispatched: BTreeMap<XlinkKind, u64>,
    /// Records that could not be decoded
    pub corrupt: u64,
    pub interrupted: bool,
}

impl SplitterStats {
    pub fn total(&self) -> u64 {
        self.dispatched.values().sum()
    }
}

/// Scans the xlink tables kind by kind and feeds the resolver pool.
///
/// Kinds are replayed in [`XlinkKind::ALL`] order and the pool is drained
/// between kinds.
pub struct XlinkSplitter<'a> {
    store: &'a CacheTableStore,
    pool: &'a WorkerPool<Xlink>,
    interrupt: &'a InterruptSignal,
}

impl<'a> XlinkSplitter<'a> {
    pub fn new(
        store: &'a CacheTableStore,
        pool: &'a WorkerPool<Xlink>,
        interrupt: &'a InterruptSignal,
    ) -> Self {
        Self {
            store,
            pool,
            interrupt,
        }
    }

    pub fn start_query(&self) -> Result<SplitterStats, CacheError> {
        let mut stats = SplitterStats::default();

        'kinds: for kind in XlinkKind::ALL {
            if self.interrupt.is_raised() {
                stats.interrupted = true;
                break;
            }

            let table = self.store.table(&table_name(kind))?;
            if table.is_empty() {
                continue;
            }
            debug!("Replaying {} {} xlinks", table.len(), kind);

            for (n, record) in table.scan::<Xlink>().enumerate() {
                if n % SPLITTER_CHECK_INTERVAL == 0 && self.interrupt.is_raised() {
                    stats.interrupted = true;
                    break 'kinds;
                }

                let xlink = match record {
                    Ok(xlink) => xlink,
                    Err(e) => {
                        warn!("Skipping unreadable {} xlink: {}", kind, e);
                        stats.corrupt += 1;
                        continue;
                    }
                };

                if let Err(e) = self.pool.add_work(xlink) {
                    warn!("Xlink resolution stopped: {}", e);
                    stats.interrupted = true;
                    break 'kinds;
                }
                *stats.dispatched.entry(kind).or_default() += 1;
            }

            self.pool.join();
        }

        if stats.interrupted {
            info!("Xlink resolution interrupted after {} records", stats.total());
        }
        Ok(stats)
    }
}
