//! Per-file identifier caches and their backing cache tables

mod table;
mod uid;

pub use table::{CacheError, CacheTable, CacheTableStore};
pub use uid::{UidCache, UidCacheManager, UidCacheType, UidEntry};
