//! Cooperative, single-shot interrupt signal

use crate::config::LogLevel;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Why a run was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// The user asked to stop
    UserAbort,
    /// The input could not be read in a way that makes further files pointless
    ReadError,
    /// A worker lost its database in a way that makes further work pointless
    DatabaseFailure,
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptKind::UserAbort => f.write_str("user abort"),
            InterruptKind::ReadError => f.write_str("read error"),
            InterruptKind::DatabaseFailure => f.write_str("database failure"),
        }
    }
}

/// The interrupt that was acted upon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub message: Option<String>,
    pub level: LogLevel,
}

/// Process-wide stop switch for one run.
///
/// Only the first [`raise`](Self::raise) wins; later calls are ignored even
/// when they race with the first one.
#[derive(Debug, Default)]
pub struct InterruptSignal {
    raised: AtomicBool,
    cause: Mutex<Option<Interrupt>>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the interrupt. Returns `true` if this call was the one acted upon.
    pub fn raise(&self, kind: InterruptKind, message: Option<String>, level: LogLevel) -> bool {
        if self
            .raised
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if let Some(ref msg) = message {
            match level {
                LogLevel::Error => error!("{}", msg),
                LogLevel::Warn => warn!("{}", msg),
                _ => info!("{}", msg),
            }
        }

        *self.cause.lock() = Some(Interrupt {
            kind,
            message,
            level,
        });
        true
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// The interrupt that was acted upon, if any
    pub fn cause(&self) -> Option<Interrupt> {
        self.cause.lock().clone()
    }
}
