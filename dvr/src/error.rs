//! Error taxonomy of the DVR core.
//!
//! Peer and filesystem problems are logged and retried by the normal
//! cadence; they never reach this type.  What does reach it either means
//! the internal model diverged from reality (`Invariant`) or discovery is
//! broken as a whole (`DiscoveryLost`).  Both are handled by [`fatal`].

use std::io::Write;

use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum DvrError {
    #[error("invalid transfer queue state: {0}")]
    Invariant(String),

    #[error("no live {kind} for more than {secs}s, discovery is broken")]
    DiscoveryLost { kind: &'static str, secs: i64 },
}

/// Terminate the process on purpose.
///
/// The service manager keeps the core dump and restarts the DVR, which
/// then rebuilds its state from scratch.
pub fn fatal(err: &DvrError) -> ! {
    error!("FATAL: {err}");
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::abort()
}
