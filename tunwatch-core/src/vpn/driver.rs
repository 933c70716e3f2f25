//! Tunnel driver contract
//!
//! The engine never touches packets. A [`TunnelDriver`] opens and closes the
//! real tunnel for a given server and protocol, and reports unexpected drops
//! through the [`DropNotifier`] it was handed at open time.

use crate::error::TunnelError;
use crate::types::{Protocol, ServerDescriptor};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Opens and tears down the actual tunnel
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Establish a tunnel to `server` using `protocol`
    ///
    /// After a successful open the driver keeps `drops` and calls
    /// [`DropNotifier::notify`] if the tunnel later fails on its own.
    async fn open(
        &self,
        server: &ServerDescriptor,
        protocol: Protocol,
        drops: DropNotifier,
    ) -> Result<(), TunnelError>;

    /// Tear down the current tunnel, if any
    async fn close(&self) -> Result<(), TunnelError>;
}

/// A drop report tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDrop {
    pub session: u64,
    pub reason: String,
}

/// Handle a driver uses to report that an open tunnel went away
///
/// Each handle is bound to one session; reports from a session the engine
/// has already moved past are ignored by the engine.
#[derive(Debug, Clone)]
pub struct DropNotifier {
    session: u64,
    tx: mpsc::UnboundedSender<TunnelDrop>,
}

impl DropNotifier {
    pub(crate) fn new(session: u64, tx: mpsc::UnboundedSender<TunnelDrop>) -> Self {
        Self { session, tx }
    }

    /// Session this notifier belongs to
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Report the tunnel as dropped
    ///
    /// Returns `false` if the engine has shut down.
    pub fn notify(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(TunnelDrop {
                session: self.session,
                reason: reason.into(),
            })
            .is_ok()
    }
}
