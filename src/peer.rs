use crate::context::Context;
use crate::error::{provider_error, Result, RpmaError};
use crate::memory_region::{local::LocalMr, MrUsage, Placement};
use crate::protection_domain::ProtectionDomain;
use enumflags2::BitFlags;
use std::sync::Arc;
use tracing::debug;

/// The root object of the crate: owns a protection domain bound to one
/// device context and is the sole factory for memory regions.
///
/// Memory regions, connection requests, connections and endpoints all keep a
/// back-reference to the peer's protection domain; [`Peer::delete`] refuses
/// to run while any of them is alive.
#[derive(Debug)]
pub struct Peer {
    /// The protection domain owned by this peer
    pd: Arc<ProtectionDomain>,
}

impl Peer {
    /// Create a peer object against the given device context
    pub fn new(ctx: &Context) -> Result<Self> {
        let pd = Arc::new(ProtectionDomain::create(ctx)?);
        debug!("created peer");
        Ok(Self { pd })
    }

    /// Get the protection domain for derived objects
    pub(crate) fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// Register `buf` with this peer's protection domain.
    ///
    /// The region borrows the buffer for its whole lifetime, so the buffer
    /// cannot be freed or registered twice while the region exists. Access
    /// flags are derived from `usage`: [`MrUsage::ReadSrc`] grants the
    /// remote side read permission, [`MrUsage::ReadDst`] grants the local
    /// NIC write permission.
    ///
    /// Persistence-aware placement is not supported by this build and is
    /// reported as `NoSupp`.
    pub fn register<'b>(
        &self,
        buf: &'b mut [u8],
        usage: BitFlags<MrUsage>,
        placement: Placement,
    ) -> Result<LocalMr<'b>> {
        LocalMr::reg(&self.pd, buf, usage, placement)
    }

    /// Tear down the protection domain.
    ///
    /// Fails with `Provider` (`EBUSY`) while memory regions, connection
    /// requests, connections or endpoints derived from this peer are still
    /// alive; the peer is handed back so the call can be retried after the
    /// dependents are released.
    pub fn delete(self) -> std::result::Result<(), (Self, RpmaError)> {
        match Arc::try_unwrap(self.pd) {
            Ok(pd) => pd
                .destroy()
                .map_err(|(pd, err)| (Self { pd: Arc::new(pd) }, err)),
            Err(pd) => {
                let err = provider_error("ibv_dealloc_pd", libc::EBUSY);
                Err((Self { pd }, err))
            }
        }
    }
}
