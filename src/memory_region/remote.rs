use super::{unpack_descriptor, MrUsage};
use crate::error::Result;
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use getset::CopyGetters;

/// Memory region exposed by the other side of a connection.
///
/// Decoded from the wire descriptor a peer produced from one of its local
/// regions; carries no registration resource of its own and is only an
/// addressable target for remote reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
pub struct RemoteMr {
    /// Remote virtual address of the region
    #[getset(get_copy = "pub")]
    raddr: u64,
    /// Length of the region in bytes
    #[getset(get_copy = "pub")]
    length: u64,
    /// Remote access key naming the region in work requests
    #[getset(get_copy = "pub")]
    rkey: u32,
    /// Usages the owning peer permits on the region
    #[getset(get_copy = "pub")]
    usage: BitFlags<MrUsage>,
}

impl RemoteMr {
    /// Reconstruct a remote region from a wire descriptor received from the
    /// other side, typically as connect/accept private data.
    ///
    /// Bytes beyond the fixed descriptor size are ignored since the
    /// handshake transport may pad the payload.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self> {
        let (raddr, length, rkey, usage) = unpack_descriptor(desc)?;
        Ok(Self {
            raddr,
            length,
            rkey,
            usage,
        })
    }

    /// Remote address at `offset` bytes into the region
    pub(crate) fn addr_at(&self, offset: usize) -> u64 {
        let offset: u64 = offset.cast();
        self.raddr.wrapping_add(offset)
    }
}
