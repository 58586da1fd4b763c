/// Local Memory Region
pub(crate) mod local;
/// Remote Memory Region
pub(crate) mod remote;

use crate::error::{Result, RpmaError};
use clippy_utilities::Cast;
use enumflags2::{bitflags, BitFlags};
use rdma_sys::ibv_access_flags;

/// Size of the wire descriptor exchanged between peers, see
/// [`local::LocalMr::descriptor`] and [`remote::RemoteMr::from_descriptor`]
pub const DESCRIPTOR_SIZE: usize = 24;

/// Permitted usages of a memory region
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MrUsage {
    /// The remote side may read from this region
    ReadSrc = 0b01,
    /// Local reads may land into this region
    ReadDst = 0b10,
}

/// Placement hint of the registered buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Placement {
    /// Plain volatile memory
    #[default]
    Volatile,
    /// Persistent memory; persistence-aware registration is not available
    /// in this build and is reported as `NoSupp`
    Persistent,
}

/// Derive verbs access flags from the usage bitmask
pub(crate) fn usage_into_ibv_access(usage: BitFlags<MrUsage>) -> ibv_access_flags {
    let mut access = ibv_access_flags(0);
    if usage.contains(MrUsage::ReadSrc) {
        access |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if usage.contains(MrUsage::ReadDst) {
        access |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    access
}

/// Pack region metadata into the fixed little-endian wire descriptor:
/// 8 bytes virtual address, 8 bytes length, 4 bytes rkey, 1 byte usage,
/// 3 bytes reserved (zero)
pub(crate) fn pack_descriptor(
    addr: u64,
    len: u64,
    rkey: u32,
    usage: BitFlags<MrUsage>,
) -> [u8; DESCRIPTOR_SIZE] {
    let mut desc = [0_u8; DESCRIPTOR_SIZE];
    desc[0..8].copy_from_slice(&addr.to_le_bytes());
    desc[8..16].copy_from_slice(&len.to_le_bytes());
    desc[16..20].copy_from_slice(&rkey.to_le_bytes());
    desc[20] = usage.bits();
    desc
}

/// Unpack the wire descriptor produced by [`pack_descriptor`].
///
/// Trailing bytes beyond the descriptor are tolerated since the transport
/// carrying it (typically connect/accept private data) may pad the payload.
pub(crate) fn unpack_descriptor(desc: &[u8]) -> Result<(u64, u64, u32, BitFlags<MrUsage>)> {
    if desc.len() < DESCRIPTOR_SIZE {
        return Err(RpmaError::Invalid("descriptor is too short"));
    }
    let addr = u64::from_le_bytes(desc[0..8].try_into().unwrap_or_default());
    let len = u64::from_le_bytes(desc[8..16].try_into().unwrap_or_default());
    let rkey = u32::from_le_bytes(desc[16..20].try_into().unwrap_or_default());
    let usage = BitFlags::<MrUsage>::from_bits(desc[20])
        .map_err(|_| RpmaError::Invalid("descriptor carries unknown usage bits"))?;
    Ok((addr, len, rkey, usage))
}

/// Check that a read of `len` bytes fits both regions and that the regions
/// permit it. Pure so it can be exercised without a provider.
pub(crate) fn check_read_range(
    dst_len: usize,
    dst_usage: BitFlags<MrUsage>,
    dst_offset: usize,
    src_len: u64,
    src_usage: BitFlags<MrUsage>,
    src_offset: usize,
    len: usize,
) -> Result<()> {
    let dst_end = dst_offset
        .checked_add(len)
        .ok_or(RpmaError::Invalid("dst_offset + len overflows"))?;
    if dst_end > dst_len {
        return Err(RpmaError::Invalid("read exceeds the destination region"));
    }
    let src_end: u64 = src_offset
        .checked_add(len)
        .ok_or(RpmaError::Invalid("src_offset + len overflows"))?
        .cast();
    if src_end > src_len {
        return Err(RpmaError::Invalid("read exceeds the source region"));
    }
    if !dst_usage.contains(MrUsage::ReadDst) {
        return Err(RpmaError::Invalid("destination region does not permit ReadDst"));
    }
    if !src_usage.contains(MrUsage::ReadSrc) {
        return Err(RpmaError::Invalid("source region does not permit ReadSrc"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_region::remote::RemoteMr;

    #[test]
    fn descriptor_round_trip() {
        let usage = MrUsage::ReadSrc | MrUsage::ReadDst;
        let desc = pack_descriptor(0xdead_beef_0bad_cafe, 4096, 0x1234_5678, usage);
        let rmr = RemoteMr::from_descriptor(&desc).unwrap();
        assert_eq!(rmr.raddr(), 0xdead_beef_0bad_cafe);
        assert_eq!(rmr.length(), 4096);
        assert_eq!(rmr.rkey(), 0x1234_5678);
        assert_eq!(rmr.usage(), usage);
    }

    #[test]
    fn descriptor_reserved_bytes_are_zero() {
        let desc = pack_descriptor(1, 2, 3, MrUsage::ReadSrc.into());
        assert_eq!(&desc[21..24], &[0_u8; 3]);
    }

    #[test]
    fn descriptor_tolerates_padding() {
        let mut padded = vec![0_u8; 196];
        let desc = pack_descriptor(7, 128, 9, MrUsage::ReadSrc.into());
        padded[..DESCRIPTOR_SIZE].copy_from_slice(&desc);
        let rmr = RemoteMr::from_descriptor(&padded).unwrap();
        assert_eq!(rmr.raddr(), 7);
        assert_eq!(rmr.length(), 128);
    }

    #[test]
    fn descriptor_too_short() {
        assert!(matches!(
            RemoteMr::from_descriptor(&[0_u8; DESCRIPTOR_SIZE - 1]).unwrap_err(),
            RpmaError::Invalid(_)
        ));
    }

    #[test]
    fn descriptor_unknown_usage_bits() {
        let mut desc = pack_descriptor(1, 2, 3, MrUsage::ReadSrc.into());
        desc[20] = 0xF0;
        assert!(matches!(
            RemoteMr::from_descriptor(&desc).unwrap_err(),
            RpmaError::Invalid(_)
        ));
    }

    #[test]
    fn usage_to_access_flags() {
        assert_eq!(
            usage_into_ibv_access(MrUsage::ReadSrc.into()),
            ibv_access_flags::IBV_ACCESS_REMOTE_READ
        );
        assert_eq!(
            usage_into_ibv_access(MrUsage::ReadDst.into()),
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        );
        assert_eq!(
            usage_into_ibv_access(MrUsage::ReadSrc | MrUsage::ReadDst),
            ibv_access_flags::IBV_ACCESS_REMOTE_READ | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        );
    }

    #[test]
    fn read_range_checks() {
        let both = MrUsage::ReadSrc | MrUsage::ReadDst;
        // in bounds
        assert!(check_read_range(4096, both, 256, 4096, both, 512, 128).is_ok());
        // destination overrun
        assert!(check_read_range(4096, both, 4000, 4096, both, 0, 128).is_err());
        // source overrun
        assert!(check_read_range(4096, both, 0, 4096, both, 4095, 2).is_err());
        // offset + len overflow
        assert!(check_read_range(4096, both, usize::MAX, 4096, both, 0, 2).is_err());
        // missing permissions
        assert!(
            check_read_range(4096, MrUsage::ReadSrc.into(), 0, 4096, both, 0, 16).is_err()
        );
        assert!(
            check_read_range(4096, both, 0, 4096, MrUsage::ReadDst.into(), 0, 16).is_err()
        );
    }
}
