use crate::memory_region::{local::LocalMr, remote::RemoteMr};
use crate::ReadFlag;
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use rdma_sys::{ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode};
use std::mem;

/// A single-entry read work request.
///
/// Keeps the scatter/gather entry alongside the request so the pointer the
/// request carries stays valid until the post returns.
#[repr(C)]
pub(crate) struct ReadWr {
    /// Internal `ibv_send_wr`
    inner: ibv_send_wr,
    /// The scatter/gather entry describing the local destination
    sge: ibv_sge,
}

impl ReadWr {
    /// Build a read work request transferring `len` bytes from
    /// `src` + `src_offset` into `dst` + `dst_offset`, carrying `op_context`
    /// as the work-request id
    pub(crate) fn new(
        op_context: u64,
        dst: &LocalMr<'_>,
        dst_offset: usize,
        src: &RemoteMr,
        src_offset: usize,
        len: usize,
        flags: BitFlags<ReadFlag>,
    ) -> Self {
        let sge = ibv_sge {
            addr: dst.addr().wrapping_add(dst_offset).cast(),
            length: len.cast(),
            lkey: dst.lkey(),
        };
        // SAFETY: POD FFI type
        let mut inner = unsafe { mem::zeroed::<ibv_send_wr>() };
        inner.wr_id = op_context;
        inner.next = std::ptr::null_mut();
        inner.num_sge = 1_i32;
        inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        inner.wr.rdma.remote_addr = src.addr_at(src_offset);
        inner.wr.rdma.rkey = src.rkey();
        if flags.contains(ReadFlag::WaitForCompletion) {
            inner.send_flags =
                (ibv_send_flags::IBV_SEND_SIGNALED | ibv_send_flags::IBV_SEND_SOLICITED).0;
        }
        Self { inner, sge }
    }

    /// Finish wiring the scatter/gather list and expose the request for
    /// posting. Must be called on the value at its final location.
    pub(crate) fn as_mut_ptr(&mut self) -> *mut ibv_send_wr {
        self.inner.sg_list = &mut self.sge;
        &mut self.inner
    }
}
