use super::{pack_descriptor, usage_into_ibv_access, MrUsage, Placement, DESCRIPTOR_SIZE};
use crate::error::{last_provider_error, provider_error, Result, RpmaError};
use crate::protection_domain::ProtectionDomain;
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use rdma_sys::{ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error};

/// A caller-owned buffer registered with a peer's protection domain.
///
/// The registration borrows the buffer, so the buffer outlives every work
/// request naming this region by construction. `lkey` and `rkey` are fixed
/// at registration time.
pub struct LocalMr<'b> {
    /// The registered buffer, exclusively borrowed while registered
    buf: &'b mut [u8],
    /// The internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
    /// Permitted usages of this region
    usage: BitFlags<MrUsage>,
    /// The protection domain this region belongs to
    _pd: Arc<ProtectionDomain>,
}

impl<'b> LocalMr<'b> {
    /// Register `buf` into `pd` with access flags derived from `usage`
    pub(crate) fn reg(
        pd: &Arc<ProtectionDomain>,
        buf: &'b mut [u8],
        usage: BitFlags<MrUsage>,
        placement: Placement,
    ) -> Result<Self> {
        if buf.is_empty() {
            return Err(RpmaError::Invalid("buffer is empty"));
        }
        if usage.is_empty() {
            return Err(RpmaError::Invalid("usage does not permit any operation"));
        }
        if placement != Placement::Volatile {
            return Err(RpmaError::NoSupp);
        }
        let access = usage_into_ibv_access(usage);
        // SAFETY: ffi, `buf` stays borrowed for the lifetime of the region
        let inner_mr = NonNull::new(unsafe {
            ibv_reg_mr(
                pd.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                access.0.cast(),
            )
        })
        .ok_or_else(|| last_provider_error("ibv_reg_mr"))?;
        debug!(
            "registered {} bytes at {:x} usage {:?}",
            buf.len(),
            buf.as_ptr() as usize,
            usage
        );
        Ok(Self {
            buf,
            inner_mr,
            usage,
            _pd: Arc::<ProtectionDomain>::clone(pd),
        })
    }

    /// Get the start address of the region
    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    /// Get the length of the region
    #[inline]
    #[must_use]
    pub fn length(&self) -> usize {
        self.buf.len()
    }

    /// Get the local access key
    #[inline]
    #[must_use]
    pub fn lkey(&self) -> u32 {
        // SAFETY: guaranteed valid by `LocalMr::reg`
        unsafe { self.inner_mr.as_ref() }.lkey
    }

    /// Get the remote access key
    #[inline]
    #[must_use]
    pub fn rkey(&self) -> u32 {
        // SAFETY: guaranteed valid by `LocalMr::reg`
        unsafe { self.inner_mr.as_ref() }.rkey
    }

    /// Get the permitted usages of this region
    #[inline]
    #[must_use]
    pub fn usage(&self) -> BitFlags<MrUsage> {
        self.usage
    }

    /// View the registered buffer
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &*self.buf
    }

    /// Serialize this region into the fixed wire descriptor understood by
    /// [`super::remote::RemoteMr::from_descriptor`] on the other side
    #[must_use]
    pub fn descriptor(&self) -> [u8; DESCRIPTOR_SIZE] {
        pack_descriptor(
            self.addr().cast(),
            self.length().cast(),
            self.rkey(),
            self.usage,
        )
    }

    /// Deregister the region and hand the buffer back.
    ///
    /// The caller must guarantee that no posted work request still names
    /// this region; the provider's refusal is surfaced as `Provider` and
    /// the region is handed back untouched for a later retry.
    pub fn dereg(self) -> std::result::Result<&'b mut [u8], (Self, RpmaError)> {
        // SAFETY: ffi
        let errno = unsafe { ibv_dereg_mr(self.inner_mr.as_ptr()) };
        if errno == 0_i32 {
            let this = std::mem::ManuallyDrop::new(self);
            // SAFETY: the registration handle is gone and `Drop` is skipped,
            // each owned field is moved out exactly once
            let buf = unsafe { std::ptr::read(&this.buf) };
            let pd = unsafe { std::ptr::read(&this._pd) };
            drop(pd);
            Ok(buf)
        } else {
            Err((self, provider_error("ibv_dereg_mr", errno)))
        }
    }
}

impl Debug for LocalMr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMr")
            .field("addr", &self.addr())
            .field("len", &self.length())
            .field("usage", &self.usage)
            .finish()
    }
}

unsafe impl Send for LocalMr<'_> {}

unsafe impl Sync for LocalMr<'_> {}

impl Drop for LocalMr<'_> {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dereg_mr(self.inner_mr.as_ptr()) };
        if errno != 0_i32 {
            error!("ibv_dereg_mr failed on drop: {}", errno);
        }
    }
}
