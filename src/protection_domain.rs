use crate::context::Context;
use crate::error::{provider_error, record_msg, Result, RpmaError};
use rdma_sys::{ibv_alloc_pd, ibv_dealloc_pd, ibv_pd};
use std::io;
use std::ptr::NonNull;
use tracing::error;

/// Protection Domain Wrapper
///
/// Every object derived from a peer keeps a clone of the `Arc` holding this
/// wrapper, so the domain outlives everything it protects.
#[derive(Debug)]
pub(crate) struct ProtectionDomain {
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get pointer to the internal `ibv_pd`
    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Allocate a protection domain against the device context
    ///
    /// On failure of `ibv_alloc_pd`, errno indicates the failure reason;
    /// `ENOMEM` is reported as `NoMem` so callers can retry allocation
    /// failures uniformly, and a clean errno is reported as `Unknown`.
    pub(crate) fn create(ctx: &Context) -> Result<Self> {
        // SAFETY: ffi
        match NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) }) {
            Some(inner_pd) => Ok(Self { inner_pd }),
            None => {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0_i32);
                match errno {
                    0_i32 => {
                        error!("ibv_alloc_pd failed without setting errno");
                        record_msg("ibv_alloc_pd: no error value".to_owned());
                        Err(RpmaError::Unknown)
                    }
                    libc::ENOMEM => {
                        record_msg("ibv_alloc_pd: out of memory".to_owned());
                        Err(RpmaError::NoMem)
                    }
                    _ => Err(provider_error("ibv_alloc_pd", errno)),
                }
            }
        }
    }

    /// Deallocate the protection domain, handing the wrapper back on a
    /// provider failure so the caller can retry after releasing whatever
    /// the provider still counts as a dependent
    pub(crate) fn destroy(self) -> std::result::Result<(), (Self, RpmaError)> {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno == 0_i32 {
            std::mem::forget(self);
            Ok(())
        } else {
            Err((self, provider_error("ibv_dealloc_pd", errno)))
        }
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno != 0_i32 {
            error!("ibv_dealloc_pd failed on drop: {}", errno);
        }
    }
}

unsafe impl Send for ProtectionDomain {}

unsafe impl Sync for ProtectionDomain {}
