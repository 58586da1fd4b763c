use crate::error::{last_provider_error, provider_error, Result, RpmaError};
use rdma_sys::{rdma_bind_addr, rdma_cm_id, rdma_create_id, rdma_destroy_id, rdma_port_space};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::debug;

/// RDMA device context, obtained by resolving a local IPv4/IPv6 address
/// through the connection manager.
///
/// The context is owned by the connection manager's device list and stays
/// valid for the lifetime of the process, so this wrapper does not close it.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    /// Internal `ibv_context` pointer
    inner_ctx: NonNull<rdma_sys::ibv_context>,
}

impl Context {
    /// Get the internal context pointer
    pub(crate) const fn as_ptr(&self) -> *mut rdma_sys::ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// Obtain the RDMA device context servicing the given local address,
    /// using the TCP RDMA port space (reliable, connection oriented).
    ///
    /// A temporary communication identifier is bound to the address and its
    /// verbs context is taken; the identifier is destroyed before returning.
    pub fn resolve(addr: &str) -> Result<Self> {
        if addr.is_empty() {
            return Err(RpmaError::Invalid("addr is empty"));
        }
        let addr_info = AddrInfo::resolve(addr, None)?;

        let mut id = std::ptr::null_mut::<rdma_cm_id>();
        // SAFETY: ffi, a NULL event channel puts the identifier into
        // synchronous mode
        let errno = unsafe {
            rdma_create_id(
                std::ptr::null_mut(),
                &mut id,
                std::ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if errno != 0_i32 {
            return Err(last_provider_error("rdma_create_id"));
        }

        // SAFETY: ffi, `id` was just created
        if unsafe { rdma_bind_addr(id, addr_info.ai_addr()) } != 0_i32 {
            let err = last_provider_error("rdma_bind_addr");
            // SAFETY: ffi
            let _errno = unsafe { rdma_destroy_id(id) };
            return Err(err);
        }

        // SAFETY: a bound identifier carries the verbs context of its device
        let inner_ctx = NonNull::new(unsafe { (*id).verbs }).ok_or(RpmaError::Unknown);
        // SAFETY: ffi
        let _errno = unsafe { rdma_destroy_id(id) };
        let inner_ctx = inner_ctx?;
        debug!("resolved device context for {}", addr);
        Ok(Self { inner_ctx })
    }
}

unsafe impl Send for Context {}

unsafe impl Sync for Context {}

/// Resolved address list from `getaddrinfo`, freed on drop
pub(crate) struct AddrInfo {
    /// Head of the `addrinfo` result list
    inner: NonNull<libc::addrinfo>,
}

impl AddrInfo {
    /// Resolve `addr` (and optionally a service, i.e. a port in decimal)
    /// into a socket address list
    pub(crate) fn resolve(addr: &str, service: Option<&str>) -> Result<Self> {
        let addr_cstr =
            CString::new(addr).map_err(|_| RpmaError::Invalid("addr contains a NUL byte"))?;
        let service_cstr = match service {
            Some(service) => Some(
                CString::new(service)
                    .map_err(|_| RpmaError::Invalid("service contains a NUL byte"))?,
            ),
            None => None,
        };
        let mut res = std::ptr::null_mut::<libc::addrinfo>();
        // SAFETY: ffi, both strings outlive the call
        let ret = unsafe {
            libc::getaddrinfo(
                addr_cstr.as_ptr(),
                service_cstr
                    .as_ref()
                    .map_or(std::ptr::null(), |s| s.as_ptr()),
                std::ptr::null(),
                &mut res,
            )
        };
        if ret != 0_i32 {
            return Err(provider_error("getaddrinfo", ret));
        }
        NonNull::new(res)
            .map(|inner| Self { inner })
            .ok_or(RpmaError::Unknown)
    }

    /// Get the socket address of the first resolution result
    pub(crate) fn ai_addr(&self) -> *mut libc::sockaddr {
        // SAFETY: guaranteed valid by `AddrInfo::resolve`
        unsafe { self.inner.as_ref() }.ai_addr
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { libc::freeaddrinfo(self.inner.as_ptr()) };
    }
}
