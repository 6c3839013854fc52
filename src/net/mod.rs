//! Socket plumbing for the transparent proxy path
//!
//! - [`marked`]: mark-tagged dialers and listeners whose accepted
//!   connections carry their pre-redirection destination
//! - [`original_dst`]: `SO_ORIGINAL_DST` query and decoding
//! - [`port_allocator`]: reserved local ports for proxy listeners

pub mod marked;
pub mod original_dst;
pub mod port_allocator;

use nix::errno::Errno;
use nix::libc;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Sets an integer socket option that nix has no typed wrapper for.
pub(crate) fn setsockopt_int(
    fd: BorrowedFd<'_>,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> Result<(), Errno> {
    // SAFETY: `value` outlives the call and its size is passed alongside.
    let res = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&raw const value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    Errno::result(res).map(drop)
}
