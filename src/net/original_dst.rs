//! Recovery of the pre-redirection destination of accepted connections
//!
//! When a `REDIRECT`/`DNAT` rule steers a connection to a local listener,
//! conntrack still knows where the client was originally heading. The
//! `SO_ORIGINAL_DST` socket option (`IP6T_SO_ORIGINAL_DST` for IPv6) hands
//! that back as a raw `sockaddr_in` / `sockaddr_in6`.
//!
//! Layouts decoded here (family tag in host byte order, port and address
//! in network byte order):
//!
//! ```text
//! sockaddr_in   | family:2 | port:2 | addr:4  | zero:8                 |
//! sockaddr_in6  | family:2 | port:2 | flow:4  | addr:16 | scope_id:4   |
//! ```

use crate::core::error::OriginalDstError;
use nix::errno::Errno;
use nix::libc;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

/// `SO_ORIGINAL_DST` and `IP6T_SO_ORIGINAL_DST` share the same option number.
const SO_ORIGINAL_DST: libc::c_int = 80;

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;

/// Address family of a redirected connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    /// Picks the family from the connection's local address.
    ///
    /// IPv4-mapped IPv6 addresses (dual-stack listeners) are IPv4 flows and
    /// must be queried at the IPv4 level.
    pub fn of(local: &SocketAddr) -> Self {
        match local.ip() {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(ip) if ip.to_ipv4_mapped().is_some() => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// The `AF_*` tag the kernel writes at the start of the structure.
    pub fn tag(self) -> u16 {
        match self {
            Self::Inet => libc::AF_INET as u16,
            Self::Inet6 => libc::AF_INET6 as u16,
        }
    }

    /// Size of the structure the kernel fills in.
    pub fn response_len(self) -> usize {
        match self {
            Self::Inet => SOCKADDR_IN_LEN,
            Self::Inet6 => SOCKADDR_IN6_LEN,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => f.write_str("AF_INET"),
            Self::Inet6 => f.write_str("AF_INET6"),
        }
    }
}

/// Issues the original-destination query against a socket.
///
/// Fills `buf` with the raw structure and returns the number of bytes written.
pub trait OriginalDstQuery: Send + Sync {
    fn query(&self, fd: BorrowedFd<'_>, family: Family, buf: &mut [u8]) -> Result<usize, Errno>;
}

/// Queries conntrack through `getsockopt(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelQuery;

impl OriginalDstQuery for KernelQuery {
    fn query(&self, fd: BorrowedFd<'_>, family: Family, buf: &mut [u8]) -> Result<usize, Errno> {
        let level = match family {
            Family::Inet => libc::SOL_IP,
            Family::Inet6 => libc::SOL_IPV6,
        };
        let mut len = libc::socklen_t::try_from(buf.len()).map_err(|_| Errno::EINVAL)?;
        // SAFETY: `buf` is valid for writes of `len` bytes and the kernel
        // never writes more than the length it is given.
        let res = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                level,
                SO_ORIGINAL_DST,
                buf.as_mut_ptr().cast(),
                &raw mut len,
            )
        };
        Errno::result(res)?;
        Ok(len as usize)
    }
}

/// Decodes a raw `sockaddr_in` / `sockaddr_in6` returned for `family`.
pub fn decode(buf: &[u8], family: Family) -> Result<SocketAddr, OriginalDstError> {
    let expected = family.response_len();
    if buf.len() < expected {
        return Err(OriginalDstError::ShortResponse {
            len: buf.len(),
            expected,
        });
    }

    let found = u16::from_ne_bytes([buf[0], buf[1]]);
    if found != family.tag() {
        return Err(OriginalDstError::FamilyMismatch { expected: family, found });
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let addr = match family {
        Family::Inet => {
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        }
        Family::Inet6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[8..24]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
    };
    Ok(addr)
}

/// Recovers the original destination of a connection with the given local address.
pub fn resolve<Q: OriginalDstQuery + ?Sized>(
    fd: BorrowedFd<'_>,
    local: SocketAddr,
    query: &Q,
) -> Result<SocketAddr, OriginalDstError> {
    let family = Family::of(&local);
    let mut buf = [0u8; SOCKADDR_IN6_LEN];
    let len = query.query(fd, family, &mut buf[..family.response_len()])?;
    decode(&buf[..len], family)
}

/// Recovers the original destination of an accepted TCP stream.
pub fn original_destination(
    stream: &tokio::net::TcpStream,
) -> Result<SocketAddr, OriginalDstError> {
    let local = stream.local_addr().map_err(OriginalDstError::LocalAddr)?;
    resolve(stream.as_fd(), local, &KernelQuery)
}
