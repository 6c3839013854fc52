//! Reserved local ports for proxy listeners
//!
//! The allocator binds a socket to each port of its range with
//! `SO_REUSEADDR` and `SO_REUSEPORT`, which keeps other processes off those
//! ports while still letting a [`MarkedSocketFactory`] listener bind the
//! same port later. Reservation sockets are bound but never listen, so
//! they cannot take connections away from the real listener.
//!
//! [`MarkedSocketFactory`]: crate::net::marked::MarkedSocketFactory

use crate::core::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::TcpSocket;
use tokio::sync::{Mutex, mpsc};
use tracing::{Span, debug, info_span, warn};

#[derive(Debug)]
pub struct PortAllocator {
    free_tx: mpsc::Sender<u16>,
    free_rx: Mutex<mpsc::Receiver<u16>>,
    ports: Vec<u16>,
    _reservations: Vec<TcpSocket>,
    span: Span,
}

impl PortAllocator {
    /// Reserves `size` ports, scanning upwards from `start`.
    ///
    /// Ports that cannot be bound are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortAllocation`] if the scan runs past port 65535
    /// before `size` ports are reserved.
    pub fn new(start: u16, size: u16) -> Result<Self> {
        Self::with_span(start, size, info_span!("port_allocator", start, size))
    }

    pub fn with_span(start: u16, size: u16, span: Span) -> Result<Self> {
        let wanted = usize::from(size);
        let mut reservations = Vec::with_capacity(wanted);
        let mut ports = Vec::with_capacity(wanted);

        debug!(parent: &span, "reserving proxy ports");
        for port in start..=u16::MAX {
            if ports.len() == wanted {
                break;
            }
            match reserve(port) {
                Ok(socket) => {
                    reservations.push(socket);
                    ports.push(port);
                }
                Err(e) => debug!(parent: &span, port, error = %e, "cannot reserve port"),
            }
        }

        if ports.len() < wanted {
            return Err(Error::PortAllocation(format!(
                "reserved only {} of {size} ports starting at {start}",
                ports.len()
            )));
        }

        let (free_tx, free_rx) = mpsc::channel(wanted.max(1));
        for &port in &ports {
            // Capacity equals the number of reserved ports
            let _ = free_tx.try_send(port);
        }
        debug!(parent: &span, reserved = ports.len(), "done reserving proxy ports");

        Ok(Self {
            free_tx,
            free_rx: Mutex::new(free_rx),
            ports,
            _reservations: reservations,
            span,
        })
    }

    /// Takes a free port, waiting until one is released if all are in use.
    pub async fn allocate(&self) -> Result<u16> {
        let mut rx = self.free_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::PortAllocation("free port queue closed".to_string()))
    }

    /// Returns a port to the pool.
    ///
    /// Ports outside the reserved set are ignored.
    pub fn release(&self, port: u16) {
        if !self.ports.contains(&port) {
            warn!(parent: &self.span, port, "released port was never reserved");
            return;
        }
        if self.free_tx.try_send(port).is_err() {
            warn!(parent: &self.span, port, "free port queue is full, port released twice");
        }
    }

    /// Every reserved port, in reservation order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

fn reserve(port: u16) -> std::io::Result<TcpSocket> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::marked::MarkedSocketFactory;

    fn free_base() -> u16 {
        // Let the kernel pick a free region
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let alloc = PortAllocator::new(free_base(), 3).unwrap();
        assert_eq!(alloc.ports().len(), 3);

        let a = alloc.allocate().await.unwrap();
        let b = alloc.allocate().await.unwrap();
        assert_ne!(a, b);
        assert!(alloc.ports().contains(&a));

        alloc.release(a);
        alloc.release(1);

        let c = alloc.allocate().await.unwrap();
        let d = alloc.allocate().await.unwrap();
        assert!([c, d].contains(&a));
    }

    #[tokio::test]
    async fn test_allocate_waits_for_release() {
        let alloc = std::sync::Arc::new(PortAllocator::new(free_base(), 1).unwrap());
        let only = alloc.allocate().await.unwrap();

        let waiter = {
            let alloc = alloc.clone();
            tokio::spawn(async move { alloc.allocate().await.unwrap() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        alloc.release(only);
        assert_eq!(waiter.await.unwrap(), only);
    }

    #[test]
    fn test_range_exhaustion_is_an_error() {
        let err = PortAllocator::new(u16::MAX, 2).unwrap_err();
        assert!(matches!(err, Error::PortAllocation(_)));
    }

    #[tokio::test]
    async fn test_marked_listener_binds_reserved_port() {
        let alloc = PortAllocator::new(free_base(), 1).unwrap();
        let port = alloc.allocate().await.unwrap();

        let factory = MarkedSocketFactory::new(0xEEEE);
        let listener = factory
            .listen(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))
            .unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }
}
