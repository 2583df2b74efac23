use std::net::{Ipv4Addr, TcpListener};

use log::debug;

use crate::error::StartupError;

/// A port chosen for the server.
///
/// The listener used to pick it is already closed, so another process may
/// take the port before the server binds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReservation(u16);

impl PortReservation {
    /// Use a port chosen by the user instead of allocating one.
    pub fn fixed(port: u16) -> Self {
        Self(port)
    }

    pub fn port(self) -> u16 {
        self.0
    }
}

/// Ask the OS for a free port on `127.0.0.1`.
pub fn allocate_loopback_port() -> Result<PortReservation, StartupError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(StartupError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(StartupError::PortAllocation)?
        .port();
    drop(listener);

    debug!("Allocated loopback port {}", port);
    Ok(PortReservation(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_port_is_bindable() {
        let reservation = allocate_loopback_port().unwrap();
        assert_ne!(reservation.port(), 0);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, reservation.port()));
        assert!(listener.is_ok());
    }

    #[test]
    fn test_fixed_port() {
        assert_eq!(PortReservation::fixed(4321).port(), 4321);
    }
}
