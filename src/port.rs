use std::net::{Ipv4Addr, TcpListener};

use crate::network::NetworkError;

/// Bind an ephemeral port on loopback, note it and release it. Nothing holds the port afterwards, so the caller
/// should rebind it promptly.
pub fn reserve_port() -> Result<u16, NetworkError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(NetworkError::PortReservationFailed)?;
    let port = listener
        .local_addr()
        .map_err(NetworkError::PortReservationFailed)?
        .port();
    drop(listener);
    tracing::trace!(port, "reserved host port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener};

    use super::reserve_port;

    #[test]
    fn reserved_port_can_be_rebound() {
        let port = reserve_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }
}
