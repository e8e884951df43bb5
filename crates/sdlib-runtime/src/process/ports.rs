//! Port allocation utilities.

use std::net::TcpListener;

use tracing::debug;

use sdlib_core::ProcessError;

/// First port of the scan range.
pub const PORT_RANGE_START: u16 = 8000;
/// Last port of the scan range.
pub const PORT_RANGE_END: u16 = 9000;

/// Check if a port is bindable on loopback. Binds and immediately drops
/// the listener, which releases the port.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// Pick a port: the preferred one if it is neither tracked nor bound,
/// else the first bindable port in the scan range.
///
/// `unavailable` is the caller's view of tracked and reserved ports; a
/// port in that set is never bind-probed.
pub fn allocate_port(
    preferred: Option<u16>,
    unavailable: &std::collections::HashSet<u16>,
) -> Result<u16, ProcessError> {
    if let Some(port) = preferred {
        if !unavailable.contains(&port) && is_port_available(port) {
            return Ok(port);
        }
        debug!(port, "preferred port unavailable, scanning range");
    }

    for port in PORT_RANGE_START..=PORT_RANGE_END {
        if unavailable.contains(&port) {
            continue;
        }
        if is_port_available(port) {
            debug!(port, "allocated port from scan range");
            return Ok(port);
        }
    }

    Err(ProcessError::PortExhausted {
        start: PORT_RANGE_START,
        end: PORT_RANGE_END,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn preferred_port_wins_when_free() {
        // Find a free port first by binding to 0
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let allocated = allocate_port(Some(port), &HashSet::new()).unwrap();
        assert_eq!(allocated, port);
    }

    #[test]
    fn bound_preferred_port_falls_back_to_range() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();

        let allocated = allocate_port(Some(bound), &HashSet::new()).unwrap();
        assert_ne!(allocated, bound);
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&allocated));
    }

    #[test]
    fn tracked_ports_are_never_probed() {
        let mut unavailable = HashSet::new();
        // Mark the entire range unavailable except nothing: exhaustion
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            unavailable.insert(port);
        }
        assert!(matches!(
            allocate_port(None, &unavailable),
            Err(ProcessError::PortExhausted { .. })
        ));
    }
}
