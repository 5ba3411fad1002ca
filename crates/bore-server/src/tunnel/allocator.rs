//! Tunnel identifiers and public port allocation.

use bore_core::{BoreError, BoreResult};
use rand::Rng;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use tokio::net::TcpListener;
use tracing::debug;

/// Default range for auto-assigned forward ports.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 55000..=65000;

/// A short random identifier: 4 random bytes as 8 lowercase hex digits.
///
/// Not collision-free on its own; the registry re-rolls on collision.
pub fn generate_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

/// Whether `id` can be used as a subdomain label.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 63
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Binds public listeners for forward requests.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE)
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self { range }
    }

    /// Bind `addr:port`.
    ///
    /// Port `0` picks random ports from the range until one binds; only
    /// "address in use" triggers another pick, and the number of picks is
    /// bounded by the size of the range. Any other port is bound exactly and
    /// its failure is returned to the caller.
    pub async fn bind(&self, addr: &str, port: u32) -> BoreResult<(TcpListener, u16)> {
        let host = bind_host(addr);

        if port != 0 {
            let port = u16::try_from(port)
                .map_err(|_| BoreError::Allocation(format!("port {port} out of range")))?;
            let listener = TcpListener::bind((host, port))
                .await
                .map_err(|e| BoreError::Allocation(format!("bind {host}:{port}: {e}")))?;
            return Ok((listener, port));
        }

        let attempts = self.range.len();
        for attempt in 1..=attempts {
            let candidate = rand::thread_rng().gen_range(self.range.clone());
            match TcpListener::bind((host, candidate)).await {
                Ok(listener) => return Ok((listener, candidate)),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!(port = candidate, attempt, "port in use, picking another");
                }
                Err(e) => {
                    return Err(BoreError::Allocation(format!(
                        "bind {host}:{candidate}: {e}"
                    )));
                }
            }
        }

        Err(BoreError::Allocation(format!(
            "no free port in {}-{} after {attempts} attempts",
            self.range.start(),
            self.range.end()
        )))
    }
}

/// Map the requested bind address to something the socket layer accepts.
/// An empty address means every interface, as with SSH remote forwards.
fn bind_host(addr: &str) -> &str {
    match addr {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_eight_hex_digits() {
        let ids: HashSet<String> = (0..64).map(|_| generate_id()).collect();
        assert!(ids.len() > 1);
        for id in &ids {
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert!(is_valid_id(id));
        }
    }

    #[test]
    fn id_validation() {
        assert!(is_valid_id("my-app"));
        assert!(is_valid_id("a"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("-leading"));
        assert!(!is_valid_id("trailing-"));
        assert!(!is_valid_id("UPPER"));
        assert!(!is_valid_id("has.dot"));
        assert!(!is_valid_id(&"x".repeat(64)));
    }

    #[tokio::test]
    async fn auto_port_lands_in_range() {
        let allocator = PortAllocator::default();
        let (listener, port) = allocator.bind("127.0.0.1", 0).await.unwrap();
        assert!(DEFAULT_PORT_RANGE.contains(&port));
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn exhausted_range_is_an_allocation_error() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new(port..=port);
        let result = allocator.bind("127.0.0.1", 0).await;
        assert!(matches!(result, Err(BoreError::Allocation(_))));
    }

    #[tokio::test]
    async fn explicit_port_in_use_fails() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::default();
        let result = allocator.bind("127.0.0.1", port as u32).await;
        assert!(matches!(result, Err(BoreError::Allocation(_))));
    }

    #[tokio::test]
    async fn explicit_port_above_u16_fails() {
        let allocator = PortAllocator::default();
        let result = allocator.bind("127.0.0.1", 70_000).await;
        assert!(matches!(result, Err(BoreError::Allocation(_))));
    }

    #[test]
    fn empty_bind_address_means_all_interfaces() {
        assert_eq!(bind_host(""), "0.0.0.0");
        assert_eq!(bind_host("localhost"), "127.0.0.1");
        assert_eq!(bind_host("10.0.0.1"), "10.0.0.1");
    }
}
