//! Round-robin dialer over the candidate manager endpoints.

use crate::addr::{Address, AddressList};
use crate::ClientError;
use hivelink_connection::MuxStream;
use rustls::pki_types::ServerName;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A freshly dialed manager connection, before the consult handshake.
pub struct DialedConn {
    pub stream: MuxStream,
    /// Local address the socket bound to; becomes the identity's outbound IP.
    pub local_ip: IpAddr,
    pub address: Address,
}

/// Iterates the address list one attempt at a time, wrapping around.
pub struct IterDialer {
    addresses: AddressList,
    cursor: AtomicUsize,
    tls: TlsConnector,
}

impl IterDialer {
    pub fn new(addresses: AddressList) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            addresses,
            cursor: AtomicUsize::new(0),
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Attempt the next address in round-robin order, bounding the TCP (and
    /// TLS, when enabled) connect by `limit`.
    pub async fn dial(&self, limit: Duration) -> Result<DialedConn, ClientError> {
        let address = self.next_address().ok_or(ClientError::EmptyAddress)?;
        self.attempt(address, limit).await
    }

    fn next_address(&self) -> Option<Address> {
        let len = self.addresses.len();
        if len == 0 {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        self.addresses.get(idx).cloned()
    }

    async fn attempt(&self, address: Address, limit: Duration) -> Result<DialedConn, ClientError> {
        let tcp = tokio::time::timeout(limit, TcpStream::connect(&address.addr))
            .await
            .map_err(|_| timed_out(&address))??;
        let local_ip = tcp.local_addr()?.ip();

        if !address.tls {
            return Ok(DialedConn {
                stream: Box::new(tcp),
                local_ip,
                address,
            });
        }

        let host_name = address.host_name().to_string();
        let server_name = ServerName::try_from(host_name.clone())
            .map_err(|_| ClientError::BadServerName(host_name))?;
        let tls = tokio::time::timeout(limit, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| timed_out(&address))??;

        Ok(DialedConn {
            stream: Box::new(tls),
            local_ip,
            address,
        })
    }
}

fn timed_out(address: &Address) -> ClientError {
    ClientError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("dial {address} timed out"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn list(addrs: &[&str]) -> AddressList {
        AddressList::new(
            addrs
                .iter()
                .map(|addr| Address {
                    tls: false,
                    addr: addr.to_string(),
                    name: None,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn attempts_rotate_through_the_address_list() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();

        // one dead endpoint, one live; the second attempt must move on
        let dialer = IterDialer::new(list(&["127.0.0.1:9", &live]));

        let first = dialer.dial(Duration::from_secs(1)).await;
        assert!(first.is_err());

        let second = dialer.dial(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.address.addr, live);
        assert!(second.local_ip.is_loopback());
    }
}
