//! Candidate manager endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One manager endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Dial with TLS.
    #[serde(default)]
    pub tls: bool,
    /// `host` or `host:port`; a missing port is filled in by
    /// [`AddressList::format`].
    pub addr: String,
    /// Optional TLS server name overriding the host portion.
    #[serde(default)]
    pub name: Option<String>,
}

impl Address {
    /// Host portion of `addr`, without the port.
    pub fn host(&self) -> &str {
        match split_port(&self.addr) {
            Some(idx) => &self.addr[..idx],
            None => &self.addr,
        }
    }

    /// Name presented to the peer: the explicit server name when set, the
    /// host portion otherwise.
    pub fn host_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => self.host(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}", self.addr)?;
        if let Some(name) = &self.name {
            if self.tls && !name.is_empty() {
                write!(f, ", servername: {name}")?;
            }
        }
        Ok(())
    }
}

/// Ordered list of manager endpoints, tried round-robin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList(Vec<Address>);

impl AddressList {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self(addresses)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Address> {
        self.0.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }

    /// Fill in the default port for entries without an explicit one: 443
    /// with TLS, 80 otherwise. Idempotent - entries that already carry a
    /// port are left untouched.
    pub fn format(&mut self) {
        for address in &mut self.0 {
            if split_port(&address.addr).is_some() {
                continue;
            }
            let port = if address.tls { 443 } else { 80 };
            address.addr = format!("{}:{port}", address.addr);
        }
    }
}

impl From<Vec<Address>> for AddressList {
    fn from(addresses: Vec<Address>) -> Self {
        Self::new(addresses)
    }
}

/// Index of the `:` starting an explicit port suffix, if any.
fn split_port(addr: &str) -> Option<usize> {
    let idx = addr.rfind(':')?;
    let port = &addr[idx + 1..];
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // a bare IPv6 address is not a host:port pair
    if addr[..idx].ends_with(':') {
        return None;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(tls: bool, addr: &str) -> Address {
        Address {
            tls,
            addr: addr.to_string(),
            name: None,
        }
    }

    #[test]
    fn format_fills_default_ports_by_tls_flag() {
        let mut list = AddressList::new(vec![
            address(true, "manager.example"),
            address(false, "manager.example"),
        ]);
        list.format();

        assert_eq!(list.get(0).unwrap().addr, "manager.example:443");
        assert_eq!(list.get(1).unwrap().addr, "manager.example:80");
    }

    #[test]
    fn format_keeps_explicit_ports() {
        let mut list = AddressList::new(vec![
            address(true, "manager.example:9443"),
            address(false, "10.1.2.3:8080"),
        ]);
        list.format();

        assert_eq!(list.get(0).unwrap().addr, "manager.example:9443");
        assert_eq!(list.get(1).unwrap().addr, "10.1.2.3:8080");
    }

    #[test]
    fn format_is_idempotent() {
        let mut once = AddressList::new(vec![
            address(true, "manager.example"),
            address(false, "10.1.2.3:8080"),
            address(true, "[::1]"),
        ]);
        once.format();
        let mut twice = once.clone();
        twice.format();

        assert_eq!(once, twice);
        assert_eq!(once.get(2).unwrap().addr, "[::1]:443");
    }

    #[test]
    fn host_strips_the_port() {
        assert_eq!(address(false, "manager.example:80").host(), "manager.example");
        assert_eq!(address(false, "manager.example").host(), "manager.example");
    }

    #[test]
    fn host_name_prefers_the_explicit_server_name() {
        let mut addr = address(true, "10.1.2.3:443");
        addr.name = Some("manager.example".to_string());
        assert_eq!(addr.host_name(), "manager.example");

        addr.name = None;
        assert_eq!(addr.host_name(), "10.1.2.3");
    }

    #[test]
    fn display_shows_scheme_and_server_name() {
        let mut addr = address(true, "10.1.2.3:443");
        addr.name = Some("manager.example".to_string());
        assert_eq!(addr.to_string(), "tls://10.1.2.3:443, servername: manager.example");
        assert_eq!(
            address(false, "10.1.2.3:80").to_string(),
            "tcp://10.1.2.3:80"
        );
    }
}
