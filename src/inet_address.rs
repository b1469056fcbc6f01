use std::fmt;
use std::io;
use std::mem;
use std::net::Ipv4Addr;

use libc::{self, sa_family_t};

/// An IPv4 endpoint: host address plus port.
///
/// Stored as a ready-to-use `sockaddr_in` so it can be handed to `bind(2)`
/// and friends without conversion.
#[derive(Copy, Clone)]
pub struct InetAddress {
    addr: libc::sockaddr_in,
}

impl InetAddress {
    /// Builds an address from a dotted-quad host string and a port.
    ///
    /// # Examples
    ///
    /// ```
    /// use hive_io::InetAddress;
    ///
    /// let addr = InetAddress::new("127.0.0.1", 8000).unwrap();
    /// assert_eq!(addr.ip_port(), "127.0.0.1:8000");
    /// ```
    pub fn new(ip: &str, port: u16) -> io::Result<InetAddress> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPv4 address"))?;

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        };

        Ok(InetAddress { addr })
    }

    pub(crate) fn from_sockaddr_in(addr: libc::sockaddr_in) -> InetAddress {
        InetAddress { addr }
    }

    pub(crate) fn as_sockaddr_in(&self) -> &libc::sockaddr_in {
        &self.addr
    }

    /// The host part, rendered as a dotted quad.
    pub fn ip(&self) -> String {
        Ipv4Addr::from(u32::from_be(self.addr.sin_addr.s_addr)).to_string()
    }

    /// The port in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    /// `ip:port`, the form connection names and logs use.
    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }
}

impl Default for InetAddress {
    fn default() -> InetAddress {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as sa_family_t;
        InetAddress { addr }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.ip(), self.port())
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "InetAddress({})", self)
    }
}

#[cfg(test)]
mod test {
    use super::InetAddress;

    #[test]
    fn round_trip() {
        let addr = InetAddress::new("192.168.1.20", 65535).unwrap();
        assert_eq!(addr.ip(), "192.168.1.20");
        assert_eq!(addr.port(), 65535);
        assert_eq!(addr.ip_port(), "192.168.1.20:65535");
        assert_eq!(addr.to_string(), "192.168.1.20:65535");
    }

    #[test]
    fn rejects_garbage() {
        assert!(InetAddress::new("not-an-ip", 80).is_err());
        assert!(InetAddress::new("::1", 80).is_err());
    }

    #[test]
    fn default_is_any() {
        let addr = InetAddress::default();
        assert_eq!(addr.ip_port(), "0.0.0.0:0");
    }
}
