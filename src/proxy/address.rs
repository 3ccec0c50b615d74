use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::net::{lookup_host, TcpStream};

/// Destination carried by the SOCKS5 request and by the relay address
/// header: `ATYP [LEN] ADDR PORT`, port big-endian.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Socket address (IP Address)
    SocketAddress(SocketAddr),
    /// Domain name address and port
    DomainNameAddress(String, u16),
}

impl Address {
    pub const ADDR_TYPE_IPV4: u8 = 1;
    pub const ADDR_TYPE_DOMAIN_NAME: u8 = 3;
    pub const ADDR_TYPE_IPV6: u8 = 4;

    /// Wire length of the serialized header: `ATYP [LEN] ADDR PORT`.
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 8 * 2 + 2,
            Address::DomainNameAddress(ref dmname, _) => 1 + 1 + dmname.len() + 2,
        }
    }

    pub fn read_from_cursor<A: AsRef<[u8]>>(cur: &mut Cursor<A>) -> Result<Address> {
        if cur.remaining() < 1 + 1 {
            return Err(Error::Protocol("address buffer too short".into()));
        }
        let addr_type = cur.get_u8();
        match addr_type {
            Self::ADDR_TYPE_IPV4 => {
                if cur.remaining() < 4 + 2 {
                    return Err(Error::Protocol("IPv4 address too short".into()));
                }
                let addr = Ipv4Addr::new(cur.get_u8(), cur.get_u8(), cur.get_u8(), cur.get_u8());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(
                    addr, port,
                ))))
            }
            Self::ADDR_TYPE_DOMAIN_NAME => {
                let domain_len = cur.get_u8() as usize;
                if cur.remaining() < domain_len + 2 {
                    return Err(Error::Protocol("domain name too short".into()));
                }
                let mut domain_name = vec![0u8; domain_len];
                cur.copy_to_slice(&mut domain_name);
                let port = cur.get_u16();
                let domain_name = String::from_utf8(domain_name)
                    .map_err(|e| Error::Protocol(format!("invalid utf8 domain name {}", e)))?;
                Ok(Address::DomainNameAddress(domain_name, port))
            }
            Self::ADDR_TYPE_IPV6 => {
                if cur.remaining() < 8 * 2 + 2 {
                    return Err(Error::Protocol("IPv6 address too short".into()));
                }
                let addr = Ipv6Addr::new(
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                    cur.get_u16(),
                );
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    addr, port, 0, 0,
                ))))
            }
            _ => Err(Error::Protocol(format!(
                "unsupported address type {:#x}",
                addr_type
            ))),
        }
    }

    pub fn read_from_buf(buf: &[u8]) -> Result<Address> {
        let mut cur = Cursor::new(buf);
        Address::read_from_cursor(&mut cur)
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::SocketAddress(SocketAddr::V4(addr)) => {
                buf.put_u8(Self::ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::SocketAddress(SocketAddr::V6(addr)) => {
                buf.put_u8(Self::ADDR_TYPE_IPV6);
                for seg in &addr.ip().segments() {
                    buf.put_u16(*seg);
                }
                buf.put_u16(addr.port());
            }
            Self::DomainNameAddress(domain_name, port) => {
                buf.put_u8(Self::ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(domain_name.len() as u8);
                buf.put_slice(&domain_name.as_bytes()[..]);
                buf.put_u16(*port);
            }
        }
    }

    /// Parses a configured endpoint. An embedded `"host:port"` overrides
    /// `default_port`; bare hosts (IP or domain) use it.
    pub fn from_host_port(host: &str, default_port: u16) -> Address {
        if let Ok(sa) = host.parse::<SocketAddr>() {
            return Address::SocketAddress(sa);
        }
        if let Some((h, p)) = host.rsplit_once(':') {
            // A second ':' in the head means a bare IPv6 literal, not an
            // embedded port.
            if !h.contains(':') {
                if let Ok(port) = p.parse::<u16>() {
                    return match h.parse::<IpAddr>() {
                        Ok(ip) => Address::SocketAddress(SocketAddr::new(ip, port)),
                        Err(_) => Address::DomainNameAddress(h.to_owned(), port),
                    };
                }
            }
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::SocketAddress(SocketAddr::new(ip, default_port)),
            Err(_) => Address::DomainNameAddress(host.to_owned(), default_port),
        }
    }

    pub async fn connect_tcp(&self) -> io::Result<TcpStream> {
        match self {
            Address::SocketAddress(addr) => TcpStream::connect(addr).await,
            Address::DomainNameAddress(host, port) => {
                TcpStream::connect((host.as_str(), *port)).await
            }
        }
    }

    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Address::SocketAddress(addr) => Ok(*addr),
            Address::DomainNameAddress(host, port) => {
                let mut addrs = lookup_host((host.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Other,
                        format!("no valid addr after lookup_host for {}", host),
                    )
                })
            }
        }
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{}", addr),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{}:{}", addr, port),
        }
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{}", addr),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{}:{}", addr, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_parse_ipv4_header() {
        let addr = Address::read_from_buf(&[0x01, 127, 0, 0, 1, 0x00, 0x50]).unwrap();
        assert_eq!(
            addr,
            Address::SocketAddress("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(addr.serialized_len(), 7);
    }

    #[test]
    fn test_domain_header_round_trip() {
        let addr = Address::DomainNameAddress("example.com".to_owned(), 443);
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());
        assert_eq!(buf[0], Address::ADDR_TYPE_DOMAIN_NAME);
        assert_eq!(buf[1] as usize, "example.com".len());
        let parsed = Address::read_from_buf(&buf).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_ipv6_header_round_trip() {
        let addr = Address::SocketAddress("[2001:db8::1]:8388".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), 19);
        assert_eq!(Address::read_from_buf(&buf).unwrap(), addr);
    }

    #[test]
    fn test_unknown_atyp_is_rejected() {
        assert!(Address::read_from_buf(&[0x05, 1, 2, 3, 4, 0, 80]).is_err());
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        assert!(Address::read_from_buf(&[0x01, 127, 0]).is_err());
        assert!(Address::read_from_buf(&[0x03, 10, b'a', b'b']).is_err());
    }

    #[test]
    fn test_from_host_port() {
        assert_eq!(
            Address::from_host_port("1.2.3.4", 8388),
            Address::SocketAddress("1.2.3.4:8388".parse().unwrap())
        );
        assert_eq!(
            Address::from_host_port("1.2.3.4:9000", 8388),
            Address::SocketAddress("1.2.3.4:9000".parse().unwrap())
        );
        assert_eq!(
            Address::from_host_port("relay.example.com:9000", 8388),
            Address::DomainNameAddress("relay.example.com".to_owned(), 9000)
        );
        assert_eq!(
            Address::from_host_port("::1", 8388),
            Address::SocketAddress(SocketAddr::new("::1".parse::<IpAddr>().unwrap(), 8388))
        );
    }
}
