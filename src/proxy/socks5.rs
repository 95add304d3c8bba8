//! SOCKS5 negotiation for the local listener (RFC 1928).
//!
//! Only the no-authentication method and the CONNECT command are offered.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply: request granted.
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// Reply: general failure.
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
/// Reply: host unreachable.
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
/// Reply: command not supported.
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
/// Reply: address type not supported.
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Destination named in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal address
    Ip(SocketAddr),
    /// Host name still to be resolved
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => addr.fmt(f),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command byte
    pub command: u8,
    /// Destination
    pub target: TargetAddr,
}

/// Answer the client's greeting with "no authentication".
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::socks5(format!("unsupported version {:#04x}", header[0])));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        let _ = stream.write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE]).await;
        Err(Error::socks5("no acceptable authentication method"))
    }
}

/// Read the request that follows negotiation.
///
/// An unknown address type is answered with the matching reply before the
/// error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::socks5(format!("unsupported version {:#04x}", header[0])));
    }

    let command = header[1];
    let target = match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([buf[4], buf[5]])))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(domain)
                .map_err(|_| Error::socks5("domain name is not valid UTF-8"))?;
            TargetAddr::Domain(host, port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        atyp => {
            send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(Error::socks5(format!("unsupported address type {:#04x}", atyp)));
        }
    };

    Ok(Request { command, target })
}

/// Negotiate and read a CONNECT request, refusing any other command.
pub async fn accept<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream).await?;
    let request = read_request(stream).await?;
    if request.command != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(Error::socks5(format!("unsupported command {:#04x}", request.command)));
    }
    Ok(request.target)
}

/// Send a reply with an unspecified bind address.
pub async fn send_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, reply, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// The IPv4 address a target stands for.
///
/// Domains are looked up locally and the first IPv4 result is used.
pub async fn resolve_ipv4(target: &TargetAddr) -> Result<SocketAddr> {
    match target {
        TargetAddr::Ip(addr @ SocketAddr::V4(_)) => Ok(*addr),
        TargetAddr::Ip(addr) => Err(Error::socks5(format!("{} is not an IPv4 address", addr))),
        TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::socks5(format!("{} has no IPv4 address", host))),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0, 80])
            .await
            .unwrap();

        let target = accept(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Ip("93.184.216.34:80".parse().unwrap()));

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let (mut client, mut server) = duplex(256);
        let mut bytes = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 9];
        bytes.extend_from_slice(b"localhost");
        bytes.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&bytes).await.unwrap();

        let target = accept(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("localhost".into(), 8080));
        assert_eq!(target.to_string(), "localhost:8080");
    }

    #[tokio::test]
    async fn test_refuses_auth_only_clients() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(matches!(accept(&mut server).await, Err(Error::Socks5(_))));
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_unsupported_command_gets_reply() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0, 53])
            .await
            .unwrap();

        assert!(accept(&mut server).await.is_err());
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2..4], [0x05, REPLY_COMMAND_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_unsupported_address_type_gets_reply() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x09])
            .await
            .unwrap();

        assert!(accept(&mut server).await.is_err());
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2..4], [0x05, REPLY_ADDRESS_TYPE_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_resolve_ipv4() {
        let literal = TargetAddr::Ip("10.0.0.1:22".parse().unwrap());
        assert_eq!(resolve_ipv4(&literal).await.unwrap(), "10.0.0.1:22".parse().unwrap());

        let v6 = TargetAddr::Ip("[::1]:22".parse().unwrap());
        assert!(resolve_ipv4(&v6).await.is_err());

        let local = TargetAddr::Domain("127.0.0.1".into(), 9);
        assert_eq!(resolve_ipv4(&local).await.unwrap(), "127.0.0.1:9".parse().unwrap());
    }
}
