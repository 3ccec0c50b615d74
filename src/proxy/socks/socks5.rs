use crate::common::net::copy_with_timeout;
use crate::common::{HW_BUFFER_SIZE, LW_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::proxy::socks::{response_code, socks_command, RESERVED, SOCKS_VERSION};
use crate::proxy::tunnel::{open_tunnel, CipherStream};
use crate::proxy::{Address, ProxyContext};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

static CONNECTIONS: AtomicU64 = AtomicU64::new(0);

// The bind address in the CONNECT reply is a placeholder, the tunnel is
// transparent. 2222 can be any number between 1 and 65535.
const CONNECT_REPLY: [u8; 10] = [
    SOCKS_VERSION,
    response_code::SUCCESS,
    RESERVED,
    Address::ADDR_TYPE_IPV4,
    0,
    0,
    0,
    0,
    0x08,
    0xae,
];

enum Socks5Request {
    Connect { dest: Address, header_len: usize },
    UdpAssociate { dest: Address },
    Unsupported { cmd: u8 },
}

fn parse_request(data: &[u8]) -> Result<Socks5Request> {
    if data.len() < 4 {
        return Err(Error::Protocol("truncated socks5 request".into()));
    }
    if data[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "socks version {:#x} is not supported",
            data[0]
        )));
    }
    let cmd = data[1];
    if cmd != socks_command::CONNECT && cmd != socks_command::UDP_ASSOSIATE {
        return Ok(Socks5Request::Unsupported { cmd });
    }
    let mut cur = Cursor::new(&data[3..]);
    let dest = Address::read_from_cursor(&mut cur)?;
    let header_len = 3 + cur.position() as usize;
    Ok(if cmd == socks_command::CONNECT {
        Socks5Request::Connect { dest, header_len }
    } else {
        Socks5Request::UdpAssociate { dest }
    })
}

/// Serves one accepted SOCKS5 client connection to completion. Any
/// protocol or network failure tears down both legs; the idle timeout is
/// a normal close.
pub async fn serve_socks5(mut connection: TcpStream, ctx: Arc<ProxyContext>) -> io::Result<()> {
    debug!("connections: {}", CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1);
    let res = handle_socks5(&mut connection, &ctx).await;
    debug!("connections: {}", CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1);
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            // idle timeout is a normal close, both legs are simply dropped
            debug!("connection timed out");
            Ok(())
        }
        Err(e) => {
            warn!("local error: {}", e);
            Ok(())
        }
    }
}

async fn handle_socks5(connection: &mut TcpStream, ctx: &ProxyContext) -> io::Result<()> {
    let idle = ctx.timeout;

    // Method selection: the content does not matter, every client gets
    // the no-auth acceptance.
    let mut buf = BytesMut::with_capacity(LW_BUFFER_SIZE);
    if read_some(connection, &mut buf, idle).await? == 0 {
        return Ok(());
    }
    connection.write_all(&[SOCKS_VERSION, 0x00]).await?;
    debug!("stage = 1");

    buf.clear();
    if read_some(connection, &mut buf, idle).await? == 0 {
        return Ok(());
    }
    match parse_request(&buf).map_err(io::Error::from)? {
        Socks5Request::Unsupported { cmd } => {
            warn!("unsupported cmd: {:#x}", cmd);
            connection
                .write_all(&[
                    SOCKS_VERSION,
                    response_code::COMMAND_NOT_SUPPORTED,
                    RESERVED,
                    Address::ADDR_TYPE_IPV4,
                ])
                .await?;
            connection.shutdown().await
        }
        Socks5Request::UdpAssociate { dest } => {
            udp_associate(connection, &dest, idle).await
        }
        Socks5Request::Connect { dest, header_len } => {
            connection.write_all(&CONNECT_REPLY).await?;
            let mut tunnel = open_tunnel(ctx).await?;
            // Destination header exactly as parsed, re-encrypted, then
            // whatever payload arrived pipelined behind the request.
            let mut head = BytesMut::with_capacity(dest.serialized_len());
            dest.write_to_buf(&mut head);
            tunnel.write_all(&head).await?;
            if buf.len() > header_len {
                tunnel.write_all(&buf[header_len..]).await?;
            }
            debug!("stage = 5");
            relay_streaming(connection, tunnel, idle).await
        }
    }
}

/// Acknowledges UDP ASSOCIATE and parks the TCP connection; closing it
/// ends the association. Datagrams never flow here, they ride the UDP
/// relay out of band.
async fn udp_associate(
    connection: &mut TcpStream,
    dest: &Address,
    idle: Duration,
) -> io::Result<()> {
    let local: SocketAddr = connection.local_addr()?;
    info!("UDP associate for {:?} on {}", dest, local);
    let mut reply = BytesMut::with_capacity(10);
    reply.put_slice(&[
        SOCKS_VERSION,
        response_code::SUCCESS,
        RESERVED,
        Address::ADDR_TYPE_IPV4,
    ]);
    match local {
        SocketAddr::V4(v4) => reply.put_slice(&v4.ip().octets()),
        SocketAddr::V6(_) => reply.put_slice(&[0u8; 4]),
    }
    reply.put_u16(local.port());
    connection.write_all(&reply).await?;
    debug!("stage = 10");
    let mut sink = [0u8; 0x10];
    loop {
        let n = timeout(idle, connection.read(&mut sink))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "udp association idle"))??;
        if n == 0 {
            return Ok(());
        }
    }
}

async fn read_some(
    connection: &mut TcpStream,
    buf: &mut BytesMut,
    idle: Duration,
) -> io::Result<usize> {
    timeout(idle, connection.read_buf(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socks5 handshake idle"))?
}

async fn relay_streaming(
    connection: &mut TcpStream,
    tunnel: CipherStream<TcpStream>,
    idle: Duration,
) -> io::Result<()> {
    let (mut client_r, mut client_w) = connection.split();
    let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel);
    let upload = async {
        let n = copy_with_timeout(&mut client_r, &mut tunnel_w, idle, HW_BUFFER_SIZE).await?;
        // client hit EOF, half-close the tunnel leg
        tunnel_w.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    let download = async {
        let n = copy_with_timeout(&mut tunnel_r, &mut client_w, idle, HW_BUFFER_SIZE).await?;
        client_w.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    let (up, down) = tokio::try_join!(upload, download)?;
    debug!("uploaded bytes:{}, downloaded bytes:{}", up, down);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt_all, CipherKind, CryptoContext, Encryptor};
    use tokio::net::TcpListener;

    fn test_context(server: SocketAddr) -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            crypto: CryptoContext::new_shared(),
            password: "e2e-pass".to_string(),
            method: Some(CipherKind::Aes128Cfb),
            server_hosts: vec![server.ip().to_string()],
            server_ports: vec![server.port()],
            timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_connect_end_to_end() -> io::Result<()> {
        let remote_listener = TcpListener::bind("127.0.0.1:0").await?;
        let remote_addr = remote_listener.local_addr()?;
        let ctx = test_context(remote_addr);

        // Stands in for the tunnel endpoint: collect iv + header +
        // payload, check the plaintext, answer through the same framing.
        let remote_ctx = ctx.clone();
        let remote = tokio::spawn(async move {
            let (mut stream, _) = remote_listener.accept().await?;
            let iv_len = CipherKind::Aes128Cfb.iv_len();
            let expected = iv_len + 7 + 5;
            let mut wire = vec![0u8; expected];
            stream.read_exact(&mut wire).await?;

            let mut dec =
                Encryptor::new(&remote_ctx.crypto, &remote_ctx.password, remote_ctx.method)
                    .unwrap();
            let plain = dec.decrypt(&wire).unwrap();
            assert_eq!(&plain[..7], &[1, 93, 184, 216, 34, 0, 80]);
            assert_eq!(&plain[7..], b"hello");

            let mut enc =
                Encryptor::new(&remote_ctx.crypto, &remote_ctx.password, remote_ctx.method)
                    .unwrap();
            stream.write_all(&enc.encrypt(b"world")).await?;
            Ok::<(), io::Error>(())
        });

        let local_listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = local_listener.local_addr()?;
        let serve_ctx = ctx.clone();
        tokio::spawn(async move {
            let (stream, _) = local_listener.accept().await.unwrap();
            let _ = serve_socks5(stream, serve_ctx).await;
        });

        let mut client = TcpStream::connect(local_addr).await?;
        client.write_all(&[5, 1, 0]).await?;
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await?;
        assert_eq!(greeting, [5, 0]);

        // CONNECT 93.184.216.34:80 with the first payload pipelined
        let mut request = vec![5, 1, 0, 1, 93, 184, 216, 34, 0, 80];
        request.extend_from_slice(b"hello");
        client.write_all(&request).await?;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0x08, 0xae]);

        let mut answer = [0u8; 5];
        client.read_exact(&mut answer).await?;
        assert_eq!(&answer, b"world");

        remote.await.unwrap()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_command_reply() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let ctx = test_context("127.0.0.1:1".parse().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_socks5(stream, ctx).await;
        });

        let mut client = TcpStream::connect(local_addr).await?;
        client.write_all(&[5, 1, 0]).await?;
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await?;
        // BIND is not supported
        client
            .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await?;
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply, [5, 7, 0, 1]);
        Ok(())
    }

    #[test]
    fn test_parse_request_variants() {
        match parse_request(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80, b'x']).unwrap() {
            Socks5Request::Connect { dest, header_len } => {
                assert_eq!(header_len, 10);
                assert_eq!(
                    dest,
                    Address::SocketAddress("127.0.0.1:80".parse().unwrap())
                );
            }
            _ => panic!("expected connect"),
        }
        assert!(matches!(
            parse_request(&[5, 2, 0, 1, 1, 2, 3, 4, 0, 80]).unwrap(),
            Socks5Request::Unsupported { cmd: 2 }
        ));
        assert!(parse_request(&[5, 1, 0]).is_err());
        assert!(parse_request(&[4, 1, 0, 1, 1, 2, 3, 4, 0, 80]).is_err());
        // ATYP 2 does not exist
        assert!(parse_request(&[5, 1, 0, 2, 1, 2, 3, 4, 0, 80]).is_err());
    }
}
