//! UDP relay with NAT-style per-flow sessions.
//!
//! Each flow `(sender, destination)` owns one ephemeral outbound socket,
//! cached with idle eviction. The local role fronts SOCKS5 UDP clients
//! and speaks the encrypted relay framing towards the tunnel endpoint;
//! the remote role is the other end of that framing.

use crate::common::cache::TimedCache;
use crate::common::MAX_DATAGRAM_SIZE;
use crate::crypto::{decrypt_all, encrypt_all};
use crate::debug_log;
use crate::proxy::{Address, ProxyContext};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

/// How often idle sessions are collected, independent of the configured
/// idle timeout.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy)]
pub enum UdpRelayRole {
    /// Fronts the SOCKS5 UDP client, encrypts towards the tunnel.
    Local,
    /// Fronts the encrypted tunnel, forwards to real destinations.
    Remote,
}

pub struct UdpRelay {
    role: UdpRelayRole,
    ctx: Arc<ProxyContext>,
    listen_addr: Option<IpAddr>,
    listen_port: u16,
    sweep_interval: Duration,
}

impl UdpRelay {
    pub fn new(
        role: UdpRelayRole,
        ctx: Arc<ProxyContext>,
        listen_addr: Option<IpAddr>,
        listen_port: u16,
    ) -> UdpRelay {
        UdpRelay {
            role,
            ctx,
            listen_addr,
            listen_port,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Binds the listeners and spawns one relay loop per address family.
    /// With no pinned address both wildcard families are tried; the v4
    /// listener is mandatory, v6 is best effort.
    pub async fn start(self) -> io::Result<Vec<JoinHandle<io::Result<()>>>> {
        let remote = match self.role {
            UdpRelayRole::Local => Some(self.ctx.pick_server().resolve().await?),
            UdpRelayRole::Remote => None,
        };
        let sockets = match self.listen_addr {
            None => {
                let mut sockets =
                    vec![UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.listen_port)).await?];
                match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, self.listen_port)).await {
                    Ok(s) => sockets.push(s),
                    Err(e) => warn!("udp6 listener unavailable: {}", e),
                }
                sockets
            }
            Some(ip) => vec![UdpSocket::bind((ip, self.listen_port)).await?],
        };
        let mut handles = Vec::with_capacity(sockets.len());
        for socket in sockets {
            info!("UDP relay listening on {}", socket.local_addr()?);
            let ctx = self.ctx.clone();
            let sweep = self.sweep_interval;
            let handle = match remote {
                Some(remote) => tokio::spawn(run_local(socket, remote, ctx, sweep)),
                None => tokio::spawn(run_remote(socket, ctx, sweep)),
            };
            handles.push(handle);
        }
        Ok(handles)
    }
}

type SessionKey = (SocketAddr, Address);

#[derive(Clone)]
struct UdpSession {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    reader: Arc<JoinHandle<()>>,
}

impl UdpSession {
    fn close(&self) {
        self.reader.abort();
    }
}

fn session_cache(timeout: Duration, sweep: Duration) -> TimedCache<SessionKey, UdpSession> {
    TimedCache::new(timeout, sweep, |key: &SessionKey, session: UdpSession| {
        debug!("UDP session {:?} expired", key);
        session.close();
    })
}

async fn bind_for(target: &SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(bind_addr).await
}

/// Local role: SOCKS5 UDP datagrams in, relay datagrams out.
pub(crate) async fn run_local(
    socket: UdpSocket,
    remote: SocketAddr,
    ctx: Arc<ProxyContext>,
    sweep_interval: Duration,
) -> io::Result<()> {
    let framed = UdpFramed::new(socket, Socks5UdpCodec);
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::channel::<((Bytes, Address), SocketAddr)>(64);
    let write_handle = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Err(e) = sink.send(item).await {
                warn!("UDP write error: {}", e);
                break;
            }
        }
    });
    let sessions = session_cache(ctx.timeout, sweep_interval);

    while let Some(next) = stream.next().await {
        let ((dest, data), client) = match next {
            Ok(v) => v,
            Err(e) => {
                warn!("dropped inbound datagram: {}", e);
                continue;
            }
        };
        let key = (client, dest.clone());
        let session = match sessions.get(&key) {
            Some(s) => s,
            None => match open_local_session(&key, remote, &ctx, &tx, &sessions).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("dropped datagram for {:?}: {}", dest, e);
                    continue;
                }
            },
        };
        // The relay header rides inside the encrypted payload.
        let mut plain = BytesMut::with_capacity(dest.serialized_len() + data.len());
        dest.write_to_buf(&mut plain);
        plain.extend_from_slice(&data);
        match encrypt_all(&ctx.crypto, &ctx.password, ctx.method, &plain) {
            Ok(wire) => {
                debug_log!("UDP send to {:?} via {}", dest, session.target);
                if let Err(e) = session.socket.send_to(&wire, session.target).await {
                    warn!("UDP send to {} failed: {}", session.target, e);
                }
            }
            Err(e) => warn!("dropped outbound datagram: {}", e),
        }
    }
    write_handle.abort();
    sessions.destroy();
    Ok(())
}

async fn open_local_session(
    key: &SessionKey,
    remote: SocketAddr,
    ctx: &Arc<ProxyContext>,
    tx: &mpsc::Sender<((Bytes, Address), SocketAddr)>,
    sessions: &TimedCache<SessionKey, UdpSession>,
) -> io::Result<UdpSession> {
    let out = Arc::new(bind_for(&remote).await?);
    let client = key.0;
    let reader = {
        let out = out.clone();
        let ctx = ctx.clone();
        let tx = tx.clone();
        let sessions = sessions.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                #[allow(unused_variables)]
                let (n, from) = match out.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("UDP session recv error: {}", e);
                        break;
                    }
                };
                debug_log!("UDP recv {} bytes from {}", n, from);
                let plain = match decrypt_all(&ctx.crypto, &ctx.password, ctx.method, &buf[..n]) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropped return datagram: {}", e);
                        continue;
                    }
                };
                // Reparse the embedded header; it becomes the SOCKS5
                // response's ATYP/DST fields.
                let dest = match Address::read_from_buf(&plain) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("dropped return datagram: {}", e);
                        continue;
                    }
                };
                sessions.get(&key);
                let payload = plain.slice(dest.serialized_len()..);
                if tx.send(((payload, dest), client)).await.is_err() {
                    break;
                }
            }
        })
    };
    let session = UdpSession {
        socket: out,
        target: remote,
        reader: Arc::new(reader),
    };
    sessions.set(key.clone(), session.clone());
    debug_log!("pairs: {}", sessions.len());
    Ok(session)
}

/// Remote role: relay datagrams in, plain forwards to the destination
/// out, responder replies re-framed and encrypted on the way back.
pub(crate) async fn run_remote(
    socket: UdpSocket,
    ctx: Arc<ProxyContext>,
    sweep_interval: Duration,
) -> io::Result<()> {
    let socket = Arc::new(socket);
    let sessions = session_cache(ctx.timeout, sweep_interval);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let plain = match decrypt_all(&ctx.crypto, &ctx.password, ctx.method, &buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropped undecryptable datagram from {}: {}", peer, e);
                continue;
            }
        };
        let dest = match Address::read_from_buf(&plain) {
            Ok(a) => a,
            Err(e) => {
                warn!("dropped datagram from {}: {}", peer, e);
                continue;
            }
        };
        let key = (peer, dest.clone());
        let session = match sessions.get(&key) {
            Some(s) => s,
            None => match open_remote_session(&key, &dest, socket.clone(), &ctx, &sessions).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("dropped datagram for {:?}: {}", dest, e);
                    continue;
                }
            },
        };
        let payload = &plain[dest.serialized_len()..];
        debug_log!("UDP send to {:?}", dest);
        if let Err(e) = session.socket.send_to(payload, session.target).await {
            warn!("UDP send to {:?} failed: {}", dest, e);
        }
    }
}

async fn open_remote_session(
    key: &SessionKey,
    dest: &Address,
    listen: Arc<UdpSocket>,
    ctx: &Arc<ProxyContext>,
    sessions: &TimedCache<SessionKey, UdpSession>,
) -> io::Result<UdpSession> {
    let target = dest.resolve().await?;
    let out = Arc::new(bind_for(&target).await?);
    let peer = key.0;
    let reader = {
        let out = out.clone();
        let ctx = ctx.clone();
        let sessions = sessions.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (n, responder) = match out.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("UDP session recv error: {}", e);
                        break;
                    }
                };
                debug_log!("UDP recv from {}", responder);
                let mut plain = BytesMut::with_capacity(1 + 18 + n);
                Address::from(responder).write_to_buf(&mut plain);
                plain.extend_from_slice(&buf[..n]);
                let wire = match encrypt_all(&ctx.crypto, &ctx.password, ctx.method, &plain) {
                    Ok(w) => w,
                    Err(e) => {
                        warn!("dropped reply datagram: {}", e);
                        continue;
                    }
                };
                sessions.get(&key);
                if let Err(e) = listen.send_to(&wire, peer).await {
                    warn!("UDP reply to {} failed: {}", peer, e);
                }
            }
        })
    };
    let session = UdpSession {
        socket: out,
        target,
        reader: Arc::new(reader),
    };
    sessions.set(key.clone(), session.clone());
    debug_log!("pairs: {}", sessions.len());
    Ok(session)
}

/// SOCKS5 UDP request/response header
///
/// ```plain
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
pub struct Socks5UdpCodec;

impl Encoder<(Bytes, Address)> for Socks5UdpCodec {
    type Error = io::Error;

    fn encode(&mut self, item: (Bytes, Address), dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(3 + item.1.serialized_len() + item.0.len());
        dst.put_slice(&[0u8, 0u8, 0u8]);
        item.1.write_to_buf(dst);
        dst.put_slice(&item.0);
        Ok(())
    }
}

impl Decoder for Socks5UdpCodec {
    type Item = (Address, BytesMut);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 3 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram too short for socks5 udp header",
            ));
        }
        if src[2] != 0 {
            // fragmentation is unsupported
            warn!("drop a message since frag is not 0");
            src.clear();
            return Ok(None);
        }
        src.advance(3);
        let dst_addr = Address::read_from_buf(src).map_err(io::Error::from)?;
        src.advance(dst_addr.serialized_len());
        let dst_packet = std::mem::take(src);
        Ok(Some((dst_addr, dst_packet)))
    }
}
