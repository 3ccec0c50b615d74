use crate::common::new_error;
use crate::crypto::Encryptor;
use crate::proxy::ProxyContext;
use log::info;
use std::io;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub use crypto_io::CipherStream;

pub mod crypto_io;

/// Connects to one tunnel endpoint and wraps the connection with the
/// per-connection cipher state. Nagle is disabled on the tunnel leg so
/// small handshake writes go out immediately.
pub async fn open_tunnel(ctx: &ProxyContext) -> io::Result<CipherStream<TcpStream>> {
    let server = ctx.pick_server();
    info!("connecting {}", server);
    let stream = timeout(ctx.timeout, server.connect_tcp())
        .await
        .map_err(|_| new_error(format!("connect to {} timed out", server)))??;
    stream.set_nodelay(true)?;
    let encryptor = Encryptor::new(&ctx.crypto, &ctx.password, ctx.method)?;
    Ok(CipherStream::new(stream, encryptor))
}
