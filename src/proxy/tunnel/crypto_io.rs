//! IO facade for the encrypted tunnel leg.
//!
//! Stream ciphers are length-preserving, so framing is minimal: the
//! first written chunk is `IV ++ ciphertext`, everything after is
//! ciphertext continuing the same stream. The read side mirrors that by
//! collecting exactly the peer's IV before decrypting in place. The
//! table cipher has no IV and both directions pass straight through the
//! substitution.

use crate::crypto::Encryptor;
use crate::{impl_async_read, impl_async_useful_traits, impl_async_write, impl_flush_shutdown};
use bytes::Bytes;
use futures_util::ready;
use std::cmp;
use std::io::{self, Error, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::HW_BUFFER_SIZE;

/// Largest IV of any supported method.
const MAX_IV_LEN: usize = 16;

enum ReadState {
    /// Collecting the peer's IV from the head of the stream.
    WaitIv { iv: [u8; MAX_IV_LEN], filled: usize },
    Established,
}

pub struct CipherStream<S> {
    stream: S,
    encryptor: Encryptor,
    read_state: ReadState,
    pending: Bytes,
    write_pos: usize,
    write_data_len: usize,
}

impl<S> CipherStream<S> {
    pub fn new(stream: S, encryptor: Encryptor) -> CipherStream<S> {
        let read_state = if encryptor.decrypt_iv_needed() == 0 {
            ReadState::Established
        } else {
            ReadState::WaitIv {
                iv: [0u8; MAX_IV_LEN],
                filled: 0,
            }
        };
        CipherStream {
            stream,
            encryptor,
            read_state,
            pending: Bytes::new(),
            write_pos: 0,
            write_data_len: 0,
        }
    }
}

impl<S> CipherStream<S>
where
    S: AsyncRead + Unpin,
{
    fn priv_poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::WaitIv { iv, filled } => {
                    let need = this.encryptor.decrypt_iv_needed();
                    while *filled < need {
                        let mut iv_buf = ReadBuf::new(&mut iv[*filled..need]);
                        ready!(Pin::new(&mut this.stream).poll_read(cx, &mut iv_buf))?;
                        let n = iv_buf.filled().len();
                        if n == 0 {
                            // nothing at all is a clean close, a partial
                            // iv is a truncated stream
                            if *filled == 0 {
                                return Poll::Ready(Ok(()));
                            }
                            return Err(ErrorKind::UnexpectedEof.into()).into();
                        }
                        *filled += n;
                    }
                    this.encryptor
                        .begin_decrypt(&iv[..need])
                        .map_err(io::Error::from)?;
                    this.read_state = ReadState::Established;
                }
                ReadState::Established => {
                    let before = dst.filled().len();
                    ready!(Pin::new(&mut this.stream).poll_read(cx, dst))?;
                    let filled = dst.filled_mut();
                    this.encryptor
                        .decrypt_in_place(&mut filled[before..])
                        .map_err(io::Error::from)?;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S> CipherStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn priv_poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_pos >= this.pending.len() {
            // previous ciphertext fully flushed, take the next chunk
            let chunk = &buf[..cmp::min(buf.len(), HW_BUFFER_SIZE)];
            this.pending = this.encryptor.encrypt(chunk);
            this.write_pos = 0;
            this.write_data_len = chunk.len();
        }
        while this.write_pos < this.pending.len() {
            let n = ready!(
                Pin::new(&mut this.stream).poll_write(cx, &this.pending[this.write_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write zero byte into writer",
                )));
            }
            this.write_pos += n;
        }
        Poll::Ready(Ok(this.write_data_len))
    }

    impl_flush_shutdown!();
}

impl_async_useful_traits!(CipherStream);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, CryptoContext};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn round_trip_with(method: Option<CipherKind>) -> io::Result<()> {
        let ctx = CryptoContext::new_shared();
        let (a, b) = duplex(4096);
        let mut left = CipherStream::new(a, Encryptor::new(&ctx, "duplex-pw", method).unwrap());
        let mut right = CipherStream::new(b, Encryptor::new(&ctx, "duplex-pw", method).unwrap());

        left.write_all(b"ping over the tunnel").await?;
        let mut buf = [0u8; 20];
        right.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping over the tunnel");

        right.write_all(b"pong").await?;
        let mut buf = [0u8; 4];
        left.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");

        // later chunks continue the same stream with no extra framing
        left.write_all(b"second").await?;
        left.write_all(b" chunk").await?;
        let mut buf = [0u8; 12];
        right.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"second chunk");
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_cipher_duplex() -> io::Result<()> {
        round_trip_with(Some(CipherKind::Aes128Cfb)).await
    }

    #[tokio::test]
    async fn test_rc4_md5_duplex() -> io::Result<()> {
        round_trip_with(Some(CipherKind::Rc4Md5)).await
    }

    #[tokio::test]
    async fn test_table_duplex() -> io::Result<()> {
        round_trip_with(None).await
    }
}
