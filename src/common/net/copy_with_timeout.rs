use futures_util::ready;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

struct CopyWithTimeout<'a, R: ?Sized, W: ?Sized> {
    reader: &'a mut R,
    read_done: bool,
    writer: &'a mut W,
    pos: usize,
    cap: usize,
    amt: u64,
    timeout: Duration,
    delay: Pin<Box<Sleep>>,
    buf: Box<[u8]>,
}

/// Copy `reader` into `writer` until EOF, failing with `TimedOut` when no
/// byte moves in either direction for `timeout`. The deadline is pushed
/// forward on every successful read or write, so a slow-but-alive peer is
/// never killed; only a fully idle one is.
pub async fn copy_with_timeout<'a, R, W>(
    reader: &'a mut R,
    writer: &'a mut W,
    timeout: Duration,
    buf_capacity: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    CopyWithTimeout {
        reader,
        read_done: false,
        writer,
        pos: 0,
        cap: 0,
        amt: 0,
        timeout,
        delay: Box::pin(sleep(timeout)),
        buf: vec![0; buf_capacity].into_boxed_slice(),
    }
    .await
}

impl<R, W> Future for CopyWithTimeout<'_, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        loop {
            // If our buffer is empty, then we need to read some data to
            // continue.
            if self.pos == self.cap && !self.read_done {
                let me = &mut *self;
                let mut buf = ReadBuf::new(&mut me.buf);
                match Pin::new(&mut *me.reader).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) => {
                        let n = buf.filled().len();
                        if n == 0 {
                            me.read_done = true;
                        } else {
                            me.pos = 0;
                            me.cap = n;
                            let deadline = Instant::now() + me.timeout;
                            me.delay.as_mut().reset(deadline);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        ready!(me.delay.as_mut().poll(cx));
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "relay idle timeout",
                        )));
                    }
                }
            }

            // If our buffer has some data, let's write it out!
            while self.pos < self.cap {
                let me = &mut *self;
                match Pin::new(&mut *me.writer).poll_write(cx, &me.buf[me.pos..me.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero byte into writer",
                        )));
                    }
                    Poll::Ready(Ok(i)) => {
                        me.pos += i;
                        me.amt += i as u64;
                        let deadline = Instant::now() + me.timeout;
                        me.delay.as_mut().reset(deadline);
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        ready!(me.delay.as_mut().poll(cx));
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "relay idle timeout",
                        )));
                    }
                }
            }

            // If we've written all the data and we've seen EOF, flush out the
            // data and finish the transfer.
            if self.pos == self.cap && self.read_done {
                let me = &mut *self;
                ready!(Pin::new(&mut *me.writer).poll_flush(cx))?;
                return Poll::Ready(Ok(me.amt));
            }
        }
    }
}
