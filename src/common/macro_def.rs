#[macro_export]
macro_rules! md5 {
    ($($x:expr),*) => {{
        use md5::{Md5, Digest};
        let mut digest = Md5::new();
        $(digest.update($x);)*
        let res:[u8;16]=digest.finalize().into();
        res
    }}
}

#[macro_export]
macro_rules! impl_async_write {
    ($name:tt) => {
        impl<S> AsyncWrite for $name<S>
        where
            S: AsyncWrite + Unpin,
        {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<Result<usize, Error>> {
                self.priv_poll_write(cx, buf)
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
                self.priv_poll_flush(cx)
            }

            fn poll_shutdown(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
            ) -> Poll<Result<(), Error>> {
                self.priv_poll_shutdown(cx)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_async_read {
    ($name:tt) => {
        impl<S> AsyncRead for $name<S>
        where
            S: AsyncRead + Unpin,
        {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                self.priv_poll_read(cx, buf)
            }
        }
    };
}

#[macro_export]
macro_rules! impl_async_useful_traits {
    ($name:tt) => {
        impl_async_read!($name);
        impl_async_write!($name);
    };
}

#[macro_export]
macro_rules! impl_flush_shutdown {
    () => {
        fn priv_poll_flush(
            mut self: Pin<&mut Self>,
            ctx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            AsyncWrite::poll_flush(Pin::new(&mut self.stream), ctx)
        }

        fn priv_poll_shutdown(
            mut self: Pin<&mut Self>,
            ctx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            AsyncWrite::poll_shutdown(Pin::new(&mut self.stream), ctx)
        }
    };
}
