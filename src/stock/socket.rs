use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UnixStream},
};

use super::{ChildSocketBuilder, Lease, TcpStockBuilder};

/// 协议客户端拿到的套接字租约: 统一 TCP 池/子进程 Unix 池/裸连接,
/// 客户端用完必须带复用提示归还一次, 直接丢弃等于 reuse=false.
pub enum SocketLease {
    Tcp(Lease<TcpStockBuilder>),
    Unix(Lease<ChildSocketBuilder>),
    /// 不入池的一次性连接, 测试与管道后端用
    RawTcp(TcpStream),
    RawUnix(UnixStream),
}

impl SocketLease {
    pub fn release(self, reuse: bool) {
        match self {
            SocketLease::Tcp(lease) => lease.release(reuse),
            SocketLease::Unix(lease) => lease.release(reuse),
            SocketLease::RawTcp(_) | SocketLease::RawUnix(_) => {}
        }
    }
}

impl AsyncRead for SocketLease {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketLease::Tcp(lease) => Pin::new(&mut **lease).poll_read(cx, buf),
            SocketLease::Unix(lease) => Pin::new(&mut **lease).poll_read(cx, buf),
            SocketLease::RawTcp(io) => Pin::new(io).poll_read(cx, buf),
            SocketLease::RawUnix(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketLease {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketLease::Tcp(lease) => Pin::new(&mut **lease).poll_write(cx, buf),
            SocketLease::Unix(lease) => Pin::new(&mut **lease).poll_write(cx, buf),
            SocketLease::RawTcp(io) => Pin::new(io).poll_write(cx, buf),
            SocketLease::RawUnix(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketLease::Tcp(lease) => Pin::new(&mut **lease).poll_flush(cx),
            SocketLease::Unix(lease) => Pin::new(&mut **lease).poll_flush(cx),
            SocketLease::RawTcp(io) => Pin::new(io).poll_flush(cx),
            SocketLease::RawUnix(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketLease::Tcp(lease) => Pin::new(&mut **lease).poll_shutdown(cx),
            SocketLease::Unix(lease) => Pin::new(&mut **lease).poll_shutdown(cx),
            SocketLease::RawTcp(io) => Pin::new(io).poll_shutdown(cx),
            SocketLease::RawUnix(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}
