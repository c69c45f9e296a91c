/// 连接抽象与基础装饰器
///
/// 统一的 `Conn` 接口让监听器包装栈、复用流和 TCP 连接可以互换；
/// 装饰器是持有内层连接的小结构体，状态只属于该层
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// 双工字节流接口
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxConn")
    }
}

/// 装箱的连接对象
pub type BoxConn = Box<dyn Conn>;

/// 把探测阶段读出的字节重新放回流头部的包装
///
/// 入口点只允许为获得路由键而窥探数据，窥探到的字节必须原样出现在
/// 被桥接流的开头
pub struct PrependConn<C> {
    inner: C,
    head: Vec<u8>,
    offset: usize,
}

impl<C> PrependConn<C> {
    pub fn new(inner: C, head: Vec<u8>) -> Self {
        Self {
            inner,
            head,
            offset: 0,
        }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for PrependConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.offset < this.head.len() {
            let remaining = &this.head[this.offset..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            this.offset += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for PrependConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 双向搬运字节直到任一方向结束
///
/// 一个方向结束后对另一侧执行半关闭，等待对向也结束或出错
pub async fn bridge<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut ar, &mut bw).await?;
        bw.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let b_to_a = async {
        let n = tokio::io::copy(&mut br, &mut aw).await?;
        aw.shutdown().await?;
        Ok::<_, io::Error>(n)
    };

    tokio::try_join!(a_to_b, b_to_a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepend_conn_reemits_head_first() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b" world").await.unwrap();
        client.flush().await.unwrap();

        let mut wrapped = PrependConn::new(server, b"hello".to_vec());
        let mut buf = vec![0u8; 11];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_prepend_conn_partial_reads() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut wrapped = PrependConn::new(server, b"abcdef".to_vec());

        let mut buf = [0u8; 2];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        let mut buf = [0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cdef");
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let (a_local, a_remote) = tokio::io::duplex(1024);
        let (b_local, b_remote) = tokio::io::duplex(1024);

        let bridge_task = tokio::spawn(bridge(a_remote, b_remote));

        let (mut a, mut b) = (a_local, b_local);
        a.write_all(b"ping").await.unwrap();
        a.shutdown().await.unwrap();

        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        b.write_all(b"pong").await.unwrap();
        b.shutdown().await.unwrap();
        let mut got = [0u8; 4];
        a.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        let (sent, recvd) = bridge_task.await.unwrap().unwrap();
        assert_eq!(sent, 4);
        assert_eq!(recvd, 4);
    }
}
