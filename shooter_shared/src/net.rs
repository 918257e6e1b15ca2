//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable (TCP) channel carrying length-prefixed frames.
//! - Let the server split a connection into independent read and write
//!   halves, each driven by its own task.
//!
//! Frame bodies are opaque here; see `protocol` for what goes inside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

/// Largest frame either end accepts.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connection on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

fn encode_frame_header(payload: &[u8]) -> anyhow::Result<BytesMut> {
    if payload.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds {MAX_FRAME_BYTES}", payload.len());
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("tcp read len"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        bail!("peer sent frame of {len} bytes, limit is {MAX_FRAME_BYTES}");
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Some(Bytes::from(payload)))
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let buf = encode_frame_header(frame)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    /// Waits for the next frame. Errors if the peer closed the connection.
    pub async fn recv(&mut self) -> anyhow::Result<Bytes> {
        read_frame(&mut self.stream)
            .await?
            .context("connection closed by peer")
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into halves that can live in separate tasks.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (FrameReader { half: read }, FrameWriter { half: write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
}

impl FrameReader {
    /// Next frame, or `None` once the peer has closed the stream.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let buf = encode_frame_header(frame)?;
        self.half.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.half.shutdown().await.context("tcp shutdown")
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_split_connection() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let accept = tokio::spawn(async move { listener.accept().await });
        let mut client = ReliableConn::connect(addr).await?;
        let (server, _) = accept.await??;
        let (mut reader, mut writer) = server.into_split();

        client.send(&[1, 2, 3]).await?;
        client.send(&[]).await?;
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(reader.read_frame().await?.as_deref(), Some(&[][..]));

        writer.write_frame(b"pong").await?;
        assert_eq!(&client.recv().await?[..], b"pong");

        drop(client);
        assert_eq!(reader.read_frame().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;
        let accept = tokio::spawn(async move { listener.accept().await });
        let mut client = ReliableConn::connect(addr).await?;
        let _server = accept.await??;

        let big = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(client.send(&big).await.is_err());
        Ok(())
    }
}
