//! TCP implementation of the duplex transport contract.

use super::Error;
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
};

/// The write half of a TCP connection.
pub struct Sink {
    half: OwnedWriteHalf,
}

/// The read half of a TCP connection.
pub struct Stream {
    half: OwnedReadHalf,
}

fn split(stream: TcpStream) -> Result<(Sink, Stream), Error> {
    // Handshake and RPC messages are small; waiting to coalesce them only
    // adds latency.
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((Sink { half: write }, Stream { half: read }))
}

/// Open a TCP connection to the given address.
pub async fn dial<A: ToSocketAddrs>(address: A) -> Result<(Sink, Stream), Error> {
    split(TcpStream::connect(address).await?)
}

/// Accepts inbound TCP connections.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(address: A) -> Result<Self, Error> {
        Ok(Self {
            inner: TcpListener::bind(address).await?,
        })
    }

    pub async fn accept(&mut self) -> Result<(SocketAddr, Sink, Stream), Error> {
        let (stream, address) = self.inner.accept().await?;
        let (sink, stream) = split(stream)?;
        Ok((address, sink, stream))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}

impl super::Sink for Sink {
    async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        self.half.write_all(msg).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

impl super::Stream for Stream {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match self.half.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Closed),
            Err(e) => Err(e.into()),
        }
    }
}
