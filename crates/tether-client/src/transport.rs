//! Transport abstraction and the newline-delimited JSON channel codec.
//!
//! The connection manager never touches sockets directly: it asks a
//! [`Connector`] for a framed duplex channel and drives it through the
//! [`FrameSink`]/[`FrameStream`] pair. Production uses [`TcpConnector`];
//! the simulation harness plugs in an in-memory duplex with the same
//! traits.
//!
//! Framing is one JSON record per line. Blank lines are skipped so a
//! peer may keep the connection warm without sending records.

use std::io;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;

use tether_proto::WireMessage;

/// Write half of a framed channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: &WireMessage) -> io::Result<()>;

    /// Flush and shut the write side down.
    async fn close(&mut self) -> io::Result<()>;
}

/// Read half of a framed channel.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame, or `None` at end of stream.
    async fn next(&mut self) -> io::Result<Option<WireMessage>>;
}

/// Opens framed channels to the relay.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `addr` and return the framed halves of the channel.
    async fn dial(&self, addr: &str) -> io::Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

struct JsonSink<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for JsonSink<W> {
    async fn send(&mut self, frame: &WireMessage) -> io::Result<()> {
        let mut line = frame
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct JsonStream<R> {
    reader: BufReader<R>,
    line: String,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameStream for JsonStream<R> {
    async fn next(&mut self) -> io::Result<Option<WireMessage>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let raw = self.line.trim();
            if raw.is_empty() {
                continue;
            }
            return WireMessage::decode(raw)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }
}

/// Split a duplex byte stream into framed halves.
pub fn json_channel<S>(stream: S) -> (Box<dyn FrameSink>, Box<dyn FrameStream>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (
        Box::new(JsonSink { writer: write }),
        Box::new(JsonStream { reader: BufReader::new(read), line: String::new() }),
    )
}

/// TCP connector for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, addr: &str) -> io::Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(json_channel(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut sink, _) = json_channel(a);
        let (_, mut stream) = json_channel(b);

        let ping = WireMessage::Ping { timestamp: 42 };
        sink.send(&ping).await.unwrap();
        sink.send(&WireMessage::Subscribed).await.unwrap();

        assert_eq!(stream.next().await.unwrap(), Some(ping));
        assert_eq!(stream.next().await.unwrap(), Some(WireMessage::Subscribed));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let (mut a, b) = tokio::io::duplex(4096);
        let (_keep, mut stream) = json_channel(b);

        a.write_all(b"\n\n{\"type\":\"subscribed\"}\n").await.unwrap();

        assert_eq!(stream.next().await.unwrap(), Some(WireMessage::Subscribed));
    }

    #[tokio::test]
    async fn closed_peer_yields_end_of_stream() {
        let (a, b) = tokio::io::duplex(64);
        let (sink, _stream_a) = json_channel(a);
        let (_, mut stream) = json_channel(b);
        drop(sink);
        drop(_stream_a);

        assert_eq!(stream.next().await.unwrap(), None);
    }
}
