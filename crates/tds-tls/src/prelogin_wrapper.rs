//! PRELOGIN framing for the TLS handshake.
//!
//! During the handshake every TLS record is carried in PRELOGIN packets.
//! Writes are buffered until flush and then framed; reads strip the packet
//! headers. Once [`TlsPreloginWrapper::handshake_complete`] is called the
//! wrapper passes bytes through unchanged.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream adapter that frames TLS handshake traffic in PRELOGIN packets.
#[derive(Debug)]
pub struct TlsPreloginWrapper<S> {
    stream: S,
    pending_handshake: bool,

    header: [u8; PACKET_HEADER_SIZE],
    header_pos: usize,
    read_remaining: usize,
    scratch: Vec<u8>,

    write_buf: Vec<u8>,
    framed: Vec<u8>,
    framed_pos: usize,
}

impl<S> TlsPreloginWrapper<S> {
    /// Wrap a stream that is about to start a TLS handshake.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending_handshake: true,
            header: [0u8; PACKET_HEADER_SIZE],
            header_pos: 0,
            read_remaining: 0,
            scratch: Vec::new(),
            write_buf: Vec::new(),
            framed: Vec::new(),
            framed_pos: 0,
        }
    }

    /// Switch to pass-through mode.
    pub fn handshake_complete(&mut self) {
        tracing::trace!("TLS wrapper switching to pass-through");
        self.pending_handshake = false;
    }

    /// Whether the wrapper still frames traffic.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.pending_handshake
    }

    /// Reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the wrapped stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn frame_pending_writes(&mut self) {
        let max_payload = DEFAULT_PACKET_SIZE - PACKET_HEADER_SIZE;
        let chunks: Vec<&[u8]> = self.write_buf.chunks(max_payload).collect();
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.iter().enumerate() {
            let status = if index == last {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let header = PacketHeader::new(
                PacketType::PreLogin,
                status,
                (PACKET_HEADER_SIZE + chunk.len()) as u16,
            )
            .with_packet_id((index + 1) as u8);
            header.encode(&mut self.framed);
            self.framed.extend_from_slice(chunk);
        }
        tracing::trace!(bytes = self.write_buf.len(), "TLS wrapper framed handshake data");
        self.write_buf.clear();
        self.framed_pos = 0;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsPreloginWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.pending_handshake {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }

        while this.read_remaining == 0 {
            while this.header_pos < PACKET_HEADER_SIZE {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_pos..]);
                ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_pos == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_pos += n;
            }

            let header = PacketHeader::decode(&mut &this.header[..])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if header.packet_type != PacketType::PreLogin {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected PRELOGIN packet during TLS handshake, got {}", header.packet_type),
                )));
            }
            this.header_pos = 0;
            this.read_remaining = header.payload_length();
        }

        let max_read = cmp::min(this.read_remaining, buf.remaining());
        if max_read == 0 {
            return Poll::Ready(Ok(()));
        }
        this.scratch.resize(max_read, 0);
        let mut scratch = ReadBuf::new(&mut this.scratch);
        ready!(Pin::new(&mut this.stream).poll_read(cx, &mut scratch))?;
        let n = scratch.filled().len();
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.put_slice(scratch.filled());
        this.read_remaining -= n;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsPreloginWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.pending_handshake {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }

        this.write_buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.framed.is_empty() && !this.write_buf.is_empty() {
            this.frame_pending_writes();
        }

        while this.framed_pos < this.framed.len() {
            let n = ready!(
                Pin::new(&mut this.stream).poll_write(cx, &this.framed[this.framed_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.framed_pos += n;
        }
        this.framed.clear();
        this.framed_pos = 0;

        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    fn prelogin_header(len: usize, id: u8) -> Vec<u8> {
        PacketHeader::new(PacketType::PreLogin, PacketStatus::END_OF_MESSAGE, (len + 8) as u16)
            .with_packet_id(id)
            .encode_to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_writes_are_framed_on_flush() {
        let mut expected = prelogin_header(5, 1);
        expected.extend_from_slice(b"hello");
        let mock = Builder::new().write(&expected).build();

        let mut wrapper = TlsPreloginWrapper::new(mock);
        wrapper.write_all(b"hel").await.unwrap();
        wrapper.write_all(b"lo").await.unwrap();
        wrapper.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_strip_headers() {
        let mut packet = prelogin_header(4, 1);
        packet.extend_from_slice(b"tls!");
        let mock = Builder::new().read(&packet).build();

        let mut wrapper = TlsPreloginWrapper::new(mock);
        let mut out = [0u8; 4];
        wrapper.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"tls!");
    }

    #[tokio::test]
    async fn test_rejects_other_packet_types() {
        // Header only: the wrapper must give up before reading a payload.
        let packet = PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 8)
            .encode_to_bytes()
            .to_vec();
        let mock = Builder::new().read(&packet).build();

        let mut wrapper = TlsPreloginWrapper::new(mock);
        let mut out = [0u8; 1];
        assert!(wrapper.read_exact(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_pass_through_after_handshake() {
        let mock = Builder::new().write(b"raw").read(b"data").build();
        let mut wrapper = TlsPreloginWrapper::new(mock);
        wrapper.handshake_complete();

        wrapper.write_all(b"raw").await.unwrap();
        let mut out = [0u8; 4];
        wrapper.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"data");
    }
}
