//! Split I/O connection.
//!
//! The transport is split into read and write halves. Reads go through a
//! [`MessageAssembler`] and are cancel safe: a `read_message` future may be
//! dropped (for example when it loses a `select!` against a timer) without
//! losing buffered packets. The halves can be joined again with
//! [`Connection::into_inner`] so that TLS can be installed on the same socket.

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::error::CodecError;
use crate::framed::{PacketReader, PacketWriter};
use crate::message::{Message, MessageAssembler};
use crate::packet_codec::Packet;

/// How far an outgoing message got before the abort check tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every packet was written.
    Sent,
    /// Aborted before the first packet; nothing reached the server.
    NotSent,
    /// Aborted part way; the message was closed with `IGNORE | END_OF_MESSAGE`.
    Ignored,
}

/// A framed TDS connection.
pub struct Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    reader: PacketReader<ReadHalf<T>>,
    writer: PacketWriter<WriteHalf<T>>,
    assembler: MessageAssembler,
    packet_size: usize,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            assembler: MessageAssembler::new(),
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Packet size used when splitting outgoing messages.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Apply a negotiated packet size, clamped to the protocol limits.
    pub fn set_packet_size(&mut self, size: usize) {
        self.packet_size = size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        tracing::debug!(packet_size = self.packet_size, "packet size changed");
    }

    /// Read the next complete message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between messages.
    pub async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            match self.reader.next().await {
                Some(Ok(packet)) => {
                    if let Some(message) = self.assembler.push(packet) {
                        return Ok(Some(message));
                    }
                }
                Some(Err(e)) => return Err(e),
                None if self.assembler.has_partial() => return Err(CodecError::ConnectionClosed),
                None => return Ok(None),
            }
        }
    }

    /// Send a message, split into packets of the current packet size.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<(), CodecError> {
        self.send_message_with(packet_type, payload, PacketStatus::NORMAL, || false)
            .await
            .map(|_| ())
    }

    /// Send a message, checking `abort` before each packet.
    ///
    /// `first_status` is OR-ed into the first packet only (used for
    /// `RESET_CONNECTION`).
    pub async fn send_message_with<F>(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        first_status: PacketStatus,
        mut abort: F,
    ) -> Result<SendOutcome, CodecError>
    where
        F: FnMut() -> bool,
    {
        let max_payload = self.packet_size - PACKET_HEADER_SIZE;
        let total_chunks = payload.len().div_ceil(max_payload).max(1);

        for index in 0..total_chunks {
            if abort() {
                if index == 0 {
                    tracing::debug!(packet_type = %packet_type, "send aborted before first packet");
                    return Ok(SendOutcome::NotSent);
                }
                tracing::debug!(
                    packet_type = %packet_type,
                    sent = index,
                    total = total_chunks,
                    "send aborted, closing message with IGNORE"
                );
                let header = PacketHeader::new(
                    packet_type,
                    PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE,
                    0,
                );
                self.writer.send(Packet::new(header, BytesMut::new())).await?;
                return Ok(SendOutcome::Ignored);
            }

            let start = index * max_payload;
            let end = (start + max_payload).min(payload.len());
            let mut status = if index + 1 == total_chunks {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            if index == 0 {
                status |= first_status;
            }

            let header = PacketHeader::new(packet_type, status, 0);
            self.writer
                .send(Packet::new(header, BytesMut::from(&payload[start..end])))
                .await?;
        }

        Ok(SendOutcome::Sent)
    }

    /// Send an attention signal asking the server to stop the current request.
    pub async fn send_attention(&mut self) -> Result<(), CodecError> {
        tracing::debug!("sending attention");
        let header = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 0);
        self.writer.send(Packet::new(header, BytesMut::new())).await
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.writer.close().await
    }

    /// Join the halves and return the transport.
    pub fn into_inner(self) -> T {
        self.reader.into_inner().unsplit(self.writer.into_inner())
    }
}

impl<T> std::fmt::Debug for Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("packet_size", &self.packet_size)
            .field("has_partial_message", &self.assembler.has_partial())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn header(packet_type: PacketType, status: PacketStatus, length: u16, id: u8) -> Vec<u8> {
        PacketHeader::new(packet_type, status, length)
            .with_packet_id(id)
            .encode_to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_read_message_across_packets() {
        let mut first = header(PacketType::TabularResult, PacketStatus::NORMAL, 11, 1);
        first.extend_from_slice(b"abc");
        let mut second = header(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 10, 2);
        second.extend_from_slice(b"de");

        let mock = Builder::new().read(&first).read(&second).build();
        let mut conn = Connection::new(mock);

        let message = conn.read_message().await.unwrap().unwrap();
        assert_eq!(&message.payload[..], b"abcde");
        assert!(conn.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_splits_by_packet_size() {
        let payload = Bytes::from(vec![7u8; 600]);
        let mut first = header(PacketType::SqlBatch, PacketStatus::NORMAL, 512, 1);
        first.extend_from_slice(&payload[..504]);
        let mut second = header(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 104, 2);
        second.extend_from_slice(&payload[504..]);

        let mock = Builder::new().write(&first).write(&second).build();
        let mut conn = Connection::new(mock);
        conn.set_packet_size(512);

        conn.send_message(PacketType::SqlBatch, payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_after_first_packet_sends_ignore() {
        let payload = Bytes::from(vec![1u8; 1000]);
        let mut first = header(PacketType::Rpc, PacketStatus::RESET_CONNECTION, 512, 1);
        first.extend_from_slice(&payload[..504]);
        let ignore = header(
            PacketType::Rpc,
            PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE,
            8,
            2,
        );

        let mock = Builder::new().write(&first).write(&ignore).build();
        let mut conn = Connection::new(mock);
        conn.set_packet_size(512);

        let mut calls = 0;
        let outcome = conn
            .send_message_with(PacketType::Rpc, payload, PacketStatus::RESET_CONNECTION, || {
                calls += 1;
                calls > 1
            })
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_abort_before_first_packet_writes_nothing() {
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock);
        let outcome = conn
            .send_message_with(
                PacketType::SqlBatch,
                Bytes::from_static(b"x"),
                PacketStatus::NORMAL,
                || true,
            )
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::NotSent);
    }

    #[tokio::test]
    async fn test_attention_is_header_only() {
        let attention = header(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 8, 1);
        let mock = Builder::new().write(&attention).build();
        let mut conn = Connection::new(mock);
        conn.send_attention().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_still_sends_one_packet() {
        let empty = header(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 8, 1);
        let mock = Builder::new().write(&empty).build();
        let mut conn = Connection::new(mock);
        conn.send_message(PacketType::SqlBatch, Bytes::new()).await.unwrap();
    }
}
