//! Network Module
//!
//! Handles TCP communication between nodes on the coordination channel.

pub mod protocol;
mod server;
mod client;

pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::{CoordinationServer, MessageHandler};
pub use client::NetworkClient;

use crate::error::{Error, Result};
use crate::state::NodeId;

/// Request/response delivery to a peer's coordination endpoint
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a message to `to` and wait for its single response
    async fn send(&self, to: NodeId, message: Message) -> Result<Message>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > protocol::MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(header.length));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::ChecksumMismatch);
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
