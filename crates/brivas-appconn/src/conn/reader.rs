//! Receive loop

use super::{ConnInner, Connection};
use crate::errors::{AppConnError, MessageError};
use crate::message::{FrameHeader, Message, PROTOCOL_VERSION};
use bytes::BytesMut;
use std::io;
use std::sync::Weak;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Read one complete frame
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Message, AppConnError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FrameHeader::MAX_LEN];
    reader
        .read_exact(&mut header[..FrameHeader::PREFIX_LEN])
        .await?;
    if header[0] != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(header[0]).into());
    }

    let header_len = FrameHeader::PREFIX_LEN + FrameHeader::tail_len(header[1])?;
    reader
        .read_exact(&mut header[FrameHeader::PREFIX_LEN..header_len])
        .await?;
    let parsed = FrameHeader::parse(&mut &header[..header_len])?;

    let mut payload = BytesMut::zeroed(parsed.payload_len);
    reader.read_exact(&mut payload).await?;
    Ok(Message::from_frame(parsed, payload.freeze())?)
}

/// Frame inbound bytes until the socket fails or shutdown is signalled,
/// then tear down the link this loop was bound to
pub(super) async fn run(
    conn: Weak<ConnInner>,
    mut reader: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
    epoch: u64,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };

        match frame {
            Ok(msg) => {
                let Some(inner) = conn.upgrade() else {
                    break;
                };
                metrics::counter!("appconn_frames_received_total").increment(1);
                trace!(id = msg.id(), code = msg.code(), msg = %msg.to_json(), "Frame received");
                let conn = Connection::from_inner(inner);
                let received_at = Instant::now();
                tokio::spawn(async move { conn.handle(msg, received_at).await });
            }
            Err(AppConnError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Peer closed connection");
                break;
            }
            Err(e) => {
                metrics::counter!("appconn_receive_errors_total").increment(1);
                warn!(error = %e, "Receive failed, closing connection");
                break;
            }
        }
    }

    if let Some(inner) = conn.upgrade() {
        Connection::from_inner(inner).teardown(Some(epoch)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CodecError;
    use crate::ie::InformationElement;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let msg = Message::call(1, [InformationElement::int(0, 42)]);
        let frame = msg.encode().unwrap();

        let mut stream = Builder::new()
            .read(&frame[..1])
            .read(&frame[1..5])
            .read(&frame[5..])
            .build();
        assert_eq!(read_frame(&mut stream).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let first = Message::async_call(3, [InformationElement::string(0, "a")]);
        let mut second = Message::ret([InformationElement::byte(0, 1)]);
        second.set_id(9);

        let mut bytes = first.encode().unwrap();
        bytes.extend_from_slice(&second.encode().unwrap());
        let mut stream = Builder::new().read(&bytes).build();

        assert_eq!(read_frame(&mut stream).await.unwrap(), first);
        assert_eq!(read_frame(&mut stream).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let mut stream = Builder::new().read(&[0x10, 0x00]).build();
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(AppConnError::Message(MessageError::UnsupportedVersion(0x10)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_length_class_rejected() {
        let mut stream = Builder::new().read(&[0x20, 0x03]).build();
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(AppConnError::Codec(CodecError::InvalidLengthClass(3)))
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let mut stream = Builder::new().read(&[0x20, 0x01, 0x05]).build();
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(AppConnError::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }
}
