//! Ethernet-over-stream framing for the guest data plane.
//!
//! Each frame on the wire is a 16-bit little-endian length followed by
//! that many bytes of raw ethernet.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let len = u16::from_le_bytes(header) as usize;

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u16 length"))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Moves frames between a guest stream and the stack's frame channels
/// until either side closes.
pub async fn pump<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    to_stack: mpsc::UnboundedSender<Vec<u8>>,
    from_stack: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            inbound = read_frame(&mut stream) => {
                let frame = inbound?;
                if to_stack.send(frame).is_err() {
                    return Ok(());
                }
            }
            outbound = from_stack.recv() => {
                match outbound {
                    Some(frame) => write_frame(&mut stream, &frame).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, b"\x01\x02\x03ethernet").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, b"\x01\x02\x03ethernet");
    }

    #[tokio::test]
    async fn length_prefix_is_little_endian() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, &[0xau8; 300]).await.unwrap();

        let mut header = [0u8; 2];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(header, 300u16.to_le_bytes());
        assert_eq!(header, [0x2c, 0x01]);
    }

    #[tokio::test]
    async fn empty_frame_is_legal() {
        let (mut a, mut b) = tokio::io::duplex(16);
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn pump_moves_frames_both_ways() {
        let (host_side, stack_side) = tokio::io::duplex(4096);
        let (to_stack_tx, mut to_stack_rx) = mpsc::unbounded_channel();
        let (from_stack_tx, mut from_stack_rx) = mpsc::unbounded_channel();

        let task =
            tokio::spawn(async move { pump(stack_side, to_stack_tx, &mut from_stack_rx).await });

        let (mut read_half, mut write_half) = tokio::io::split(host_side);
        write_frame(&mut write_half, b"guest frame").await.unwrap();
        assert_eq!(to_stack_rx.recv().await.unwrap(), b"guest frame");

        from_stack_tx.send(b"gateway frame".to_vec()).unwrap();
        assert_eq!(read_frame(&mut read_half).await.unwrap(), b"gateway frame");

        drop(from_stack_tx);
        task.await.unwrap().unwrap();
    }
}
