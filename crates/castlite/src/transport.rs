//! Outbound transport seam.
//!
//! The engine never owns sockets. Each connected client hands it a
//! [`Transport`]; flush workers write encoded frames to it and the engine
//! closes it when the client is replaced, inactivated or removed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};

use castlite_core::{decode_frame, FrameError};

/// Write side of a client connection.
///
/// Called from flush workers. Implementations must not block for long:
/// a slow transport stalls every unit queued behind it on that worker.
pub trait Transport: Send + Sync {
    /// Write one frame. Errors are counted and otherwise ignored; detecting a
    /// dead connection and calling disconnect or inactivate is up to the owner.
    fn write(&self, frame: &[u8]) -> io::Result<()>;

    /// Release the connection. Called at most once per replacement.
    fn close(&self);
}

/// In-memory transport delivering frames over a crossbeam channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Sender<Bytes>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Unbounded transport and the receiving end of its frames.
    pub fn unbounded() -> (Arc<Self>, Receiver<Bytes>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::from_sender(tx), rx)
    }

    /// Bounded transport. A full channel fails the write with `WouldBlock`.
    pub fn bounded(capacity: usize) -> (Arc<Self>, Receiver<Bytes>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::from_sender(tx), rx)
    }

    fn from_sender(tx: Sender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for ChannelTransport {
    fn write(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        match self.tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "transport channel full",
            )),
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport receiver dropped",
            )),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Drain every frame currently queued on `rx` and split them into payloads.
pub fn drain_payloads(rx: &Receiver<Bytes>) -> Result<Vec<Bytes>, FrameError> {
    let mut out = Vec::new();
    for frame in rx.try_iter() {
        out.extend(decode_frame(&frame)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use castlite_core::{BatchEncoder, Message};

    use super::*;

    #[test]
    fn test_channel_transport_delivers_frames() {
        let (transport, rx) = ChannelTransport::unbounded();
        let mut enc = BatchEncoder::new(1024);
        for frame in enc.encode(&[Message::new("a"), Message::new("b")]) {
            transport.write(frame).unwrap();
        }

        let payloads = drain_payloads(&rx).unwrap();
        assert_eq!(payloads, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (transport, rx) = ChannelTransport::unbounded();
        transport.close();
        assert!(transport.is_closed());
        let err = transport.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bounded_full_is_would_block() {
        let (transport, _rx) = ChannelTransport::bounded(1);
        transport.write(b"\x01a").unwrap();
        let err = transport.write(b"\x01b").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_dropped_receiver_is_broken_pipe() {
        let (transport, rx) = ChannelTransport::unbounded();
        drop(rx);
        let err = transport.write(b"\x01a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
