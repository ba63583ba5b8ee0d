use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use super::peer_message::Message;
use super::peer_session::PeerSessionError;
use super::session_status::SessionStatus;

/// The shared half of a peer session.
///
/// The session thread owns the reading side of the socket; everything any
/// other thread needs (writing messages, inspecting or mutating protocol
/// state, closing) goes through this handle, which the registry hands out.
/// The status lock is never held across a socket write.
#[derive(Debug)]
pub struct SessionHandle {
    key: String,
    writer: Mutex<TcpStream>,
    status: Mutex<SessionStatus>,
    closed: AtomicBool,
}

impl SessionHandle {
    /// Wraps a connected stream. The handle keeps its own clone of the
    /// socket for writing; the caller keeps the original for reading.
    pub fn new(key: String, stream: &TcpStream) -> Result<Self, PeerSessionError> {
        let writer = stream
            .try_clone()
            .map_err(PeerSessionError::ConnectionError)?;
        Ok(Self {
            key,
            writer: Mutex::new(writer),
            status: Mutex::new(SessionStatus::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Writes a message on the session socket. A failed write marks the
    /// session closed; the reading thread notices and tears it down.
    pub fn send(&self, message: &Message) -> Result<(), PeerSessionError> {
        self.send_bytes(&message.as_bytes())
    }

    /// Writes a zero-length keep-alive frame.
    pub fn send_keep_alive(&self) -> Result<(), PeerSessionError> {
        self.send_bytes(&Message::keep_alive_bytes())
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<(), PeerSessionError> {
        if self.is_closed() {
            return Err(PeerSessionError::SessionClosed);
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| PeerSessionError::PoisonedLock)?;
        writer.write_all(bytes).map_err(|err| {
            self.close();
            PeerSessionError::SendError(err)
        })
    }

    pub fn lock_status(&self) -> Result<MutexGuard<SessionStatus>, PeerSessionError> {
        self.status.lock().map_err(|_| PeerSessionError::PoisonedLock)
    }

    /// Marks the session closed and shuts the socket down, which also wakes
    /// the reading thread.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(writer) = self.writer.lock() {
                let _ = writer.shutdown(Shutdown::Both);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
