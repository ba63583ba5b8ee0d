use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::peer::peer_message::{handshake::HANDSHAKE_LEN, Handshake, Message};
use crate::peer::peer_session::PeerSession;
use crate::swarm::choking::ChokingController;
use crate::swarm::ctx::SwarmCtx;

const ACCEPT_POLL: Duration = Duration::from_millis(500);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Posible `BtServer` errors.
#[derive(Debug)]
pub enum BtServerError {
    OpeningListenerError(io::Error),
    HandshakeReadError(io::Error),
    InvalidHandshake,
    WrongInfoHash,
    MaxPeersReached,
    HandshakeWriteError(io::Error),
}

/// Accepts inbound peer connections on the configured port and turns the
/// valid ones into regular sessions, which then upload and download exactly
/// like dialed ones.
pub struct BtServer {
    ctx: Arc<SwarmCtx>,
    choking: Arc<ChokingController>,
}

impl BtServer {
    pub fn new(ctx: Arc<SwarmCtx>, choking: Arc<ChokingController>) -> Self {
        Self { ctx, choking }
    }

    /// Listens until shutdown.
    ///
    /// # Errors
    /// - `OpeningListenerError` if the listener could not be bound.
    pub fn init(&self) -> Result<(), BtServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.ctx.config.tcp_port))
            .map_err(BtServerError::OpeningListenerError)?;
        listener
            .set_nonblocking(true)
            .map_err(BtServerError::OpeningListenerError)?;

        info!(
            "listening for incoming peers on port {}",
            self.ctx.config.tcp_port
        );

        loop {
            if self.ctx.is_shutdown() {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, address)) => {
                    let _ = stream.set_nonblocking(false);
                    if let Err(err) = self.handle_connection(stream) {
                        debug!("rejected incoming connection from {}: {:?}", address, err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    warn!("accept failed: {}", err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    /// Validates the remote's handshake, replies with ours plus our current
    /// bitfield, and hands the socket to a session thread.
    fn handle_connection(&self, mut stream: TcpStream) -> Result<(), BtServerError> {
        let _ = stream.set_nodelay(true);
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(BtServerError::HandshakeReadError)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(BtServerError::HandshakeReadError)?;

        let mut buffer = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buffer)
            .map_err(BtServerError::HandshakeReadError)?;
        let remote =
            Handshake::from_bytes(&buffer).map_err(|_| BtServerError::InvalidHandshake)?;

        if remote.info_hash != self.ctx.info_hash {
            return Err(BtServerError::WrongInfoHash);
        }
        if self.ctx.registry.len() >= self.ctx.config.max_peers {
            return Err(BtServerError::MaxPeersReached);
        }

        let ours = Handshake::new(
            self.ctx.info_hash.clone(),
            self.ctx.client_peer_id.as_bytes().to_vec(),
        );
        stream
            .write_all(&ours.as_bytes())
            .map_err(BtServerError::HandshakeWriteError)?;

        if let Ok(bitfield) = self.ctx.store.bitfield() {
            stream
                .write_all(&Message::bitfield(bitfield).as_bytes())
                .map_err(BtServerError::HandshakeWriteError)?;
        }

        let ctx = self.ctx.clone();
        let choking = self.choking.clone();
        thread::spawn(move || PeerSession::run_incoming(stream, remote, ctx, choking));
        Ok(())
    }
}
