use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::socket::{setsockopt, sockopt::KeepAlive};
use tracing::{debug, warn};

use crate::piece_store::{FinalizeOutcome, PieceStoreError};
use crate::request_queue::RequestQueueError;
use crate::swarm::choking::ChokingController;
use crate::swarm::ctx::SwarmCtx;
use crate::swarm::registry::RegistryError;

use super::bt_peer::BtPeer;
use super::peer_message::{
    handshake::HANDSHAKE_LEN, Bitfield, Handshake, Message, MessageId, Request,
};
use super::session_handle::SessionHandle;
use super::session_status::ActiveRequest;

/// Socket-level deadline for connecting and completing the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Read timeout in Ready state; doubles as the idle-tick cadence.
const READ_TICK: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single frame; large enough for the bitfield of any
/// realistic torrent, small enough to stop a peer from ballooning memory.
const MAX_FRAME_LEN: usize = 1024 * 1024;
/// Malformed frames tolerated before the session is closed.
const MAX_FRAMING_ERRORS: u32 = 5;
/// Longest block a peer may request from us.
const MAX_UPLOAD_REQUEST_LEN: u32 = 32768;
/// Futile refill attempts (stale or duplicate queue entries) per pump.
const PUMP_MAX_FUTILE: u32 = 5;

/// Posible `PeerSession` errors.
#[derive(Debug)]
pub enum PeerSessionError {
    ConnectionError(io::Error),
    AddressResolutionError,
    HandshakeFailed,
    InfoHashMismatch,
    PeerIsOurself,
    DuplicateSession,
    SessionClosed,
    SendError(io::Error),
    PoisonedLock,
    FrameTooLong(usize),
    TooManyProtocolErrors,
    AbusivePeer,
    PieceStoreError(PieceStoreError),
    RequestQueueError(RequestQueueError),
    RegistryError(RegistryError),
}

impl From<PieceStoreError> for PeerSessionError {
    fn from(err: PieceStoreError) -> Self {
        PeerSessionError::PieceStoreError(err)
    }
}

impl From<RequestQueueError> for PeerSessionError {
    fn from(err: RequestQueueError) -> Self {
        PeerSessionError::RequestQueueError(err)
    }
}

impl From<RegistryError> for PeerSessionError {
    fn from(err: RegistryError) -> Self {
        PeerSessionError::RegistryError(err)
    }
}

/// What handling one frame decided about the session's fate.
#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Ok,
    MalformedFrame,
    AbusiveFrame,
}

enum ReadEvent {
    Frame(Vec<u8>),
    KeepAlive,
    /// Read timeout: a chance to run idle work.
    Tick,
    Disconnected,
}

/// One connected peer: the session owns the reading side of the socket and
/// drives the whole protocol conversation; shared state and the writing
/// side live in the `SessionHandle` the registry hands out.
///
/// Lifecycle: Dialing -> Handshaking -> Ready -> Closed. Closing releases
/// every in-flight block back to the queue and deregisters the peer.
pub struct PeerSession {
    peer_key: String,
    ctx: Arc<SwarmCtx>,
    choking: Arc<ChokingController>,
    stream: TcpStream,
    handle: Arc<SessionHandle>,
    read_buffer: Vec<u8>,
    framing_errors: u32,
}

impl PeerSession {
    /// Dials a discovered peer and runs the session to completion. Spawned
    /// on its own thread by the pool; never panics out, only logs.
    pub fn run_outgoing(peer: BtPeer, ctx: Arc<SwarmCtx>, choking: Arc<ChokingController>) {
        let key = peer.key();

        let (stream, remote) = match Self::dial(&peer, &ctx) {
            Ok(connected) => connected,
            Err(err) => {
                debug!("connecting to {} failed: {:?}", key, err);
                ctx.connect_failed(key);
                return;
            }
        };

        match Self::start(stream, remote, key.clone(), ctx.clone(), choking) {
            Ok(()) => {}
            Err(PeerSessionError::DuplicateSession) => {
                debug!("{} already has a session", key);
                ctx.session_slot_released();
            }
            Err(err) => debug!("session {} ended: {:?}", key, err),
        }
    }

    /// Runs a session for an inbound connection the server already
    /// handshook with.
    pub fn run_incoming(
        stream: TcpStream,
        remote: Handshake,
        ctx: Arc<SwarmCtx>,
        choking: Arc<ChokingController>,
    ) {
        let key = match stream.peer_addr() {
            Ok(addr) => format!("{}:{}", addr.ip(), addr.port()),
            Err(_) => return,
        };
        if let Err(err) = Self::start(stream, remote, key.clone(), ctx, choking) {
            debug!("incoming session {} ended: {:?}", key, err);
        }
    }

    /// Dialing + Handshaking: connect, swap handshakes, validate.
    fn dial(peer: &BtPeer, ctx: &SwarmCtx) -> Result<(TcpStream, Handshake), PeerSessionError> {
        let address = format!("{}:{}", peer.ip, peer.port)
            .to_socket_addrs()
            .map_err(PeerSessionError::ConnectionError)?
            .next()
            .ok_or(PeerSessionError::AddressResolutionError)?;

        let mut stream = TcpStream::connect_timeout(&address, HANDSHAKE_TIMEOUT)
            .map_err(PeerSessionError::ConnectionError)?;
        stream
            .set_nodelay(true)
            .map_err(PeerSessionError::ConnectionError)?;
        enable_keep_alive(&stream);
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(PeerSessionError::ConnectionError)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(PeerSessionError::ConnectionError)?;

        let ours = Handshake::new(
            ctx.info_hash.clone(),
            ctx.client_peer_id.as_bytes().to_vec(),
        );
        stream
            .write_all(&ours.as_bytes())
            .map_err(PeerSessionError::ConnectionError)?;

        let mut buffer = [0u8; HANDSHAKE_LEN];
        stream
            .read_exact(&mut buffer)
            .map_err(|_| PeerSessionError::HandshakeFailed)?;
        let remote =
            Handshake::from_bytes(&buffer).map_err(|_| PeerSessionError::HandshakeFailed)?;

        if remote.info_hash != ctx.info_hash {
            return Err(PeerSessionError::InfoHashMismatch);
        }
        if remote.peer_id == ctx.client_peer_id.as_bytes() {
            return Err(PeerSessionError::PeerIsOurself);
        }

        Ok((stream, remote))
    }

    /// Registers the session and runs the Ready loop; always deregisters
    /// and releases held blocks on the way out.
    fn start(
        stream: TcpStream,
        remote: Handshake,
        key: String,
        ctx: Arc<SwarmCtx>,
        choking: Arc<ChokingController>,
    ) -> Result<(), PeerSessionError> {
        stream
            .set_read_timeout(Some(READ_TICK))
            .map_err(PeerSessionError::ConnectionError)?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(PeerSessionError::ConnectionError)?;

        let handle = Arc::new(SessionHandle::new(key.clone(), &stream)?);
        handle.lock_status()?.remote_peer_id = Some(remote.peer_id);

        if !ctx.registry.insert(handle.clone())? {
            handle.close();
            return Err(PeerSessionError::DuplicateSession);
        }

        let mut session = PeerSession {
            peer_key: key.clone(),
            ctx: ctx.clone(),
            choking,
            stream,
            handle,
            read_buffer: Vec::new(),
            framing_errors: 0,
        };

        let result = session.established();
        session.handle.close();
        ctx.session_closed(&key);
        result
    }

    /// Ready state entry: declare interest, get an immediate choking round,
    /// then process frames until the connection dies.
    fn established(&mut self) -> Result<(), PeerSessionError> {
        self.handle.send(&Message::interested())?;
        self.handle.lock_status()?.interested_in_remote = true;
        self.choking.run_round();
        self.ready_loop()
    }

    fn ready_loop(&mut self) -> Result<(), PeerSessionError> {
        loop {
            if self.ctx.is_shutdown() || self.handle.is_closed() {
                return Ok(());
            }
            match self.next_event()? {
                ReadEvent::Frame(frame) => {
                    self.touch_inbound()?;
                    match self.dispatch(&frame)? {
                        FrameOutcome::Ok => {}
                        FrameOutcome::MalformedFrame => {
                            self.framing_errors += 1;
                            if self.framing_errors >= MAX_FRAMING_ERRORS {
                                warn!("{}: too many malformed frames", self.peer_key);
                                return Err(PeerSessionError::TooManyProtocolErrors);
                            }
                        }
                        FrameOutcome::AbusiveFrame => {
                            warn!("{}: abusive frame, closing", self.peer_key);
                            return Err(PeerSessionError::AbusivePeer);
                        }
                    }
                }
                ReadEvent::KeepAlive => self.touch_inbound()?,
                ReadEvent::Tick => self.on_tick()?,
                ReadEvent::Disconnected => return Ok(()),
            }
        }
    }

    /// Accumulates socket bytes and slices complete frames off the buffer.
    fn next_event(&mut self) -> Result<ReadEvent, PeerSessionError> {
        loop {
            if let Some(event) = self.take_frame()? {
                return Ok(event);
            }

            let mut chunk = [0u8; 16384];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadEvent::Disconnected),
                Ok(read) => self.read_buffer.extend_from_slice(&chunk[..read]),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        return Ok(ReadEvent::Tick)
                    }
                    io::ErrorKind::Interrupted => continue,
                    _ => return Ok(ReadEvent::Disconnected),
                },
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<ReadEvent>, PeerSessionError> {
        if self.read_buffer.len() < 4 {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&self.read_buffer[..4]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length == 0 {
            self.read_buffer.drain(..4);
            return Ok(Some(ReadEvent::KeepAlive));
        }
        if length > MAX_FRAME_LEN {
            return Err(PeerSessionError::FrameTooLong(length));
        }
        if self.read_buffer.len() < 4 + length {
            return Ok(None);
        }

        let frame = self.read_buffer[4..4 + length].to_vec();
        self.read_buffer.drain(..4 + length);
        Ok(Some(ReadEvent::Frame(frame)))
    }

    /// Idle work between frames: serve deferred uploads, refill the
    /// pipeline.
    fn on_tick(&mut self) -> Result<(), PeerSessionError> {
        self.drain_pending_uploads()?;
        let can_request = {
            let status = self.handle.lock_status()?;
            !status.choked_by_remote && status.interested_in_remote
        };
        if can_request {
            Self::pump(&self.handle, &self.ctx)?;
        }
        Ok(())
    }

    fn touch_inbound(&self) -> Result<(), PeerSessionError> {
        self.handle.lock_status()?.last_inbound = Instant::now();
        Ok(())
    }

    fn dispatch(&mut self, frame: &[u8]) -> Result<FrameOutcome, PeerSessionError> {
        let message = match Message::from_bytes(frame) {
            Ok(Some(message)) => message,
            // unknown IDs are dropped silently
            Ok(None) => return Ok(FrameOutcome::Ok),
            Err(_) => return Ok(FrameOutcome::MalformedFrame),
        };

        match message.id {
            MessageId::Choke => {
                let mut status = self.handle.lock_status()?;
                status.choked_by_remote = true;
                // the pipeline is void, but in-flight bytes may still land,
                // so the entries themselves stay
                status.pending_count = 0;
                Ok(FrameOutcome::Ok)
            }
            MessageId::Unchoke => {
                self.handle.lock_status()?.choked_by_remote = false;
                Self::pump(&self.handle, &self.ctx)?;
                Ok(FrameOutcome::Ok)
            }
            MessageId::Interested => {
                self.handle.lock_status()?.interested_in_us = true;
                Ok(FrameOutcome::Ok)
            }
            MessageId::NotInterested => {
                self.handle.lock_status()?.interested_in_us = false;
                Ok(FrameOutcome::Ok)
            }
            MessageId::Have => {
                let piece = message.parse_have();
                if piece < self.ctx.store.total_pieces() {
                    self.handle.lock_status()?.available_pieces.insert(piece);
                    self.ctx.queue.add_peer_piece(&self.peer_key, piece)?;
                }
                Ok(FrameOutcome::Ok)
            }
            MessageId::Bitfield => {
                let available = Bitfield::new(message.payload.clone())
                    .piece_indices(self.ctx.store.total_pieces());
                self.handle.lock_status()?.available_pieces = available.clone();
                self.ctx.queue.update_peer_pieces(&self.peer_key, available)?;
                let unchoked = !self.handle.lock_status()?.choked_by_remote;
                if unchoked {
                    Self::pump(&self.handle, &self.ctx)?;
                }
                Ok(FrameOutcome::Ok)
            }
            MessageId::Request => self.handle_request(message.parse_request()),
            MessageId::Piece => self.handle_piece(&message),
            MessageId::Cancel => {
                let request = message.parse_request();
                self.handle
                    .lock_status()?
                    .pending_uploads
                    .retain(|pending| *pending != request);
                Ok(FrameOutcome::Ok)
            }
            // PORT would go to a DHT; there is none, so it is dropped
            MessageId::Port => Ok(FrameOutcome::Ok),
        }
    }

    /// A `piece` message: measure, account, store, verify, write, refill.
    fn handle_piece(&mut self, message: &Message) -> Result<FrameOutcome, PeerSessionError> {
        let (piece, offset, block) = message.parse_piece();

        // stale, duplicate, or never-wanted deliveries are consumed to keep
        // the stream in sync, with every side effect skipped
        if !self.ctx.store.needed(piece, offset)? {
            let mut status = self.handle.lock_status()?;
            if status.active_requests.remove(&(piece, offset)).is_some() {
                status.pending_count = status.pending_count.saturating_sub(1);
            }
            return Ok(FrameOutcome::Ok);
        }

        let solicited = {
            let mut status = self.handle.lock_status()?;
            match status.active_requests.remove(&(piece, offset)) {
                Some(request) => {
                    status.pending_count = status.pending_count.saturating_sub(1);
                    status.note_block_rtt(request.requested_at.elapsed());
                    true
                }
                None => false,
            }
        };
        if !solicited {
            return Ok(FrameOutcome::Ok);
        }

        if self.ctx.is_endgame() {
            self.ctx
                .registry
                .cancel_duplicates(piece, offset, &self.peer_key);
        }

        if self.ctx.store.add_received(piece, offset, block)? {
            match self.ctx.store.try_finalize(piece)? {
                FinalizeOutcome::Verified => self.ctx.piece_verified(piece),
                FinalizeOutcome::Mismatch => {
                    // every block of the piece flows through the queue again
                    self.ctx
                        .queue
                        .enqueue_piece(piece, self.ctx.store.piece_size(piece))?;
                }
                FinalizeOutcome::Incomplete | FinalizeOutcome::AlreadyVerified => {}
            }

            if let Err(err) = self.ctx.files.write_block(piece, offset, block) {
                warn!("writing block {}:{} failed: {:?}", piece, offset, err);
            }

            self.handle
                .lock_status()?
                .record_downloaded(block.len() as u64);
            self.ctx
                .downloaded
                .fetch_add(block.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }

        Self::pump(&self.handle, &self.ctx)?;
        Ok(FrameOutcome::Ok)
    }

    /// An inbound `request`: validated against the abuse limits, then
    /// served through the cache-through file layer if we are not choking
    /// the peer and the piece is verified.
    fn handle_request(&mut self, request: Request) -> Result<FrameOutcome, PeerSessionError> {
        if request.length == 0 || request.length > MAX_UPLOAD_REQUEST_LEN {
            return Ok(FrameOutcome::AbusiveFrame);
        }

        let now = Instant::now();
        enum Verdict {
            Serve,
            Defer,
            Drop,
        }

        let verdict = {
            let mut status = self.handle.lock_status()?;
            if !status.note_upload_request(now) {
                return Ok(FrameOutcome::AbusiveFrame);
            }
            if status.choking_remote {
                Verdict::Drop
            } else if !status.take_upload_budget(now, request.length as u64) {
                status.defer_upload(request);
                Verdict::Defer
            } else {
                Verdict::Serve
            }
        };

        if let Verdict::Serve = verdict {
            if self.ctx.store.is_verified(request.index)? {
                self.serve_upload(request)?;
            }
        }
        Ok(FrameOutcome::Ok)
    }

    fn serve_upload(&self, request: Request) -> Result<(), PeerSessionError> {
        let bytes = match self
            .ctx
            .files
            .read_block(request.index, request.begin, request.length)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                // a failed disk read silently skips the upload
                debug!("upload read {:?} failed: {:?}", request, err);
                return Ok(());
            }
        };

        self.handle
            .send(&Message::piece(request.index, request.begin, &bytes))?;

        self.handle
            .lock_status()?
            .record_uploaded(request.length as u64);
        self.ctx
            .uploaded
            .fetch_add(request.length as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Serves requests deferred by the bandwidth window, oldest first, for
    /// as long as the fresh window allows.
    fn drain_pending_uploads(&self) -> Result<(), PeerSessionError> {
        loop {
            let now = Instant::now();
            let next = {
                let mut status = self.handle.lock_status()?;
                if status.choking_remote {
                    return Ok(());
                }
                let length = match status.pending_uploads.front() {
                    Some(pending) => pending.length,
                    None => return Ok(()),
                };
                if !status.take_upload_budget(now, length as u64) {
                    return Ok(());
                }
                status.pending_uploads.pop_front()
            };

            match next {
                Some(request) => {
                    if self.ctx.store.is_verified(request.index)? {
                        self.serve_upload(request)?;
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Refills the request pipeline from the shared queue: dequeue blocks
    /// the peer has, skip everything no longer needed, stop at the adaptive
    /// depth. Also run by the supervisor after expiring timed-out requests.
    pub fn pump(handle: &SessionHandle, ctx: &SwarmCtx) -> Result<(), PeerSessionError> {
        let key = handle.key().to_string();
        let mut futile: u32 = 0;

        loop {
            let endgame = ctx.is_endgame();
            {
                let status = handle.lock_status()?;
                if status.choked_by_remote
                    || status.pending_count >= status.effective_pipeline(endgame)
                {
                    break;
                }
            }

            let block = match ctx.queue.dequeue(&key)? {
                Some(block) => block,
                None => break,
            };

            // stale copies (delivered meanwhile) fall out of the queue here
            if !ctx.store.needed(block.piece, block.offset)? {
                futile += 1;
                if futile >= PUMP_MAX_FUTILE {
                    break;
                }
                continue;
            }

            {
                let mut status = handle.lock_status()?;
                if status
                    .active_requests
                    .contains_key(&(block.piece, block.offset))
                {
                    // already in flight here; leave the copy for the others
                    if endgame {
                        let _ = ctx.queue.push_back(block);
                    }
                    futile += 1;
                    if futile >= PUMP_MAX_FUTILE {
                        break;
                    }
                    continue;
                }
                status.active_requests.insert(
                    (block.piece, block.offset),
                    ActiveRequest {
                        length: block.length,
                        requested_at: Instant::now(),
                    },
                );
                status.pending_count += 1;
            }
            ctx.store.add_requested(block.piece, block.offset)?;

            if let Err(err) =
                handle.send(&Message::request(block.piece, block.offset, block.length))
            {
                // undo the reservation and put the block back first in line
                if let Ok(mut status) = handle.lock_status() {
                    status.active_requests.remove(&(block.piece, block.offset));
                    status.pending_count = status.pending_count.saturating_sub(1);
                }
                let _ = ctx.store.remove_requested(block.piece, block.offset);
                let _ = ctx.queue.push_front(block);
                return Err(err);
            }

            // endgame sends are redundant by design: keep a copy queued so
            // other sessions pick the block up too
            if endgame {
                ctx.queue.push_back(block)?;
            }
        }
        Ok(())
    }
}

/// Keeps long-lived peer sockets from silently dying behind NATs.
fn enable_keep_alive(stream: &TcpStream) {
    if let Err(err) = setsockopt(stream.as_raw_fd(), KeepAlive, &true) {
        debug!("enabling TCP keep-alive failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cfg::Cfg;
    use crate::file_layer::FileLayer;
    use crate::piece_store::PieceStore;
    use crate::request_queue::RequestQueue;
    use crate::swarm::ctx::PoolEvent;
    use crate::swarm::registry::SessionRegistry;
    use crate::torrent_parser::info::Info;
    use crate::torrent_parser::torrent::Torrent;
    use sha1::{Digest, Sha1};
    use std::fs;
    use std::net::TcpListener;
    use std::sync::mpsc::{self, Receiver};
    use std::thread;

    #[test]
    fn test_downloads_a_single_piece_from_a_seeder() {
        let dir = "./test_session_single_piece";
        let _ = fs::remove_dir_all(dir);
        let payload: Vec<u8> = (0..16384u32).map(|index| (index % 251) as u8).collect();
        let (ctx, _events) = create_ctx(&payload, dir);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (have_tx, have_rx) = mpsc::channel();

        let seeder_payload = payload.clone();
        let seeder_hash = ctx.info_hash.clone();
        let seeder = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            // handshake exchange
            let mut handshake = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut handshake).unwrap();
            let reply = Handshake::new(seeder_hash, b"-FAKE01-abcdefghijkl".to_vec());
            stream.write_all(&reply.as_bytes()).unwrap();

            // we have the only piece; let the leecher request it
            stream
                .write_all(&Message::bitfield(vec![0x80]).as_bytes())
                .unwrap();
            stream.write_all(&Message::unchoke().as_bytes()).unwrap();

            while let Some((id, payload)) = read_frame(&mut stream) {
                match id {
                    6 => {
                        let request = Request::from_bytes(&payload);
                        let from = request.begin as usize;
                        let to = from + request.length as usize;
                        let piece =
                            Message::piece(request.index, request.begin, &seeder_payload[from..to]);
                        stream.write_all(&piece.as_bytes()).unwrap();
                    }
                    4 => {
                        have_tx.send(u32::from_be_bytes([
                            payload[0], payload[1], payload[2], payload[3],
                        ]))
                        .unwrap();
                        return;
                    }
                    _ => {}
                }
            }
        });

        let choking = Arc::new(ChokingController::new(ctx.registry.clone()));
        let session_ctx = ctx.clone();
        let session = thread::spawn(move || {
            PeerSession::run_outgoing(
                BtPeer::new("127.0.0.1".to_string(), port),
                session_ctx,
                choking,
            );
        });

        wait_until(|| ctx.store.is_done());
        assert!(ctx.store.is_done());

        // the HAVE went out only after verification
        assert_eq!(have_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        assert_eq!(ctx.store.bitfield().unwrap(), vec![0x80]);

        seeder.join().unwrap();
        // the seeder closing its socket ends the session
        session.join().unwrap();
        assert!(ctx.registry.is_empty());

        let on_disk = fs::read(format!("{}/single.bin", dir)).unwrap();
        assert_eq!(on_disk, payload);
        assert_eq!(
            ctx.downloaded.load(std::sync::atomic::Ordering::Relaxed),
            16384
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_serves_a_verified_piece_to_a_leecher() {
        let dir = "./test_session_serves_upload";
        let _ = fs::remove_dir_all(dir);
        let payload: Vec<u8> = (0..16384u32).map(|index| (index % 199) as u8).collect();
        let (ctx, _events) = create_ctx(&payload, dir);

        // we already hold the verified piece
        ctx.files.write_block(0, 0, &payload).unwrap();
        ctx.store.add_received(0, 0, &payload).unwrap();
        ctx.store.try_finalize(0).unwrap();
        assert!(ctx.store.is_done());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let leecher_hash = ctx.info_hash.clone();
        let expected = payload.clone();
        let leecher = thread::spawn(move || {
            let mut stream = TcpStream::connect(address).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            let hello = Handshake::new(leecher_hash, b"-FAKE02-abcdefghijkl".to_vec());
            stream.write_all(&hello.as_bytes()).unwrap();
            let mut handshake = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut handshake).unwrap();

            // wait to be unchoked, then ask for the block
            while let Some((id, _)) = read_frame(&mut stream) {
                if id == 1 {
                    break;
                }
            }
            stream
                .write_all(&Message::request(0, 0, 16384).as_bytes())
                .unwrap();

            while let Some((id, payload)) = read_frame(&mut stream) {
                if id == 7 {
                    assert_eq!(&payload[8..], &expected[..]);
                    return;
                }
            }
            panic!("never received the piece");
        });

        // play the server side: consume the handshake, reply, hand off
        let (mut stream, _) = listener.accept().unwrap();
        let mut handshake = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut handshake).unwrap();
        let remote = Handshake::from_bytes(&handshake).unwrap();
        let ours = Handshake::new(ctx.info_hash.clone(), ctx.client_peer_id.as_bytes().to_vec());
        stream.write_all(&ours.as_bytes()).unwrap();

        let choking = Arc::new(ChokingController::new(ctx.registry.clone()));
        let session_ctx = ctx.clone();
        let session =
            thread::spawn(move || PeerSession::run_incoming(stream, remote, session_ctx, choking));

        leecher.join().unwrap();
        wait_until(|| ctx.uploaded.load(std::sync::atomic::Ordering::Relaxed) == 16384);
        assert_eq!(
            ctx.uploaded.load(std::sync::atomic::Ordering::Relaxed),
            16384
        );

        ctx.request_shutdown();
        session.join().unwrap();
        fs::remove_dir_all(dir).unwrap();
    }

    // Auxiliary functions

    fn create_ctx(payload: &[u8], dir: &str) -> (Arc<SwarmCtx>, Receiver<PoolEvent>) {
        let torrent = Torrent {
            announce_url: "http://tracker.example/announce".to_string(),
            info: Info {
                length: payload.len() as i64,
                name: "single.bin".to_string(),
                piece_length: payload.len() as i64,
                pieces: Sha1::digest(payload).to_vec(),
                files: vec![],
            },
            info_hash: "aa".repeat(20),
        };

        let files = Arc::new(FileLayer::new(&torrent, dir).unwrap());
        let store = Arc::new(PieceStore::new(&torrent).unwrap());
        let queue = Arc::new(RequestQueue::new());
        queue.enqueue_piece(0, payload.len() as u32).unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let info_hash = torrent.info_hash_bytes().unwrap();
        let (events_tx, events_rx) = mpsc::channel();

        let ctx = Arc::new(SwarmCtx::new(
            Arc::new(torrent),
            Cfg::default(),
            store,
            queue,
            registry,
            files,
            "-qB4250-testtesttest".to_string(),
            info_hash,
            events_tx,
        ));
        (ctx, events_rx)
    }

    /// Reads one length-prefixed frame, skipping keep-alives. Returns the
    /// message ID and its payload, or `None` once the stream ends.
    fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        loop {
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).ok()?;
            let length = u32::from_be_bytes(prefix) as usize;
            if length == 0 {
                continue;
            }
            let mut frame = vec![0u8; length];
            stream.read_exact(&mut frame).ok()?;
            let payload = frame.split_off(1);
            return Some((frame[0], payload));
        }
    }

    fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}
