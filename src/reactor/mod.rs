//! A single-threaded readiness reactor.
//!
//! The reactor multiplexes three kinds of sources over one OS facility
//! (kqueue on BSD/Darwin, epoll on Linux): repeating interval timers,
//! caller-triggered user events, and loopback TCP servers together with the
//! peer connections they accept. Sources are owned by the reactor under
//! caller-supplied 16-bit ids, unique within their kind, and every callback
//! runs on the reactor thread with `&mut Reactor` in hand, so callbacks may
//! freely register or remove sources, including the one currently firing.
//!
//! Removal is two-phase: `remove_*` detaches the record at once (`has_*`
//! immediately reports false) but parks it, descriptors still open, on a
//! deferred-free list that is drained only after the in-flight dispatch
//! batch completes. Stale batch entries are recognized by a registration
//! sequence number and skipped. Replacing this protocol with an immediate
//! free would be a correctness regression.

mod backend;

use std::cell::RefCell;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use backend::{
    Backend, Filter, SlotEvent, SourceKind, TimerSource, Token, UserSource, EVENTS_PER_BATCH,
};

/// A caller-supplied event identifier, unique within its kind.
pub type EventId = u16;

/// Reserved for the internal stop wakeup.
const INTERNAL_EVENT_ID: EventId = EventId::MAX;

const RECEIVE_BUFFER_SIZE: usize = 1024;

type TimerCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId)>>;
type UserCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId)>>;
type ShouldAcceptCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId, SocketAddr) -> bool>>;
type DidAcceptCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId, EventId, SocketAddr)>>;
type DataCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId, EventId, &[u8])>>;
type DisconnectCallback = Rc<RefCell<dyn FnMut(&mut Reactor, EventId, EventId)>>;

/// Describes a loopback TCP server to register with [`Reactor::add_server`].
///
/// All four callbacks are optional. `did_receive_data` and
/// `peer_did_disconnect` are inherited by every peer the server accepts.
pub struct ServerDescriptor {
    id: EventId,
    port: u16,
    should_accept: Option<ShouldAcceptCallback>,
    did_accept: Option<DidAcceptCallback>,
    did_receive_data: Option<DataCallback>,
    peer_did_disconnect: Option<DisconnectCallback>,
}

impl ServerDescriptor {
    pub fn new(id: EventId, port: u16) -> Self {
        Self {
            id,
            port,
            should_accept: None,
            did_accept: None,
            did_receive_data: None,
            peer_did_disconnect: None,
        }
    }

    /// Veto incoming connections; returning `false` closes the client.
    pub fn should_accept(
        mut self,
        f: impl FnMut(&mut Reactor, EventId, SocketAddr) -> bool + 'static,
    ) -> Self {
        self.should_accept = Some(Rc::new(RefCell::new(f)));
        self
    }

    /// Called with `(server_id, peer_id, remote_addr)` once a peer is tracked.
    pub fn did_accept(
        mut self,
        f: impl FnMut(&mut Reactor, EventId, EventId, SocketAddr) + 'static,
    ) -> Self {
        self.did_accept = Some(Rc::new(RefCell::new(f)));
        self
    }

    /// Called with the bytes read from a peer. The slice is only valid for
    /// the duration of the call; the buffer is reused on the next read.
    pub fn did_receive_data(
        mut self,
        f: impl FnMut(&mut Reactor, EventId, EventId, &[u8]) + 'static,
    ) -> Self {
        self.did_receive_data = Some(Rc::new(RefCell::new(f)));
        self
    }

    pub fn peer_did_disconnect(
        mut self,
        f: impl FnMut(&mut Reactor, EventId, EventId) + 'static,
    ) -> Self {
        self.peer_did_disconnect = Some(Rc::new(RefCell::new(f)));
        self
    }
}

struct ServerRecord {
    listener: TcpListener,
    seq: u32,
    should_accept: Option<ShouldAcceptCallback>,
    did_accept: Option<DidAcceptCallback>,
    did_receive_data: Option<DataCallback>,
    peer_did_disconnect: Option<DisconnectCallback>,
}

struct PeerRecord {
    stream: TcpStream,
    server_id: EventId,
    seq: u32,
    receive_buffer: Option<Rc<RefCell<Box<[u8]>>>>,
    did_receive_data: Option<DataCallback>,
    peer_did_disconnect: Option<DisconnectCallback>,
}

struct TimerRecord {
    source: TimerSource,
    seq: u32,
    callback: TimerCallback,
}

struct UserRecord {
    source: UserSource,
    seq: u32,
    callback: UserCallback,
}

/// A record detached from its registry but not yet released. Dropping it
/// closes every descriptor it owns, which also drops the kernel registration.
#[allow(dead_code)] // held, not read: dropping at drain time is the release
enum Retired {
    Server(ServerRecord),
    Peer(PeerRecord),
    Timer(TimerRecord),
    User(UserRecord),
}

/// The event loop. See the module documentation.
pub struct Reactor {
    backend: Backend,
    servers: FxHashMap<EventId, ServerRecord>,
    peers: FxHashMap<EventId, PeerRecord>,
    timers: FxHashMap<EventId, TimerRecord>,
    user_events: FxHashMap<EventId, UserRecord>,
    retired: Vec<Retired>,
    keep_running: bool,
    dispatching: bool,
    next_peer_id: EventId,
    next_seq: u32,
}

impl Reactor {
    /// Opens the OS multiplexor and registers the internal stop wakeup.
    pub fn new() -> io::Result<Self> {
        let mut reactor = Self {
            backend: Backend::new()?,
            servers: FxHashMap::default(),
            peers: FxHashMap::default(),
            timers: FxHashMap::default(),
            user_events: FxHashMap::default(),
            retired: Vec::new(),
            keep_running: false,
            dispatching: false,
            next_peer_id: 0,
            next_seq: 0,
        };
        reactor.add_user_event_record(
            INTERNAL_EVENT_ID,
            Rc::new(RefCell::new(|reactor: &mut Reactor, _id: EventId| {
                reactor.keep_running = false;
            })),
        )?;
        Ok(reactor)
    }

    // MARK: - Control

    /// Dispatches events until [`stop`](Self::stop) is triggered.
    pub fn run(&mut self) -> io::Result<()> {
        self.keep_running = true;
        while self.keep_running {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Waits for one batch of events (up to the timeout; `None` blocks
    /// indefinitely, a zero duration polls), dispatches it, then releases
    /// every record retired during the batch.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if self.dispatching {
            warn!("run_once called from within a callback; ignoring");
            return Ok(());
        }

        let mut batch = [SlotEvent::EMPTY; EVENTS_PER_BATCH];
        let count = match self.backend.wait(timeout, &mut batch) {
            Ok(count) => count,
            Err(err) => {
                error!("failed to get the next events: {err}");
                return Err(err);
            }
        };

        self.dispatching = true;
        for slot in batch.iter().take(count).copied() {
            self.dispatch(slot);
        }
        self.dispatching = false;

        self.retired.clear();
        Ok(())
    }

    /// Requests that [`run`](Self::run) return. Safe to call from any
    /// callback; takes effect at the next wakeup at the latest.
    pub fn stop(&self) {
        self.trigger_user_event(INTERNAL_EVENT_ID);
    }

    fn dispatch(&mut self, slot: SlotEvent) {
        match (slot.filter, slot.token.kind) {
            (Filter::Read, SourceKind::Server) => self.handle_server_readable(slot.token),
            (Filter::Read, SourceKind::Peer) if slot.eof => {
                self.handle_peer_disconnect(slot.token)
            }
            (Filter::Read, SourceKind::Peer) => self.handle_peer_readable(slot.token),
            (Filter::Timer, SourceKind::Timer) => self.handle_timer_fired(slot.token),
            (Filter::User, SourceKind::User) => self.handle_user_fired(slot.token),
            (filter, _) => warn!("unhandled {filter:?} event for {}", slot.token),
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    // MARK: - Servers

    /// Binds a non-blocking listener on `127.0.0.1:port` and watches it for
    /// incoming connections.
    pub fn add_server(&mut self, descriptor: ServerDescriptor) -> io::Result<()> {
        let id = descriptor.id;
        if id == INTERNAL_EVENT_ID {
            warn!("server id {id} is reserved");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        if self.servers.contains_key(&id) {
            warn!("server {id} already exists");
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        let listener = bind_loopback(descriptor.port).map_err(|err| {
            error!("failed to open a socket for server {id}: {err}");
            err
        })?;
        listener.set_nonblocking(true)?;

        let seq = self.next_seq();
        let token = Token {
            kind: SourceKind::Server,
            id,
            seq,
        };
        self.backend
            .register_read(listener.as_fd(), token)
            .map_err(|err| {
                error!("failed to watch server {id}: {err}");
                err
            })?;

        self.servers.insert(
            id,
            ServerRecord {
                listener,
                seq,
                should_accept: descriptor.should_accept,
                did_accept: descriptor.did_accept,
                did_receive_data: descriptor.did_receive_data,
                peer_did_disconnect: descriptor.peer_did_disconnect,
            },
        );
        Ok(())
    }

    pub fn has_server(&self, id: EventId) -> bool {
        self.servers.contains_key(&id)
    }

    /// Removes a server, dropping all of its peers first. The listening
    /// socket stays open until the deferred-free drain.
    pub fn remove_server(&mut self, id: EventId) {
        let Some(record) = self.servers.remove(&id) else {
            warn!("cannot remove server {id}, which does not exist");
            return;
        };

        let peer_ids: Vec<EventId> = self
            .peers
            .iter()
            .filter_map(|(peer_id, peer)| (peer.server_id == id).then_some(*peer_id))
            .collect();
        for peer_id in peer_ids {
            self.drop_peer(peer_id);
        }

        // The listener was registered for read readiness; that is the
        // registration to delete.
        if let Err(err) = self.backend.unregister_read(record.listener.as_fd()) {
            error!("failed to remove server {id} from the backend: {err}");
        }
        self.retired.push(Retired::Server(record));
    }

    fn handle_server_readable(&mut self, token: Token) {
        let id = token.id;
        let (accepted, should_accept, did_accept, did_receive_data, peer_did_disconnect) =
            match self.servers.get(&id) {
                Some(record) if record.seq == token.seq => (
                    record.listener.accept(),
                    record.should_accept.clone(),
                    record.did_accept.clone(),
                    record.did_receive_data.clone(),
                    record.peer_did_disconnect.clone(),
                ),
                _ => return,
            };

        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!("spurious accept wakeup on server {id}");
                return;
            }
            Err(err) => {
                error!("failed to accept client on server {id}: {err}");
                return;
            }
        };

        if let Some(callback) = should_accept {
            if !(&mut *callback.borrow_mut())(self, id, remote) {
                debug!("new client not accepted on server {id}");
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        }

        if let Err(err) = stream.set_nonblocking(true) {
            error!("failed to make peer socket non-blocking for server {id}: {err}");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let peer_id = self.allocate_peer_id();
        let seq = self.next_seq();
        let peer_token = Token {
            kind: SourceKind::Peer,
            id: peer_id,
            seq,
        };
        if let Err(err) = self.backend.register_read(stream.as_fd(), peer_token) {
            error!("failed to watch peer {peer_id} of server {id}: {err}");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        self.peers.insert(
            peer_id,
            PeerRecord {
                stream,
                server_id: id,
                seq,
                receive_buffer: None,
                did_receive_data,
                peer_did_disconnect,
            },
        );
        debug!("new client on server {id}");

        if let Some(callback) = did_accept {
            (&mut *callback.borrow_mut())(self, id, peer_id, remote);
        }
    }

    /// Smallest unused peer id at or after the monotonic counter, never the
    /// reserved id.
    fn allocate_peer_id(&mut self) -> EventId {
        let mut candidate = self.next_peer_id;
        while candidate == INTERNAL_EVENT_ID || self.peers.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_peer_id = candidate.wrapping_add(1);
        candidate
    }

    fn handle_peer_readable(&mut self, token: Token) {
        let peer_id = token.id;
        let (read_result, server_id, buffer, did_receive_data) = {
            let Some(record) = self.peers.get_mut(&peer_id) else {
                return;
            };
            if record.seq != token.seq {
                return;
            }
            let buffer = Rc::clone(record.receive_buffer.get_or_insert_with(|| {
                Rc::new(RefCell::new(
                    vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
                ))
            }));
            let read_result = {
                let mut buf = buffer.borrow_mut();
                record.stream.read(&mut buf[..])
            };
            (
                read_result,
                record.server_id,
                buffer,
                record.did_receive_data.clone(),
            )
        };

        match read_result {
            Ok(0) => self.handle_peer_disconnect(token),
            Ok(count) => {
                if let Some(callback) = did_receive_data {
                    let data = buffer.borrow();
                    (&mut *callback.borrow_mut())(self, server_id, peer_id, &data[..count]);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("failed to read from peer {peer_id} of server {server_id}: {err}");
                self.drop_peer(peer_id);
            }
        }
    }

    fn handle_peer_disconnect(&mut self, token: Token) {
        let peer_id = token.id;
        let Some(record) = self.peers.remove(&peer_id) else {
            return;
        };
        if record.seq != token.seq {
            self.peers.insert(peer_id, record);
            return;
        }

        info!("peer {peer_id} of server {} disconnected", record.server_id);
        let server_id = record.server_id;
        let callback = record.peer_did_disconnect.clone();
        // Closing the socket at drain time drops the kernel registration
        // with it; no explicit delete is needed for peers.
        self.retired.push(Retired::Peer(record));

        if let Some(callback) = callback {
            (&mut *callback.borrow_mut())(self, server_id, peer_id);
        }
    }

    /// Detaches a peer without invoking its disconnect callback.
    fn drop_peer(&mut self, peer_id: EventId) {
        if let Some(record) = self.peers.remove(&peer_id) {
            let _ = record.stream.shutdown(Shutdown::Both);
            self.retired.push(Retired::Peer(record));
        }
    }

    // MARK: - Timers

    /// Registers a timer that fires every `interval` until removed.
    pub fn add_timer<F>(&mut self, id: EventId, interval: Duration, callback: F) -> io::Result<()>
    where
        F: FnMut(&mut Reactor, EventId) + 'static,
    {
        if id == INTERNAL_EVENT_ID {
            warn!("timer id {id} is reserved");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        if self.timers.contains_key(&id) {
            warn!("timer {id} already exists");
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        let seq = self.next_seq();
        let token = Token {
            kind: SourceKind::Timer,
            id,
            seq,
        };
        let source = self.backend.add_timer(id, interval, token).map_err(|err| {
            error!("failed to add timer {id}: {err}");
            err
        })?;
        self.timers.insert(
            id,
            TimerRecord {
                source,
                seq,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(())
    }

    pub fn has_timer(&self, id: EventId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn remove_timer(&mut self, id: EventId) {
        let Some(record) = self.timers.remove(&id) else {
            warn!("cannot remove timer {id}, which does not exist");
            return;
        };
        if let Err(err) = self.backend.remove_timer(&record.source, id) {
            error!("failed to remove timer {id} from the backend: {err}");
        }
        self.retired.push(Retired::Timer(record));
    }

    fn handle_timer_fired(&mut self, token: Token) {
        let id = token.id;
        let callback = match self.timers.get(&id) {
            Some(record) if record.seq == token.seq => {
                self.backend.acknowledge_timer(&record.source, id);
                Rc::clone(&record.callback)
            }
            _ => return,
        };
        (&mut *callback.borrow_mut())(self, id);
    }

    // MARK: - User events

    /// Registers a caller-triggerable wakeup. Triggers coalesce: any burst
    /// between two dispatches produces exactly one callback invocation.
    pub fn add_user_event<F>(&mut self, id: EventId, callback: F) -> io::Result<()>
    where
        F: FnMut(&mut Reactor, EventId) + 'static,
    {
        if id == INTERNAL_EVENT_ID {
            warn!("user event id {id} is reserved");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        self.add_user_event_record(id, Rc::new(RefCell::new(callback)))
    }

    fn add_user_event_record(&mut self, id: EventId, callback: UserCallback) -> io::Result<()> {
        if self.user_events.contains_key(&id) {
            warn!("user event {id} already exists");
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        let seq = self.next_seq();
        let token = Token {
            kind: SourceKind::User,
            id,
            seq,
        };
        let source = self.backend.add_user(id, token).map_err(|err| {
            error!("failed to add user event {id}: {err}");
            err
        })?;
        self.user_events.insert(
            id,
            UserRecord {
                source,
                seq,
                callback,
            },
        );
        Ok(())
    }

    pub fn has_user_event(&self, id: EventId) -> bool {
        self.user_events.contains_key(&id)
    }

    pub fn remove_user_event(&mut self, id: EventId) {
        if id == INTERNAL_EVENT_ID {
            warn!("user event id {id} is reserved");
            return;
        }
        let Some(record) = self.user_events.remove(&id) else {
            warn!("cannot remove user event {id}, which does not exist");
            return;
        };
        if let Err(err) = self.backend.remove_user(&record.source, id) {
            error!("failed to remove user event {id} from the backend: {err}");
        }
        self.retired.push(Retired::User(record));
    }

    pub fn trigger_user_event(&self, id: EventId) {
        let Some(record) = self.user_events.get(&id) else {
            warn!("cannot trigger user event {id}, which does not exist");
            return;
        };
        let token = Token {
            kind: SourceKind::User,
            id,
            seq: record.seq,
        };
        if let Err(err) = self.backend.trigger_user(&record.source, id, token) {
            error!("failed to trigger user event {id}: {err}");
        }
    }

    fn handle_user_fired(&mut self, token: Token) {
        let id = token.id;
        let callback = match self.user_events.get(&id) {
            Some(record) if record.seq == token.seq => Rc::clone(&record.callback),
            _ => return,
        };
        (&mut *callback.borrow_mut())(self, id);

        // The callback may have removed the event; only a live registration
        // needs its trigger cleared.
        if let Some(record) = self.user_events.get(&id) {
            if record.seq == token.seq {
                self.backend.acknowledge_user(&record.source, id, token);
            }
        }
    }
}

fn bind_loopback(port: u16) -> io::Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(io::Error::from)?;
    let address = SockaddrIn::new(127, 0, 0, 1, port);
    socket::bind(fd.as_raw_fd(), &address).map_err(io::Error::from)?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;
    Ok(TcpListener::from(fd))
}
