//! A D-Bus connection over one byte stream.
//!
//! A [`Connection`] authenticates its stream, numbers and writes outgoing
//! messages, frames incoming bytes into [`Message`]s and dispatches them:
//!
//! 1. a message whose reply serial matches a pending call resolves it,
//! 2. filters added with [`Connection::add_filter`] run in order until one
//!    claims the message,
//! 3. signals go to every matching signal handler, in registration order,
//! 4. method calls go to the [`Interface`] registered under their interface
//!    name, then to the built-in `Peer` and `Introspectable` methods,
//! 5. anything left gets an `UnknownMethod` error if it wants a reply and
//!    is logged otherwise.
//!
//! Messages that arrive while a handler is running (for instance while it
//! waits for the reply to a nested call) are queued and dispatched in
//! arrival order once it returns. Replies to pending calls are never queued.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::address::Address;
use crate::auth;
use crate::error::{Error, ErrorKind, Result};
use crate::eventloop::{LoopHandle, SourceId};
use crate::interface::{introspect_xml, machine_id, unknown_method_text, Call, Interface};
use crate::match_rule::MatchRule;
use crate::message::{hexdump, Message};
use crate::protocol::{
    Flags, MessageType, ERROR_FAILED, ERROR_UNKNOWN_METHOD, INTROSPECTABLE_INTERFACE,
    PEER_INTERFACE, PREFIX_LENGTH,
};
use crate::ringbuf::{RingBuffer, CHUNK_SIZE};
use crate::stream::{self, wait_readable, wait_writable, Stream};
use crate::value::Value;

/// `ConnectionConfig` holds the tunables of a [`Connection`].
///
/// Examples:
///
/// ```rust
/// let c = wvdbus::ConnectionConfig::default();
/// assert_eq!(c.call_timeout, Some(std::time::Duration::from_secs(25)));
/// assert!(c.say_hello);
/// assert!(!wvdbus::ConnectionConfig::peer_to_peer().say_hello);
/// ```
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// How long a blocking call waits for its reply; `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Upper bound on the whole authentication exchange.
    pub auth_timeout: Duration,
    /// Bytes requested from the socket per read.
    pub read_chunk: usize,
    /// Call `org.freedesktop.DBus.Hello` after authenticating.
    pub say_hello: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            call_timeout: Some(Duration::from_secs(25)),
            auth_timeout: Duration::from_secs(5),
            read_chunk: CHUNK_SIZE,
            say_hello: true,
        }
    }
}

impl ConnectionConfig {
    /// Defaults for a direct connection without a bus daemon.
    pub fn peer_to_peer() -> Self {
        ConnectionConfig {
            say_hello: false,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Unauthenticated,
    Authenticating,
    Ready,
    Closed,
}

/// Identifies a filter or signal handler for removal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandlerId(u64);

pub type ReplyCallback = Box<dyn FnOnce(&mut Connection, Result<Message>) + Send + 'static>;
type Filter = Box<dyn FnMut(&mut Connection, &Message) -> Result<bool> + Send + 'static>;
type SignalHandler = Box<dyn FnMut(&mut Connection, &Message) -> Result<()> + Send + 'static>;
type CloseCallback = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum PendingCall {
    Blocking,
    Callback(ReplyCallback),
}

/// The event loop an attached connection is registered with.
struct Watch {
    handle: LoopHandle,
    fd: RawFd,
    conn: Weak<Mutex<Connection>>,
    writing: bool,
}

pub struct Connection {
    stream: Option<Box<dyn Stream>>,
    config: ConnectionConfig,
    state: State,
    guid: Option<String>,
    pub(crate) unique_name: Option<String>,
    peer_uid: Option<u32>,
    next_serial: u32,
    pending: HashMap<u32, PendingCall>,
    replies: HashMap<u32, Result<Message>>,
    filters: Vec<(HandlerId, Filter)>,
    signals: Vec<(HandlerId, MatchRule, SignalHandler)>,
    removed: HashSet<HandlerId>,
    next_handler: u64,
    interfaces: BTreeMap<String, Arc<dyn Interface>>,
    deferred: VecDeque<Message>,
    dispatching: bool,
    inbuf: RingBuffer,
    outbuf: RingBuffer,
    read_buf: Vec<u8>,
    on_close: Vec<CloseCallback>,
    watch: Option<Watch>,
}

impl Connection {
    fn with_stream(stream: Box<dyn Stream>, config: ConnectionConfig) -> Self {
        Connection {
            stream: Some(stream),
            config,
            state: State::Unauthenticated,
            guid: None,
            unique_name: None,
            peer_uid: None,
            next_serial: 1,
            pending: HashMap::new(),
            replies: HashMap::new(),
            filters: Vec::new(),
            signals: Vec::new(),
            removed: HashSet::new(),
            next_handler: 1,
            interfaces: BTreeMap::new(),
            deferred: VecDeque::new(),
            dispatching: false,
            inbuf: RingBuffer::new(),
            outbuf: RingBuffer::new(),
            read_buf: Vec::new(),
            on_close: Vec::new(),
            watch: None,
        }
    }

    /// Authenticate a connected stream as a client.
    ///
    /// Sends `Hello` afterwards if `config.say_hello` is set.
    pub fn new(stream: Box<dyn Stream>, config: ConnectionConfig) -> Result<Self> {
        let mut conn = Connection::with_stream(stream, config);
        conn.state = State::Authenticating;

        let timeout = conn.config.auth_timeout;
        let result = match conn.stream.as_mut() {
            Some(s) => auth::client_handshake(s.as_mut(), timeout),
            None => Err(ErrorKind::ConnectionClosed.into()),
        };
        match result {
            Ok(guid) => conn.guid = Some(guid),
            Err(e) => {
                conn.close();
                return Err(e);
            }
        }
        conn.become_ready()?;

        if conn.config.say_hello {
            conn.hello()?;
        }
        Ok(conn)
    }

    /// Authenticate an accepted stream as the server, announcing `guid`.
    pub fn new_server(stream: Box<dyn Stream>, guid: &str, config: ConnectionConfig) -> Result<Self> {
        let mut conn = Connection::with_stream(stream, config);
        conn.state = State::Authenticating;

        let timeout = conn.config.auth_timeout;
        let result = match conn.stream.as_mut() {
            Some(s) => auth::server_handshake(s.as_mut(), guid, timeout),
            None => Err(ErrorKind::ConnectionClosed.into()),
        };
        match result {
            Ok(uid) => conn.peer_uid = Some(uid),
            Err(e) => {
                conn.close();
                return Err(e);
            }
        }
        conn.guid = Some(guid.to_owned());
        conn.become_ready()?;
        Ok(conn)
    }

    /// Connect to the first reachable entry of an address list.
    pub fn open(address: &str, config: ConnectionConfig) -> Result<Self> {
        let addresses = Address::parse_list(address)?;
        Connection::new(stream::connect_any(&addresses)?, config)
    }

    /// Connect to the session bus.
    pub fn session() -> Result<Self> {
        let addresses = Address::session()?;
        Connection::new(stream::connect_any(&addresses)?, ConnectionConfig::default())
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        let addresses = Address::system()?;
        Connection::new(stream::connect_any(&addresses)?, ConnectionConfig::default())
    }

    fn become_ready(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(s) => s.set_nonblocking(true)?,
            None => return Err(ErrorKind::ConnectionClosed.into()),
        }
        self.state = State::Ready;
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The GUID the server announced during authentication.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// The unique name assigned by the bus in reply to `Hello`.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// For server connections, the uid the client authenticated as.
    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Bytes queued for the socket but not yet written.
    pub fn pending_output(&self) -> usize {
        self.outbuf.size()
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.as_raw_fd()
            .ok_or_else(|| Error::new(ErrorKind::ConnectionClosed))
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            State::Closed => Err(ErrorKind::ConnectionClosed.into()),
            State::Unauthenticated | State::Authenticating => {
                Err(ErrorKind::NotAuthenticated.into())
            }
        }
    }

    fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        serial
    }

    /// Number and write `msg`; returns its serial.
    pub fn send(&mut self, msg: &mut Message) -> Result<u32> {
        self.ensure_ready()?;
        let serial = self.next_serial();
        msg.set_serial(serial);

        let header = msg.header_bytes()?;
        log::debug!("send {}", msg);
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("header:{}", hexdump(&header));
            log::trace!("body:{}", hexdump(msg.body_bytes()));
        }

        self.outbuf.append(&header);
        self.outbuf.append(msg.body_bytes());
        if self.watch.is_some() {
            if !self.flush_some()? {
                self.watch_writable();
            }
        } else {
            self.flush()?;
        }
        Ok(serial)
    }

    /// Write all buffered output, waiting for the socket as needed.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_until(None)
    }

    fn flush_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        while !self.flush_some()? {
            let left = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ErrorKind::Timeout.into());
                    }
                    Some(d - now)
                }
            };
            wait_writable(self.raw_fd()?, left)?;
        }
        Ok(())
    }

    /// Let the event loop finish writing the output buffer.
    fn watch_writable(&mut self) {
        let Some(watch) = self.watch.as_mut() else {
            return;
        };
        if watch.writing {
            return;
        }
        watch.writing = true;
        let conn = watch.conn.clone();
        watch.handle.register_write(watch.fd, move |_| {
            let Some(conn) = conn.upgrade() else {
                return Ok(false);
            };
            let mut c = conn.lock();
            let result = c.flush_some();
            match result {
                Ok(false) => Ok(true),
                Ok(true) => {
                    if let Some(w) = c.watch.as_mut() {
                        w.writing = false;
                    }
                    Ok(false)
                }
                Err(_) if c.state() == State::Closed => Ok(false),
                Err(e) => Err(e),
            }
        });
    }

    /// Write as much buffered output as the socket accepts without blocking.
    ///
    /// Returns `true` once nothing is left.
    pub fn flush_some(&mut self) -> Result<bool> {
        loop {
            if self.outbuf.is_empty() {
                return Ok(true);
            }
            let result = match self.stream.as_mut() {
                Some(s) => {
                    let slices = self.outbuf.io_slices();
                    s.write_vectored(&slices)
                }
                None => return Err(ErrorKind::ConnectionClosed.into()),
            };
            match result {
                Ok(0) => {
                    self.close();
                    return Err(ErrorKind::ConnectionClosed.into());
                }
                Ok(n) => {
                    self.outbuf.discard(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Move whatever the socket has into the input buffer.
    ///
    /// Returns `false` if nothing was available.
    fn fill(&mut self) -> Result<bool> {
        let chunk = self.config.read_chunk.max(PREFIX_LENGTH);
        if self.read_buf.len() != chunk {
            self.read_buf.resize(chunk, 0);
        }
        loop {
            let result = match self.stream.as_mut() {
                Some(s) => s.read(&mut self.read_buf),
                None => return Err(ErrorKind::ConnectionClosed.into()),
            };
            match result {
                Ok(0) => {
                    log::debug!("peer closed the connection");
                    self.close();
                    return Err(ErrorKind::ConnectionClosed.into());
                }
                Ok(n) => {
                    self.inbuf.append(&self.read_buf[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    /// Cut one complete message off the input buffer, if there is one.
    fn try_parse(&mut self) -> Result<Option<Message>> {
        let mut prefix = [0u8; PREFIX_LENGTH];
        if !self.inbuf.peek(&mut prefix) {
            return Ok(None);
        }
        let needed = match Message::bytes_needed(&prefix) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };
        if self.inbuf.size() < needed {
            return Ok(None);
        }

        let mut frame = vec![0u8; needed];
        self.inbuf.retrieve(&mut frame);
        match Message::from_bytes(&frame) {
            Ok(m) => {
                log::trace!("recv:{}", hexdump(&frame));
                log::debug!("recv {}", m);
                Ok(Some(m))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Close after a decode error; stream boundaries can't be trusted anymore.
    fn fail(&mut self, e: Error) -> Error {
        log::warn!("closing connection: {}", e);
        self.close();
        e
    }

    /// Read the next complete message without dispatching it.
    ///
    /// Waits up to `timeout` (`None` waits forever) and returns `None` if
    /// no complete message arrived in time.
    pub fn read_message(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.ensure_ready()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(m) = self.try_parse()? {
                return Ok(Some(m));
            }
            if self.fill()? {
                continue;
            }
            let left = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    Some(d - now)
                }
            };
            wait_readable(self.raw_fd()?, left)?;
        }
    }

    /// Read and dispatch one message; `false` if none arrived in time.
    pub fn handle_message(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match self.read_message(timeout)? {
            Some(m) => {
                self.dispatch(m)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait up to `timeout` for a message, then dispatch everything that is
    /// already available. Returns the number of messages handled.
    pub fn handle_messages(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut n = 0;
        if self.handle_message(timeout)? {
            n += 1;
            while self.handle_message(Some(Duration::ZERO))? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Send `msg` and wait for its reply, up to `config.call_timeout`.
    ///
    /// An error reply is returned as a message; see [`Message::check`].
    pub fn send_and_wait(&mut self, msg: &mut Message) -> Result<Message> {
        let timeout = self.config.call_timeout;
        self.send_and_wait_timeout(msg, timeout)
    }

    /// Send `msg` and wait up to `timeout` for its reply.
    ///
    /// Other messages that arrive meanwhile are dispatched. On timeout the
    /// call is forgotten and a late reply is treated as unsolicited.
    pub fn send_and_wait_timeout(
        &mut self,
        msg: &mut Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        msg.flags.remove(Flags::NO_REPLY_EXPECTED);
        let serial = self.send(msg)?;
        self.pending.insert(serial, PendingCall::Blocking);

        let result = self.wait_for_reply(serial, timeout.map(|t| Instant::now() + t));
        if result.is_err() {
            self.pending.remove(&serial);
            self.replies.remove(&serial);
        }
        result
    }

    fn wait_for_reply(&mut self, serial: u32, deadline: Option<Instant>) -> Result<Message> {
        self.flush_until(deadline)?;
        loop {
            if let Some(reply) = self.replies.remove(&serial) {
                return reply;
            }
            if self.state == State::Closed {
                return Err(ErrorKind::ConnectionClosed.into());
            }
            let left = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(ErrorKind::Timeout.into());
                    }
                    Some(d - now)
                }
            };
            if let Some(m) = self.read_message(left)? {
                self.dispatch(m)?;
            }
        }
    }

    /// Send `msg`; `f` is called with the reply, or with an error if the
    /// connection closes first.
    pub fn send_async<F>(&mut self, msg: &mut Message, f: F) -> Result<u32>
    where
        F: FnOnce(&mut Connection, Result<Message>) + Send + 'static,
    {
        msg.flags.remove(Flags::NO_REPLY_EXPECTED);
        let serial = self.send(msg)?;
        self.pending.insert(serial, PendingCall::Callback(Box::new(f)));
        Ok(serial)
    }

    /// Forget a pending call; its callback is dropped without being called.
    pub fn cancel(&mut self, serial: u32) -> bool {
        self.pending.remove(&serial).is_some()
    }

    /// Call a method and wait for the reply, turning error replies into
    /// [`ErrorKind::DBusError`].
    pub fn call_method(
        &mut self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Message> {
        let mut msg = Message::method_call(destination, path, interface, member)?.with_args(args)?;
        let reply = self.send_and_wait(&mut msg)?;
        reply.error_result()?;
        Ok(reply)
    }

    fn next_handler_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        id
    }

    /// Add a filter that sees every message not answering a pending call.
    /// Returning `Ok(true)` claims the message.
    pub fn add_filter<F>(&mut self, f: F) -> HandlerId
    where
        F: FnMut(&mut Connection, &Message) -> Result<bool> + Send + 'static,
    {
        let id = self.next_handler_id();
        self.filters.push((id, Box::new(f)));
        id
    }

    /// Call `f` for every signal matching `rule`.
    ///
    /// This only affects local dispatch; use [`Connection::add_match`] to
    /// have the bus route the signals here.
    pub fn add_signal_handler<F>(&mut self, rule: MatchRule, f: F) -> HandlerId
    where
        F: FnMut(&mut Connection, &Message) -> Result<()> + Send + 'static,
    {
        let id = self.next_handler_id();
        self.signals.push((id, rule, Box::new(f)));
        id
    }

    /// Remove a filter or signal handler.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.filters.len() + self.signals.len();
        self.filters.retain(|(i, _)| *i != id);
        self.signals.retain(|(i, _, _)| *i != id);
        if before != self.filters.len() + self.signals.len() {
            return true;
        }
        if self.dispatching {
            // The handler may be running right now, outside of the lists.
            return self.removed.insert(id);
        }
        false
    }

    /// Serve method calls for `interface`, replacing any previous
    /// implementation with the same name.
    pub fn register_interface(&mut self, interface: Arc<dyn Interface>) {
        self.interfaces
            .insert(interface.get_name().to_owned(), interface);
    }

    pub fn unregister_interface(&mut self, name: &str) -> bool {
        self.interfaces.remove(name).is_some()
    }

    /// Run `f` once when the connection closes.
    pub fn on_close<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        if self.state == State::Closed {
            f(self);
        } else {
            self.on_close.push(Box::new(f));
        }
    }

    /// Dispatch one message as if it had just been received.
    pub fn dispatch(&mut self, msg: Message) -> Result<()> {
        if let Some(serial) = msg.reply_serial {
            if let Some(pending) = self.pending.remove(&serial) {
                match pending {
                    PendingCall::Blocking => {
                        self.replies.insert(serial, Ok(msg));
                    }
                    PendingCall::Callback(f) => f(self, Ok(msg)),
                }
                return Ok(());
            }
        }

        if self.dispatching {
            self.deferred.push_back(msg);
            return Ok(());
        }

        self.dispatching = true;
        let mut result = self.dispatch_one(&msg);
        // Deferred messages still go out in order; the first error wins.
        while let Some(next) = self.deferred.pop_front() {
            if let Err(e) = self.dispatch_one(&next) {
                if result.is_ok() {
                    result = Err(e);
                } else {
                    log::warn!("dispatch failed: {}", e);
                }
            }
        }
        self.dispatching = false;
        self.removed.clear();
        result
    }

    fn dispatch_one(&mut self, msg: &Message) -> Result<()> {
        if self.run_filters(msg) {
            return Ok(());
        }
        match msg.msg_type() {
            MessageType::Signal => {
                self.dispatch_signal(msg);
                Ok(())
            }
            MessageType::MethodCall => self.dispatch_call(msg),
            MessageType::Error => {
                if let Err(e) = msg.error_result() {
                    log::warn!("unsolicited error {}: {}", msg, e);
                }
                Ok(())
            }
            MessageType::MethodReturn => {
                log::warn!("unsolicited {}", msg);
                Ok(())
            }
            MessageType::Invalid => Ok(()),
        }
    }

    fn run_filters(&mut self, msg: &Message) -> bool {
        if self.filters.is_empty() {
            return false;
        }
        let mut filters = std::mem::take(&mut self.filters);
        let mut handled = false;
        for (id, f) in filters.iter_mut() {
            if self.removed.contains(id) {
                continue;
            }
            match f(self, msg) {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => log::warn!("message filter failed on {}: {}", msg, e),
            }
        }
        filters.append(&mut self.filters);
        filters.retain(|(id, _)| !self.removed.contains(id));
        self.filters = filters;
        handled
    }

    fn dispatch_signal(&mut self, msg: &Message) {
        let mut signals = std::mem::take(&mut self.signals);
        let mut matched = false;
        for (id, rule, handler) in signals.iter_mut() {
            if self.removed.contains(id) || !rule.matches(msg) {
                continue;
            }
            matched = true;
            if let Err(e) = handler(self, msg) {
                log::warn!("signal handler failed on {}: {}", msg, e);
            }
        }
        signals.append(&mut self.signals);
        signals.retain(|(id, _, _)| !self.removed.contains(id));
        self.signals = signals;

        if !matched {
            log::warn!("unhandled {}", msg);
        }
    }

    fn dispatch_call(&mut self, msg: &Message) -> Result<()> {
        let interface = msg
            .interface()
            .and_then(|name| self.interfaces.get(name))
            .cloned();

        let reply = match interface {
            Some(interface) => {
                let mut call = Call::new(self, msg);
                let result = interface.call(&mut call);
                let reply = call.take_reply();
                match result {
                    Ok(()) => reply.or_else(|| Some(msg.method_return())),
                    Err(e) => {
                        log::warn!("{} failed: {}", msg, e);
                        Some(msg.error_reply(ERROR_FAILED, &e.to_string()))
                    }
                }
            }
            None => self.builtin_reply(msg)?,
        };

        match reply {
            Some(mut reply) if msg.expects_reply() => {
                self.send(&mut reply)?;
            }
            Some(_) => {}
            None => log::debug!("dropping unhandled {}", msg),
        }
        Ok(())
    }

    fn builtin_reply(&self, msg: &Message) -> Result<Option<Message>> {
        let reply = match (msg.interface(), msg.member()) {
            (Some(PEER_INTERFACE) | None, Some("Ping")) => msg.method_return(),
            (Some(PEER_INTERFACE) | None, Some("GetMachineId")) => {
                msg.reply(vec![Value::from(machine_id())])?
            }
            (Some(INTROSPECTABLE_INTERFACE) | None, Some("Introspect")) => {
                let xml = introspect_xml(self.interfaces.values().map(|i| i.as_ref()));
                msg.reply(vec![Value::from(xml)])?
            }
            _ if msg.expects_reply() => {
                msg.error_reply(ERROR_UNKNOWN_METHOD, &unknown_method_text(msg))
            }
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    /// Shut the stream down, fail every pending call with
    /// [`ErrorKind::ConnectionClosed`] and run the `on_close` callbacks.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        // Queued while the fd number is still ours.
        if let Some(watch) = self.watch.take() {
            watch.handle.unregister_read(watch.fd);
            watch.handle.unregister_write(watch.fd);
        }
        if let Some(mut s) = self.stream.take() {
            let _ = s.shutdown();
        }
        self.inbuf.clear();
        self.outbuf.clear();
        log::debug!("connection closed");

        let mut pending: Vec<(u32, PendingCall)> = std::mem::take(&mut self.pending)
            .into_iter()
            .collect();
        pending.sort_by_key(|(serial, _)| *serial);
        for (serial, call) in pending {
            match call {
                PendingCall::Blocking => {
                    self.replies
                        .insert(serial, Err(ErrorKind::ConnectionClosed.into()));
                }
                PendingCall::Callback(f) => f(self, Err(ErrorKind::ConnectionClosed.into())),
            }
        }

        for f in std::mem::take(&mut self.on_close) {
            f(self);
        }
    }

    /// Watch the connection's socket on an event loop and dispatch incoming
    /// messages there. The registration ends when the connection closes.
    ///
    /// From then on `send` never waits for the socket: output it cannot
    /// write at once stays buffered and the loop writes it when the socket
    /// drains. Blocking calls still wait for their own output.
    pub fn attach(conn: Arc<Mutex<Connection>>, handle: &LoopHandle) -> Result<SourceId> {
        let fd = {
            let mut c = conn.lock();
            let fd = c.raw_fd()?;
            c.watch = Some(Watch {
                handle: handle.clone(),
                fd,
                conn: Arc::downgrade(&conn),
                writing: false,
            });
            if !c.outbuf.is_empty() {
                c.watch_writable();
            }
            fd
        };
        Ok(handle.register_read(fd, move |_| {
            let mut c = conn.lock();
            match c.handle_messages(Some(Duration::ZERO)) {
                Ok(_) => Ok(c.state() == State::Ready),
                Err(_) if c.state() == State::Closed => Ok(false),
                Err(e) if e.is_fatal() => {
                    c.close();
                    Err(e)
                }
                Err(e) => {
                    log::warn!("dispatch failed: {}", e);
                    Ok(true)
                }
            }
        }))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
