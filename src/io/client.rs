//! The per-host client: connection lifecycle, request scheduling, and
//! the receive state machine.
//!
//! A [`Client`] owns one [`Connection`] to its host and a FIFO of
//! [`Request`]s. Requests are created with [`Client::get`], configured
//! fluently, and queued with [`Client::schedule`]; [`Client::run`] drives
//! everything on the caller's executor: it connects lazily on the first
//! scheduled request, runs one request at a time in schedule order, and
//! shuts the connection down when the idle timer elapses.

use core::cell::{Cell, Ref, RefCell, RefMut};
use core::net::SocketAddr;

use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use embassy_futures::select::{select, select3, Either, Either3};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;

use embassy_time::{with_deadline, with_timeout, Duration, Instant, Timer};

use edge_nal::{Close, TcpShutdown};

use log::{debug, info, trace, warn};

use crate::io::{
    discard_trailer, parse_chunk_size, read_exact_buffered, read_to_close, read_until,
    send_request, take_header, BodyKind, Error,
};
use crate::transport::{Resolve, Transport};
use crate::{Header, Protocol, MAX_RECV_BUF};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type TransportError<T> = <T as Transport>::Error;

type HeaderCallback = Box<dyn FnOnce(&Header)>;
type BodyChunkCallback = Box<dyn FnMut(&[u8])>;
type TimeoutCallback = Box<dyn FnOnce()>;
type CompleteCallback<E> = Box<dyn FnOnce(Result<(), Error<E>>)>;
type ConnectCallback<E> = Box<dyn FnMut(Result<(), &Error<E>>)>;
type IdleCallback = Box<dyn FnMut()>;

/// Lifecycle states of a [`Connection`].
///
/// Only `Open` permits reads and writes; only `Closed` permits a connect.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Closed,
    Connecting,
    /// TLS transports only: TCP is established, the security handshake is
    /// in flight
    Handshaking,
    Open,
    Shutdown,
}

/// Owns a client's one transport endpoint and its idle ("noop") timer.
///
/// When the idle timer elapses the endpoint is shut down full-duplex and
/// closed; reads and writes in flight observe the closure as a transport
/// failure, which the client translates into queue-wide cancellation.
pub struct Connection<T>
where
    T: Transport,
{
    state: Cell<ConnectionState>,
    socket: RefCell<Option<T::Socket>>,
    idle_timeout: Duration,
    idle_deadline: Cell<Option<Instant>>,
    idle_cb: RefCell<Option<IdleCallback>>,
}

impl<T> Connection<T>
where
    T: Transport,
{
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: Cell::new(ConnectionState::Closed),
            socket: RefCell::new(None),
            idle_timeout,
            idle_deadline: Cell::new(None),
            idle_cb: RefCell::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Direct access to the underlying endpoint, if open.
    pub fn socket(&self) -> RefMut<'_, Option<T::Socket>> {
        self.socket.borrow_mut()
    }

    /// Register a callback to run when the idle timer fires, before the
    /// endpoint is shut down. The callback lives as long as the
    /// connection.
    pub fn on_idle_timeout(&self, cb: impl FnMut() + 'static) {
        *self.idle_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Connect if closed, walking `endpoints` in order until one accepts.
    ///
    /// An already-open connection succeeds immediately. On success the
    /// idle timer is armed.
    pub async fn connect(
        &self,
        transport: &T,
        host: &str,
        endpoints: &[SocketAddr],
    ) -> Result<(), Error<T::Error>> {
        if self.state.get() == ConnectionState::Open {
            return Ok(());
        }

        let mut last_err = None;

        for &endpoint in endpoints {
            self.state.set(ConnectionState::Connecting);

            let tcp = match transport.connect(endpoint).await {
                Ok(tcp) => tcp,
                Err(e) => {
                    trace!("Connect to {endpoint} failed: {e:?}");
                    last_err = Some(e);
                    continue;
                }
            };

            if T::PROTOCOL == Protocol::Tls {
                self.state.set(ConnectionState::Handshaking);
            }

            match transport.handshake(host, tcp).await {
                Ok(socket) => {
                    debug!("Connected to {host} at {endpoint}");

                    *self.socket.borrow_mut() = Some(socket);
                    self.state.set(ConnectionState::Open);
                    self.start_idle_timer();

                    return Ok(());
                }
                Err(e) => {
                    warn!("Handshake with {host} at {endpoint} failed: {e:?}");
                    last_err = Some(e);
                }
            }
        }

        self.state.set(ConnectionState::Closed);

        Err(last_err.map(Error::Io).unwrap_or(Error::Cancelled))
    }

    /// Arm (or re-arm) the idle timer for its configured duration.
    pub fn start_idle_timer(&self) {
        self.idle_deadline
            .set(Some(Instant::now() + self.idle_timeout));
    }

    /// Cancel a pending idle timer.
    ///
    /// Returns `true` iff a timer was armed and had not yet elapsed, i.e.
    /// the cancellation actually beat the timer. An elapsed deadline is
    /// left in place for whoever is waiting on it to observe.
    pub fn stop_idle_timer(&self) -> bool {
        match self.idle_deadline.get() {
            Some(deadline) if Instant::now() < deadline => {
                self.idle_deadline.set(None);

                true
            }
            _ => false,
        }
    }

    /// Resolves when the armed idle deadline passes.
    ///
    /// Tracks re-arms, and pends forever while no timer is armed.
    pub async fn idle_elapsed(&self) {
        loop {
            let Some(deadline) = self.idle_deadline.get() else {
                core::future::pending::<()>().await;
                continue;
            };

            Timer::at(deadline).await;

            if self.idle_deadline.get() == Some(deadline) {
                self.idle_deadline.set(None);
                return;
            }
        }
    }

    /// Full-duplex shutdown followed by close.
    pub async fn close(&self) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }

        self.state.set(ConnectionState::Shutdown);
        self.idle_deadline.set(None);

        let socket = self.socket.borrow_mut().take();

        if let Some(mut socket) = socket {
            if let Err(e) = socket.close(Close::Both).await {
                trace!("Error while closing the socket: {e:?}");
            }
        }

        self.state.set(ConnectionState::Closed);
    }

    fn fire_idle(&self) {
        let cb = self.idle_cb.borrow_mut().take();

        if let Some(mut cb) = cb {
            cb();

            let mut slot = self.idle_cb.borrow_mut();

            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

struct Callbacks<E: 'static> {
    header: Option<HeaderCallback>,
    body_chunk: Option<BodyChunkCallback>,
    timeout: Option<TimeoutCallback>,
    complete: Option<CompleteCallback<E>>,
}

impl<E> Callbacks<E> {
    const fn new() -> Self {
        Self {
            header: None,
            body_chunk: None,
            timeout: None,
            complete: None,
        }
    }
}

/// A single GET on its client's connection.
///
/// Created by [`Client::get`] and queued by [`Client::schedule`]. The
/// caller keeps the strong handle; the client only holds a weak
/// reference, so dropping the handle before dispatch cancels silently.
///
/// Callback ordering per request is `on_header` (at most once), then any
/// number of `on_body_chunk` calls ending with an empty terminal chunk on
/// success, then exactly one `on_complete`. `on_timeout` fires iff the
/// per-request timer elapsed, right before its `on_complete(Timeout)`.
/// The complete callback is released after firing, so it is the one slot
/// that may own the request handle without leaking it.
pub struct Request<T>
where
    T: Transport + Resolve + 'static,
{
    client: Weak<Client<T>>,
    resource: String,
    timeout: Cell<Duration>,
    callbacks: RefCell<Callbacks<TransportError<T>>>,
    header: RefCell<Option<Header>>,
    recv_buf: RefCell<Vec<u8>>,
    timed_out: Cell<bool>,
    finished: Cell<bool>,
}

impl<T> Request<T>
where
    T: Transport + Resolve + 'static,
{
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The response header block, available from the moment `on_header`
    /// fires.
    pub fn header(&self) -> Ref<'_, Option<Header>> {
        self.header.borrow()
    }

    /// Set the end-to-end timeout for this request (default 10 s).
    pub fn timeout(&self, timeout: Duration) -> &Self {
        self.timeout.set(timeout);
        self
    }

    /// Called once, with the parsed header block, before any body chunk.
    /// Not guaranteed to fire if the request fails before header parse.
    pub fn on_header(&self, cb: impl FnOnce(&Header) + 'static) -> &Self {
        self.callbacks.borrow_mut().header = Some(Box::new(cb));
        self
    }

    /// Called once per body chunk with exactly that chunk's bytes; a
    /// final call with an empty slice signals end-of-body.
    pub fn on_body_chunk(&self, cb: impl FnMut(&[u8]) + 'static) -> &Self {
        self.callbacks.borrow_mut().body_chunk = Some(Box::new(cb));
        self
    }

    /// Called iff the per-request timer fires before the request
    /// completes.
    pub fn on_timeout(&self, cb: impl FnOnce() + 'static) -> &Self {
        self.callbacks.borrow_mut().timeout = Some(Box::new(cb));
        self
    }

    /// Called exactly once at the end of the request's lifecycle,
    /// whatever the outcome. The canonical place to release the caller's
    /// strong handle.
    pub fn on_complete(&self, cb: impl FnOnce(Result<(), Error<TransportError<T>>>) + 'static) -> &Self {
        self.callbacks.borrow_mut().complete = Some(Box::new(cb));
        self
    }

    /// Queue this request on its client.
    pub fn schedule(self: &Rc<Self>)
    where
        <T as Resolve>::Error: Into<TransportError<T>>,
    {
        if let Some(client) = self.client.upgrade() {
            client.schedule(self);
        }
    }

    fn fire_header(&self, header: &Header) {
        let cb = self.callbacks.borrow_mut().header.take();

        if let Some(cb) = cb {
            cb(header);
        }
    }

    fn fire_body_chunk(&self, chunk: &[u8]) {
        let cb = self.callbacks.borrow_mut().body_chunk.take();

        if let Some(mut cb) = cb {
            cb(chunk);

            let mut slot = self.callbacks.borrow_mut();

            if slot.body_chunk.is_none() {
                slot.body_chunk = Some(cb);
            }
        }
    }

    /// Deliver the terminal callbacks; at most once per lifetime.
    fn finish(&self, result: Result<(), Error<TransportError<T>>>) {
        if self.finished.replace(true) {
            return;
        }

        trace!(
            "Request {} finished: {:?}",
            self.resource,
            result.as_ref().map_err(|e| e.erase())
        );

        let (timeout_cb, complete_cb) = {
            let mut cbs = self.callbacks.borrow_mut();

            // Nothing but the terminal callbacks may fire from here on
            cbs.header = None;
            cbs.body_chunk = None;

            (cbs.timeout.take(), cbs.complete.take())
        };

        if self.timed_out.get() {
            if let Some(cb) = timeout_cb {
                cb();
            }
        }

        // The complete slot is dropped after the call, breaking the cycle
        // a self-capturing completion callback would otherwise create
        if let Some(cb) = complete_cb {
            cb(result);
        }
    }
}

struct ClientState<T>
where
    T: Transport + Resolve + 'static,
{
    endpoints: Vec<SocketAddr>,
    queue: VecDeque<Weak<Request<T>>>,
    active: bool,
    connect_cb: Option<ConnectCallback<TransportError<T>>>,
}

enum Outcome<E> {
    /// The machine ran to an outcome; `Ok(true)` means the connection is
    /// reusable for the next request
    Done(Result<bool, Error<E>>),
    ConnectFailed(Error<E>),
    IdleFired,
}

/// A per-host HTTP/1.1 client.
///
/// Holds one connection to `host` and a FIFO of scheduled requests;
/// [`Client::run`] processes them sequentially over the connection,
/// reconnecting lazily whenever the connection is closed.
pub struct Client<T>
where
    T: Transport + Resolve + 'static,
{
    host: String,
    transport: T,
    resolve_timeout: Duration,
    conn: Connection<T>,
    state: RefCell<ClientState<T>>,
    wakeup: Signal<NoopRawMutex, ()>,
}

impl<T> Client<T>
where
    T: Transport + Resolve + 'static,
    <T as Resolve>::Error: Into<TransportError<T>>,
{
    /// Create a client for `host` (no scheme, no path) with the default
    /// idle (30 s) and resolve (10 s) timeouts.
    pub fn new(transport: T, host: impl Into<String>) -> Rc<Self> {
        Self::with_timeouts(
            transport,
            host,
            DEFAULT_IDLE_TIMEOUT,
            DEFAULT_RESOLVE_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        transport: T,
        host: impl Into<String>,
        idle_timeout: Duration,
        resolve_timeout: Duration,
    ) -> Rc<Self> {
        Rc::new(Self {
            host: host.into(),
            transport,
            resolve_timeout,
            conn: Connection::new(idle_timeout),
            state: RefCell::new(ClientState {
                endpoints: Vec::new(),
                queue: VecDeque::new(),
                active: false,
                connect_cb: None,
            }),
            wakeup: Signal::new(),
        })
    }

    /// The host this client handles.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The service name used when resolving, from the transport flavor.
    pub fn service(&self) -> &'static str {
        T::PROTOCOL.service()
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    /// Number of requests being processed, the active one included.
    pub fn request_count(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Create a request for `resource` without scheduling it.
    ///
    /// `resource` must begin with `/`.
    pub fn get(self: &Rc<Self>, resource: impl Into<String>) -> Rc<Request<T>> {
        let resource = resource.into();

        assert!(resource.starts_with('/'), "resource must begin with '/'");

        Rc::new(Request {
            client: Rc::downgrade(self),
            resource,
            timeout: Cell::new(DEFAULT_REQUEST_TIMEOUT),
            callbacks: RefCell::new(Callbacks::new()),
            header: RefCell::new(None),
            recv_buf: RefCell::new(Vec::new()),
            timed_out: Cell::new(false),
            finished: Cell::new(false),
        })
    }

    /// Queue `request` behind whatever is already scheduled.
    ///
    /// Only a weak reference is kept; dropping the strong handle before
    /// the request is dispatched cancels it silently.
    pub fn schedule(&self, request: &Rc<Request<T>>) {
        debug!("Client {}: scheduling {}", self.host, request.resource);

        self.state
            .borrow_mut()
            .queue
            .push_back(Rc::downgrade(request));

        self.wakeup.signal(());
    }

    /// Register a callback fired once per actual connect attempt, with
    /// its result. Lives for the client's lifetime.
    pub fn on_connect(
        &self,
        cb: impl FnMut(Result<(), &Error<TransportError<T>>>) + 'static,
    ) -> &Self {
        self.state.borrow_mut().connect_cb = Some(Box::new(cb));
        self
    }

    /// Resolve the host, caching the endpoint list on first success.
    ///
    /// Guarded by the resolve timeout.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, Error<TransportError<T>>> {
        {
            let state = self.state.borrow();

            if !state.endpoints.is_empty() {
                trace!("Client {}: already resolved", self.host);

                return Ok(state.endpoints.clone());
            }
        }

        debug!("Client {}: resolving ({})", self.host, self.service());

        let resolved = with_timeout(
            self.resolve_timeout,
            self.transport.resolve(&self.host, self.service()),
        )
        .await;

        let endpoints = match resolved {
            Ok(Ok(endpoints)) => endpoints,
            Ok(Err(e)) => return Err(Error::Io(e.into())),
            Err(_) => {
                warn!("Client {}: resolve timed out", self.host);

                return Err(Error::Timeout);
            }
        };

        self.state.borrow_mut().endpoints = endpoints.clone();

        Ok(endpoints)
    }

    /// Connect if closed, resolving first when needed.
    ///
    /// An already-open connection succeeds immediately without invoking
    /// the `on_connect` callback; a real attempt invokes it with the
    /// result.
    pub async fn connect(&self) -> Result<(), Error<TransportError<T>>> {
        if self.conn.state() == ConnectionState::Open {
            return Ok(());
        }

        let result = self.connect_attempt().await;

        self.connect_completed(&result);

        result
    }

    async fn connect_attempt(&self) -> Result<(), Error<TransportError<T>>> {
        let endpoints = self.resolve().await?;

        self.conn
            .connect(&self.transport, &self.host, &endpoints)
            .await
    }

    fn connect_completed(&self, result: &Result<(), Error<TransportError<T>>>) {
        let cb = self.state.borrow_mut().connect_cb.take();

        if let Some(mut cb) = cb {
            match result {
                Ok(()) => cb(Ok(())),
                Err(e) => cb(Err(e)),
            }

            let mut state = self.state.borrow_mut();

            if state.connect_cb.is_none() {
                state.connect_cb = Some(cb);
            }
        }
    }

    /// Drive the client.
    ///
    /// Connects lazily, runs queued requests one at a time in FIFO order,
    /// and shuts the connection down when the idle timer elapses. Never
    /// returns; run it on the executor alongside the code scheduling
    /// requests.
    pub async fn run(&self) -> core::convert::Infallible {
        loop {
            let request = self.next_request().await;

            self.state.borrow_mut().active = true;

            trace!("Client {}: starting {}", self.host, request.resource);

            let deadline = Instant::now() + request.timeout.get();

            let outcome = self.process(&request, deadline).await;

            {
                let mut state = self.state.borrow_mut();

                state.queue.pop_front();
                state.active = false;
            }

            match outcome {
                Outcome::Done(Ok(persistent)) => {
                    if persistent {
                        // Idleness is measured from last activity
                        self.conn.start_idle_timer();
                    } else {
                        self.conn.close().await;
                    }

                    request.finish(Ok(()));
                }
                Outcome::Done(Err(Error::HeaderParse(e))) => {
                    // Request-scoped failure; the connection stays open
                    // for the next queued request
                    self.conn.start_idle_timer();

                    request.finish(Err(Error::HeaderParse(e)));
                }
                Outcome::Done(Err(e)) => {
                    self.conn.close().await;

                    // Snapshot before finishing: completions stay in
                    // schedule order, and a retry scheduled from the
                    // failing request's completion callback survives
                    let victims = self.take_victims();

                    request.finish(Err(e));

                    for victim in victims {
                        victim.finish(Err(Error::Cancelled));
                    }
                }
                Outcome::ConnectFailed(e) => {
                    warn!("Client {}: connect failed: {:?}", self.host, e.erase());

                    // on_connect has already reported the underlying error
                    let victims = self.take_victims();

                    request.finish(Err(Error::Cancelled));

                    for victim in victims {
                        victim.finish(Err(Error::Cancelled));
                    }
                }
                Outcome::IdleFired => {
                    info!(
                        "Client {}: idle timer fired with a request in flight",
                        self.host
                    );

                    self.conn.fire_idle();
                    self.conn.close().await;

                    let victims = self.take_victims();

                    request.finish(Err(Error::Cancelled));

                    for victim in victims {
                        victim.finish(Err(Error::Timeout));
                    }
                }
            }
        }
    }

    /// Wait until the queue has a live front entry, closing the
    /// connection if the idle timer fires in the meantime.
    async fn next_request(&self) -> Rc<Request<T>> {
        loop {
            let front = {
                let mut state = self.state.borrow_mut();

                loop {
                    match state.queue.front() {
                        Some(weak) => {
                            if let Some(request) = weak.upgrade() {
                                break Some(request);
                            }

                            // Scheduled but dropped: cancels silently
                            state.queue.pop_front();
                        }
                        None => break None,
                    }
                }
            };

            if let Some(request) = front {
                return request;
            }

            if self.conn.state() == ConnectionState::Open {
                let waited = select(self.wakeup.wait(), self.conn.idle_elapsed()).await;

                if matches!(waited, Either::Second(())) {
                    info!(
                        "Client {}: closing the connection after inactivity",
                        self.host
                    );

                    self.conn.fire_idle();
                    self.conn.close().await;
                }
            } else {
                self.wakeup.wait().await;
            }
        }
    }

    async fn process(
        &self,
        request: &Rc<Request<T>>,
        deadline: Instant,
    ) -> Outcome<TransportError<T>> {
        // Connecting counts against the request's end-to-end deadline
        let connected = match with_deadline(deadline, self.connect()).await {
            Ok(result) => result,
            Err(_) => {
                request.timed_out.set(true);

                return Outcome::Done(Err(Error::Timeout));
            }
        };

        if let Err(e) = connected {
            return Outcome::ConnectFailed(e);
        }

        // The receive machine races the request deadline and the idle
        // timer; losing either race drops the machine and its socket
        // borrow before the connection is torn down
        let raced = select3(
            self.receive(request),
            Timer::at(deadline),
            self.conn.idle_elapsed(),
        )
        .await;

        match raced {
            Either3::First(result) => Outcome::Done(result),
            Either3::Second(()) => {
                request.timed_out.set(true);

                Outcome::Done(Err(Error::Timeout))
            }
            Either3::Third(()) => Outcome::IdleFired,
        }
    }

    /// Write the request and decode the response, delivering callbacks as
    /// the header and body chunks arrive.
    ///
    /// `Ok(true)` means the connection is reusable for the next request;
    /// `Ok(false)` means the response was delimited by connection close.
    async fn receive(
        &self,
        request: &Rc<Request<T>>,
    ) -> Result<bool, Error<TransportError<T>>> {
        let mut socket = self.conn.socket();
        let socket = socket.as_mut().ok_or(Error::Cancelled)?;

        let mut buf = request.recv_buf.borrow_mut();
        buf.clear();

        trace!("Client {}: sending GET {}", self.host, request.resource);

        send_request(&request.resource, &self.host, socket).await?;

        let header_end = read_until(socket, &mut buf, b"\r\n\r\n").await?;
        let header = take_header(&mut buf, header_end);

        let kind = BodyKind::from_header(&header)?;

        if let BodyKind::ContentLen(len) = kind {
            if len > MAX_RECV_BUF as u64 {
                return Err(Error::FileTooLarge);
            }
        }

        *request.header.borrow_mut() = Some(header);

        {
            let header = request.header.borrow();

            request.fire_header(header.as_ref().unwrap());
        }

        match kind {
            BodyKind::ContentLen(len) => {
                let len = len as usize;

                read_exact_buffered(socket, &mut buf, len).await?;

                if len > 0 {
                    request.fire_body_chunk(&buf[..len]);
                }

                request.fire_body_chunk(&[]);

                Ok(true)
            }
            BodyKind::Chunked => {
                loop {
                    let line_end = read_until(socket, &mut buf, b"\r\n").await?;
                    let size = parse_chunk_size(&buf[..line_end - 2])?;

                    buf.drain(..line_end);

                    if size > (MAX_RECV_BUF - buf.len()) as u64 {
                        return Err(Error::FileTooLarge);
                    }

                    let size = size as usize;

                    if size == 0 {
                        discard_trailer(socket, &mut buf).await?;

                        request.fire_body_chunk(&[]);

                        break;
                    }

                    read_exact_buffered(socket, &mut buf, size + 2).await?;

                    if buf[size..size + 2] != *b"\r\n" {
                        return Err(Error::InvalidBody);
                    }

                    request.fire_body_chunk(&buf[..size]);

                    // Chunk data counts as activity: re-arm the idle
                    // timer iff we beat it; if it already fired, the
                    // cancellation is left to propagate
                    if self.conn.stop_idle_timer() {
                        self.conn.start_idle_timer();
                    }

                    buf.drain(..size + 2);
                }

                Ok(true)
            }
            BodyKind::UntilClose => {
                read_to_close(socket, &mut buf).await?;

                if !buf.is_empty() {
                    request.fire_body_chunk(&buf);
                }

                request.fire_body_chunk(&[]);

                Ok(false)
            }
        }
    }

    /// Empty the queue (the active front excluded while a request is
    /// active), returning the still-live entries in schedule order.
    fn take_victims(&self) -> Vec<Rc<Request<T>>> {
        let mut state = self.state.borrow_mut();
        let keep = usize::from(state.active);

        state
            .queue
            .drain(keep..)
            .filter_map(|weak| weak.upgrade())
            .collect()
    }
}

impl<T> Drop for Client<T>
where
    T: Transport + Resolve + 'static,
{
    fn drop(&mut self) {
        let victims = self
            .state
            .get_mut()
            .queue
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect::<Vec<_>>();

        for victim in victims {
            victim.finish(Err(Error::Cancelled));
        }
    }
}

#[cfg(test)]
mod test {
    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use core::future::Future;
    use core::net::SocketAddr;

    use std::collections::VecDeque;
    use std::rc::Rc;

    use embassy_futures::select::select;

    use embassy_time::{Duration, Timer};

    use embedded_io_async::{ErrorKind, ErrorType, Read, Write};

    use edge_nal::{Close, TcpShutdown};

    use futures_lite::future::block_on;

    use crate::io::Error;
    use crate::transport::{Resolve, Transport};
    use crate::Protocol;

    use super::{Client, ConnectionState, Request};

    /// A scripted socket serving one canned response per request seen,
    /// so a response is never readable before its request went out (as
    /// with a real server).
    struct TestSocket {
        responses: VecDeque<Vec<u8>>,
        current: Vec<u8>,
        pos: usize,
        requests_seen: usize,
        served: usize,
        stall: bool,
        written: Rc<RefCell<Vec<u8>>>,
    }

    impl ErrorType for TestSocket {
        type Error = ErrorKind;
    }

    impl Read for TestSocket {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            loop {
                if self.pos < self.current.len() {
                    let len = usize::min(buf.len(), self.current.len() - self.pos);
                    buf[..len].copy_from_slice(&self.current[self.pos..self.pos + len]);

                    self.pos += len;

                    return Ok(len);
                }

                if self.served < self.requests_seen {
                    if let Some(next) = self.responses.pop_front() {
                        self.current = next;
                        self.pos = 0;
                        self.served += 1;

                        continue;
                    }
                }

                if self.stall {
                    core::future::pending::<Infallible>().await;
                }

                return Ok(0);
            }
        }
    }

    impl Write for TestSocket {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.requests_seen += buf
                .windows(4)
                .filter(|window| *window == b"\r\n\r\n")
                .count();

            self.written.borrow_mut().extend_from_slice(buf);

            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl TcpShutdown for TestSocket {
        async fn close(&mut self, _what: Close) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn abort(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct TestTransport {
        sockets: RefCell<VecDeque<TestSocket>>,
        connects: Rc<Cell<usize>>,
        fail_connect: bool,
    }

    impl TestTransport {
        /// One scripted socket per connect; each serves its responses in
        /// order, then EOF (or a stall when so marked).
        fn new(scripts: &[(&[&[u8]], bool)]) -> (Self, Rc<Cell<usize>>, Rc<RefCell<Vec<u8>>>) {
            let connects = Rc::new(Cell::new(0));
            let written = Rc::new(RefCell::new(Vec::new()));

            let sockets = scripts
                .iter()
                .map(|(responses, stall)| TestSocket {
                    responses: responses.iter().map(|data| data.to_vec()).collect(),
                    current: Vec::new(),
                    pos: 0,
                    requests_seen: 0,
                    served: 0,
                    stall: *stall,
                    written: written.clone(),
                })
                .collect();

            (
                Self {
                    sockets: RefCell::new(sockets),
                    connects: connects.clone(),
                    fail_connect: false,
                },
                connects,
                written,
            )
        }

        fn failing() -> (Self, Rc<Cell<usize>>) {
            let (mut transport, connects, _) = Self::new(&[]);
            transport.fail_connect = true;

            (transport, connects)
        }
    }

    impl Transport for TestTransport {
        const PROTOCOL: Protocol = Protocol::Plain;

        type Error = ErrorKind;

        type TcpSocket = TestSocket;

        type Socket = TestSocket;

        async fn connect(&self, _remote: SocketAddr) -> Result<Self::TcpSocket, Self::Error> {
            self.connects.set(self.connects.get() + 1);

            if self.fail_connect {
                return Err(ErrorKind::ConnectionRefused);
            }

            self.sockets
                .borrow_mut()
                .pop_front()
                .ok_or(ErrorKind::ConnectionRefused)
        }

        async fn handshake(
            &self,
            _host: &str,
            socket: Self::TcpSocket,
        ) -> Result<Self::Socket, Self::Error> {
            Ok(socket)
        }
    }

    impl Resolve for TestTransport {
        type Error = ErrorKind;

        async fn resolve(
            &self,
            _host: &str,
            _service: &str,
        ) -> Result<Vec<SocketAddr>, Self::Error> {
            Ok(vec![SocketAddr::from(([127, 0, 0, 1], 80))])
        }
    }

    struct Recorder {
        chunks: Rc<RefCell<Vec<usize>>>,
        body: Rc<RefCell<Vec<u8>>>,
        header_fired: Rc<Cell<bool>>,
        timeout_fired: Rc<Cell<bool>>,
        completions: Rc<Cell<usize>>,
        result: Rc<RefCell<Option<Result<(), Error<ErrorKind>>>>>,
    }

    impl Recorder {
        fn attach(request: &Rc<Request<TestTransport>>, done: &Rc<Cell<usize>>) -> Self {
            let recorder = Self {
                chunks: Rc::new(RefCell::new(Vec::new())),
                body: Rc::new(RefCell::new(Vec::new())),
                header_fired: Rc::new(Cell::new(false)),
                timeout_fired: Rc::new(Cell::new(false)),
                completions: Rc::new(Cell::new(0)),
                result: Rc::new(RefCell::new(None)),
            };

            let header_fired = recorder.header_fired.clone();
            let chunks = recorder.chunks.clone();
            let body = recorder.body.clone();
            let chunks_after_header = recorder.header_fired.clone();
            let timeout_fired = recorder.timeout_fired.clone();
            let completions = recorder.completions.clone();
            let result = recorder.result.clone();
            let done = done.clone();

            request
                .on_header(move |_| header_fired.set(true))
                .on_body_chunk(move |chunk| {
                    // Chunks never precede the header
                    assert!(chunks_after_header.get());

                    chunks.borrow_mut().push(chunk.len());
                    body.borrow_mut().extend_from_slice(chunk);
                })
                .on_timeout(move || timeout_fired.set(true))
                .on_complete(move |res| {
                    completions.set(completions.get() + 1);
                    *result.borrow_mut() = Some(res);
                    done.set(done.get() + 1);
                });

            recorder
        }

        fn result(&self) -> Result<(), Error<ErrorKind>> {
            self.result.borrow().clone().expect("request not completed")
        }
    }

    fn run_until(client: &Rc<Client<TestTransport>>, until: impl Future) {
        block_on(async {
            select(client.run(), until).await;
        });
    }

    async fn completed(done: Rc<Cell<usize>>, target: usize) {
        while done.get() < target {
            Timer::after(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_single_request() {
        let (transport, connects, written) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let recorder = Recorder::attach(&request, &done);

        client.schedule(&request);
        assert_eq!(client.request_count(), 1);

        run_until(&client, completed(done.clone(), 1));

        assert_eq!(recorder.result(), Ok(()));
        assert!(recorder.header_fired.get());
        assert_eq!(*recorder.chunks.borrow(), vec![5, 0]);
        assert_eq!(*recorder.body.borrow(), b"hello");
        assert_eq!(recorder.completions.get(), 1);
        assert!(!recorder.timeout_fired.get());
        assert_eq!(connects.get(), 1);
        assert_eq!(client.request_count(), 0);

        assert_eq!(
            *written.borrow(),
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_keep_alive_requests_complete_in_order() {
        let (transport, connects, _) = TestTransport::new(&[(
            &[
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\naa",
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbbb",
            ],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = client.get("/a");
        let first_rec = Recorder::attach(&first, &done);

        let second = client.get("/b");
        let second_rec = Recorder::attach(&second, &done);

        // Registering a completion callback again replaces the slot, so
        // these take over the `done` bookkeeping from the recorders
        for (request, tag) in [(&first, "a"), (&second, "b")] {
            let order = order.clone();
            let done = done.clone();
            request.on_complete(move |res| {
                assert_eq!(res, Ok(()));
                order.borrow_mut().push(tag);
                done.set(done.get() + 1);
            });
        }

        client.schedule(&first);
        client.schedule(&second);
        assert_eq!(client.request_count(), 2);

        run_until(&client, completed(done.clone(), 2));

        // Note: Recorder's on_complete was replaced above, so `done` is
        // bumped by the replacement closures
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(*first_rec.body.borrow(), b"aa");
        assert_eq!(*second_rec.body.borrow(), b"bbb");

        // One connection serves both requests
        assert_eq!(connects.get(), 1);
    }

    #[test]
    fn test_chunked_body() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
               5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let recorder = Recorder::attach(&request, &done);

        request.schedule();

        run_until(&client, completed(done.clone(), 1));

        assert_eq!(recorder.result(), Ok(()));
        assert_eq!(*recorder.chunks.borrow(), vec![5, 6, 0]);
        assert_eq!(*recorder.body.borrow(), b"Hello World");
    }

    #[test]
    fn test_chunked_empty_body() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let recorder = Recorder::attach(&request, &done);

        client.schedule(&request);

        run_until(&client, completed(done.clone(), 1));

        assert_eq!(recorder.result(), Ok(()));
        assert!(recorder.header_fired.get());
        assert_eq!(*recorder.chunks.borrow(), vec![0]);
    }

    #[test]
    fn test_chunked_matches_content_length_payload() {
        let (transport, _, _) = TestTransport::new(&[(
            &[
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World",
            ],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let chunked = client.get("/chunked");
        let chunked_rec = Recorder::attach(&chunked, &done);

        let sized = client.get("/sized");
        let sized_rec = Recorder::attach(&sized, &done);

        client.schedule(&chunked);
        client.schedule(&sized);

        run_until(&client, completed(done.clone(), 2));

        // Same payload, same delivered bytes, whatever the framing
        assert_eq!(*chunked_rec.body.borrow(), *sized_rec.body.borrow());
        assert_eq!(*sized_rec.body.borrow(), b"Hello World");
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        let (transport, connects, _) = TestTransport::new(&[
            (&[b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"], false),
            (&[b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"], false),
        ]);

        let client = Client::with_timeouts(
            transport,
            "example.com",
            Duration::from_millis(50),
            Duration::from_secs(10),
        );

        let idle_fired = Rc::new(Cell::new(false));

        {
            let idle_fired = idle_fired.clone();
            client
                .connection()
                .on_idle_timeout(move || idle_fired.set(true));
        }

        let done = Rc::new(Cell::new(0));

        let first = client.get("/");
        let first_rec = Recorder::attach(&first, &done);

        client.schedule(&first);

        // Run on past the idle deadline so the connection gets shut down
        block_on(async {
            select(client.run(), Timer::after(Duration::from_millis(150))).await;
        });

        assert_eq!(first_rec.result(), Ok(()));
        assert!(idle_fired.get());
        assert_eq!(client.connection().state(), ConnectionState::Closed);

        // The next request transparently re-opens the connection
        let second = client.get("/");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&second);
        run_until(&client, completed(done.clone(), 2));

        assert_eq!(second_rec.result(), Ok(()));
        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn test_content_length_zero() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let recorder = Recorder::attach(&request, &done);

        client.schedule(&request);

        run_until(&client, completed(done.clone(), 1));

        assert_eq!(recorder.result(), Ok(()));
        assert!(recorder.header_fired.get());
        assert_eq!(*recorder.chunks.borrow(), vec![0]);
    }

    #[test]
    fn test_body_until_close_then_reconnect() {
        let (transport, connects, _) = TestTransport::new(&[
            (&[b"HTTP/1.1 200 OK\r\nServer: a\r\n\r\nsome data"], false),
            (&[b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"], false),
        ]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let first = client.get("/");
        let first_rec = Recorder::attach(&first, &done);

        client.schedule(&first);
        run_until(&client, completed(done.clone(), 1));

        assert_eq!(first_rec.result(), Ok(()));
        assert_eq!(*first_rec.chunks.borrow(), vec![9, 0]);
        assert_eq!(*first_rec.body.borrow(), b"some data");

        // The close-delimited response consumed the connection
        let second = client.get("/");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&second);
        run_until(&client, completed(done.clone(), 2));

        assert_eq!(second_rec.result(), Ok(()));
        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn test_content_length_over_bound() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nContent-Length: 26214401\r\n\r\n"],
            true,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let first = client.get("/");
        let first_rec = Recorder::attach(&first, &done);

        let second = client.get("/queued");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&first);
        client.schedule(&second);

        run_until(&client, completed(done.clone(), 2));

        assert_eq!(first_rec.result(), Err(Error::FileTooLarge));
        // Rejected before the header or any body chunk was delivered
        assert!(!first_rec.header_fired.get());
        assert!(first_rec.chunks.borrow().is_empty());

        // The failure cancels the rest of the queue
        assert_eq!(second_rec.result(), Err(Error::Cancelled));
    }

    #[test]
    fn test_connect_failure_cancels_queue() {
        let (transport, connects) = TestTransport::failing();

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));
        let connect_err = Rc::new(Cell::new(false));

        {
            let connect_err = connect_err.clone();
            client.on_connect(move |res| {
                if res.is_err() {
                    connect_err.set(true);
                }
            });
        }

        let first = client.get("/a");
        let first_rec = Recorder::attach(&first, &done);

        let second = client.get("/b");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&first);
        client.schedule(&second);

        run_until(&client, completed(done.clone(), 2));

        assert!(connect_err.get());
        assert_eq!(first_rec.result(), Err(Error::Cancelled));
        assert_eq!(second_rec.result(), Err(Error::Cancelled));
        assert!(!first_rec.header_fired.get());
        assert!(connects.get() >= 1);
    }

    #[test]
    fn test_timeout_mid_body_then_fresh_connect() {
        let (transport, connects, _) = TestTransport::new(&[
            // Headers arrive, then the body stalls forever
            (
                &[b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial"],
                true,
            ),
            (&[b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"], false),
        ]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let first = client.get("/slow");
        let first_rec = Recorder::attach(&first, &done);
        first.timeout(Duration::from_millis(50));

        let second = client.get("/queued");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&first);
        client.schedule(&second);

        run_until(&client, completed(done.clone(), 2));

        assert_eq!(first_rec.result(), Err(Error::Timeout));
        assert!(first_rec.header_fired.get());
        assert!(first_rec.timeout_fired.get());
        assert_eq!(first_rec.completions.get(), 1);

        assert_eq!(second_rec.result(), Err(Error::Cancelled));
        assert!(!second_rec.timeout_fired.get());

        // A request scheduled after the teardown opens a new connection
        let third = client.get("/");
        let third_rec = Recorder::attach(&third, &done);

        client.schedule(&third);
        run_until(&client, completed(done.clone(), 3));

        assert_eq!(third_rec.result(), Ok(()));
        assert_eq!(connects.get(), 2);
    }

    #[test]
    fn test_header_parse_failure_keeps_connection() {
        let (transport, connects, _) = TestTransport::new(&[(
            &[
                b"HTTP/1.1 200 OK\r\nContent-Length: forty\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
            ],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let first = client.get("/bad");
        let first_rec = Recorder::attach(&first, &done);

        let second = client.get("/good");
        let second_rec = Recorder::attach(&second, &done);

        client.schedule(&first);
        client.schedule(&second);

        run_until(&client, completed(done.clone(), 2));

        assert!(matches!(
            first_rec.result(),
            Err(Error::HeaderParse(crate::HeaderParseError::InvalidValue))
        ));

        // Request-scoped failure: the next request reuses the connection
        assert_eq!(second_rec.result(), Ok(()));
        assert_eq!(*second_rec.body.borrow(), b"hi");
        assert_eq!(connects.get(), 1);
    }

    #[test]
    fn test_dropped_request_cancels_silently() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));
        let dropped_completed = Rc::new(Cell::new(false));

        let dropped = client.get("/dropped");
        {
            let dropped_completed = dropped_completed.clone();
            dropped.on_complete(move |_| dropped_completed.set(true));
        }

        client.schedule(&dropped);
        drop(dropped);

        let kept = client.get("/kept");
        let kept_rec = Recorder::attach(&kept, &done);

        client.schedule(&kept);

        run_until(&client, completed(done.clone(), 1));

        assert_eq!(kept_rec.result(), Ok(()));
        assert!(!dropped_completed.get());
    }

    #[test]
    fn test_client_drop_cancels_queued() {
        let (transport, _, _) = TestTransport::new(&[]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let recorder = Recorder::attach(&request, &done);

        client.schedule(&request);
        drop(client);

        assert_eq!(recorder.result(), Err(Error::Cancelled));
        assert_eq!(recorder.completions.get(), 1);
    }

    #[test]
    fn test_request_header_accessor() {
        let (transport, _, _) = TestTransport::new(&[(
            &[b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nETag: xyz\r\n\r\nhello"],
            false,
        )]);

        let client = Client::new(transport, "example.com");
        let done = Rc::new(Cell::new(0));

        let request = client.get("/");
        let _recorder = Recorder::attach(&request, &done);

        client.schedule(&request);
        run_until(&client, completed(done.clone(), 1));

        let header = request.header();
        let header = header.as_ref().unwrap();

        assert_eq!(header.get("etag").unwrap(), Some(&b"xyz"[..]));
        assert_eq!(header.content_length().unwrap(), Some(5));
    }
}
