//! Connection state machine and proxy driver (C5 + C6).
//!
//! [`ConnectionManager`] owns the registry, the listener, and a slot table
//! parallel to the registry's own (`Token` values are plain indices into
//! both), and dispatches every readiness event to the handler matching the
//! connection's current [`ConnState`].

mod context;
mod endpoint;

pub use context::{ConnState, ConnectionContext, Side};
pub use endpoint::Endpoint;

use std::{
    cell::RefCell,
    io,
    ops::ControlFlow,
    rc::Rc,
    sync::atomic::AtomicBool,
    time::Duration,
};

use flux_utils::safe_panic;
use mio::{Interest, Token, net::TcpListener};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    crypto::HandshakeOutcome,
    error::{BufferError, ProxyError},
    registry::{Readiness, Registry},
    socket::{self, ResolveCache},
};

type ConnSlot = Option<(Rc<RefCell<ConnectionContext>>, Side)>;

/// Upper bound on how long `run` can go without rechecking `run_flag`,
/// needed because a signal handler only flips an atomic — it doesn't
/// interrupt an in-progress `poll()` the way a ready descriptor would.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ConnectionManager {
    registry: Registry,
    listener: TcpListener,
    listener_token: Token,
    config: Rc<Config>,
    resolve_cache: ResolveCache,
    slots: Vec<ConnSlot>,
    active: usize,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        let config = Rc::new(config);
        let mut listener = socket::listen(&config.bind_addr, config.bind_port)?;
        let mut registry = Registry::new().map_err(|e| ProxyError::Framing(e.into()))?;
        let listener_token =
            registry.add(&mut listener, Interest::READABLE).map_err(|_| ProxyError::MaxEvents)?;
        let slots = (0..crate::registry::MAX_EVENTS).map(|_| None).collect();

        info!(bind = %config.bind_addr, port = config.bind_port, "listening");
        Ok(Self {
            registry,
            listener,
            listener_token,
            config,
            resolve_cache: ResolveCache::new(),
            slots,
            active: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active
    }

    /// Runs the event loop until `run_flag` goes false or a fatal listener
    /// error forces an early exit.
    pub fn run(&mut self, run_flag: &AtomicBool) -> io::Result<i32> {
        let Self { registry, listener, listener_token, config, resolve_cache, slots, active } = self;
        let listener_token = *listener_token;

        registry.run_loop(run_flag, Some(SHUTDOWN_POLL_INTERVAL), |registry, token, ready| {
            if token == listener_token {
                handle_accept(registry, listener, config, resolve_cache, slots, active, ready);
            } else {
                match slots[token.0].clone() {
                    Some((ctx, side)) => dispatch(&ctx, side, registry, slots, active, ready),
                    None => safe_panic!("got readiness for a token with no connection slot"),
                }
            }
            ControlFlow::Continue(())
        })
    }

    /// Closes the listener and every live connection context. Called once
    /// on shutdown; connection fds are closed as each `Endpoint` drops.
    pub fn teardown(mut self) {
        let listener_token = self.listener_token;
        let _ = self.registry.remove(&mut self.listener, listener_token);
        for slot in self.slots.iter_mut() {
            if let Some((ctx, _)) = slot.take() {
                let mut c = ctx.borrow_mut();
                c.downstream = None;
                c.upstream = None;
                c.state = ConnState::Closed;
            }
        }
        self.registry.teardown(|_fd| {});
    }
}

fn initial_interest(ep: &Endpoint) -> Interest {
    if ep.is_handshaking() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Registers `ep` fresh and records the resulting token in both the context
/// and the slot table.
fn register_side(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
) -> Result<Token, ProxyError> {
    let mut c = ctx.borrow_mut();
    let interest = initial_interest(c.endpoint(side).expect("register_side: endpoint missing"));
    let token = registry
        .add(c.endpoint_mut(side).unwrap(), interest)
        .map_err(|_| ProxyError::MaxEvents)?;
    c.set_token(side, Some(token));
    drop(c);
    slots[token.0] = Some((ctx.clone(), side));
    Ok(token)
}

fn teardown_connection(
    ctx: &Rc<RefCell<ConnectionContext>>,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
) {
    let was_live = {
        let mut c = ctx.borrow_mut();
        let was_live = !c.is_fully_closed();
        if let (Some(mut ep), Some(token)) = (c.downstream.take(), c.downstream_token.take()) {
            let _ = registry.remove(&mut ep, token);
            slots[token.0] = None;
        }
        if let (Some(mut ep), Some(token)) = (c.upstream.take(), c.upstream_token.take()) {
            let _ = registry.remove(&mut ep, token);
            slots[token.0] = None;
        }
        c.state = ConnState::Closed;
        was_live
    };
    if was_live {
        *active = active.saturating_sub(1);
    }
    debug!("connection torn down");
}

/// Closes one side only, leaving the other registered. Used for half-close:
/// the disconnected side's bytes (if any) stay queued for the other side to
/// flush before the whole connection finally closes.
fn close_side(ctx: &Rc<RefCell<ConnectionContext>>, side: Side, registry: &mut Registry, slots: &mut [ConnSlot]) {
    let mut c = ctx.borrow_mut();
    if let Some(token) = c.token(side) {
        if let Some(ep) = c.endpoint_mut(side) {
            let _ = registry.remove(ep, token);
        }
        slots[token.0] = None;
    }
    match side {
        Side::Downstream => {
            c.downstream = None;
            c.downstream_token = None;
        }
        Side::Upstream => {
            c.upstream = None;
            c.upstream_token = None;
        }
    }
    if !matches!(c.state, ConnState::Closed) {
        c.state = ConnState::HalfClosed;
    }
}

fn set_interest(ctx: &Rc<RefCell<ConnectionContext>>, side: Side, registry: &mut Registry, interest: Interest) {
    let mut c = ctx.borrow_mut();
    if let Some(token) = c.token(side) {
        if let Some(ep) = c.endpoint_mut(side) {
            if let Err(err) = registry.modify(ep, token, interest) {
                warn!(?err, "failed to update interest");
            }
        }
    }
}

/// Enables writable on top of whatever `side` is currently interested in
/// (always at least readable while forwarding).
fn enable_writable(ctx: &Rc<RefCell<ConnectionContext>>, side: Side, registry: &mut Registry) {
    set_interest(ctx, side, registry, Interest::READABLE | Interest::WRITABLE);
}

/// Drops writable, keeping readable only.
fn disable_writable(ctx: &Rc<RefCell<ConnectionContext>>, side: Side, registry: &mut Registry) {
    set_interest(ctx, side, registry, Interest::READABLE);
}

// ---------------------------------------------------------------------
// Accept handler
// ---------------------------------------------------------------------

fn handle_accept(
    registry: &mut Registry,
    listener: &mut TcpListener,
    config: &Rc<Config>,
    resolve_cache: &mut ResolveCache,
    slots: &mut [ConnSlot],
    active: &mut usize,
    ready: Readiness,
) {
    if ready.error {
        warn!("listener reported an error event");
        return;
    }
    if !ready.readable {
        return;
    }

    // Drain every pending connection this wakeup, not just one: edge-style
    // readiness won't fire again for connections that arrived while we were
    // handling an earlier one in the same batch.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                ) =>
            {
                debug!(%e, "transient accept failure, retrying");
                continue;
            }
            Err(e) => {
                warn!(%e, "accept failed");
                return;
            }
        };
        debug!(%peer, "accepted downstream connection");

        let ctx = Rc::new(RefCell::new(ConnectionContext::new(config.clone())));
        let downstream_ep =
            if config.encrypt_downstream { Endpoint::encrypted(stream) } else { Endpoint::plain(stream) };

        match socket::connect(&config.upstream_addr, config.upstream_port, resolve_cache) {
            Ok(upstream_stream) => {
                let immediate = upstream_stream.peer_addr().is_ok();
                let upstream_ep = if config.encrypt_upstream {
                    Endpoint::encrypted(upstream_stream)
                } else {
                    Endpoint::plain(upstream_stream)
                };

                let mut c = ctx.borrow_mut();
                c.downstream = Some(downstream_ep);
                c.upstream = Some(upstream_ep);
                drop(c);

                if immediate {
                    if wire(&ctx, registry, slots).is_ok() {
                        *active += 1;
                    } else {
                        warn!("registry full, dropping freshly accepted connection");
                    }
                } else {
                    let mut c = ctx.borrow_mut();
                    c.state = ConnState::PendingConnect;
                    let token = match registry.add(c.upstream.as_mut().unwrap(), Interest::WRITABLE) {
                        Ok(t) => t,
                        Err(_) => {
                            drop(c);
                            warn!("registry full, dropping freshly accepted connection");
                            continue;
                        }
                    };
                    c.set_token(Side::Upstream, Some(token));
                    drop(c);
                    slots[token.0] = Some((ctx.clone(), Side::Upstream));
                    *active += 1;
                }
            }
            Err(err) => {
                warn!(%err, %peer, "upstream connect failed, dropping accepted connection");
            }
        }
    }
}

/// Registers both sides fresh (immediate-connect path) and advances state
/// past `WIRED` into either `HANDSHAKING` or `FORWARDING`.
fn wire(ctx: &Rc<RefCell<ConnectionContext>>, registry: &mut Registry, slots: &mut [ConnSlot]) -> Result<(), ProxyError> {
    register_side(ctx, Side::Downstream, registry, slots)?;
    if let Err(err) = register_side(ctx, Side::Upstream, registry, slots) {
        // Roll back the downstream registration so we don't leak a slot.
        let mut c = ctx.borrow_mut();
        if let (Some(mut ep), Some(token)) = (c.downstream.take(), c.downstream_token.take()) {
            let _ = registry.remove(&mut ep, token);
            slots[token.0] = None;
        }
        return Err(err);
    }
    enter_forwarding_or_handshaking(ctx);
    Ok(())
}

fn enter_forwarding_or_handshaking(ctx: &Rc<RefCell<ConnectionContext>>) {
    let mut c = ctx.borrow_mut();
    c.state = ConnState::Wired;
    let any_encrypted = c.downstream.as_ref().is_some_and(Endpoint::is_encrypted)
        || c.upstream.as_ref().is_some_and(Endpoint::is_encrypted);
    c.state = if any_encrypted { ConnState::Handshaking } else { ConnState::Forwarding };
}

// ---------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------

fn dispatch(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
    ready: Readiness,
) {
    let state = ctx.borrow().state;
    match state {
        ConnState::PendingConnect => handle_pending_connect(ctx, registry, slots, active, ready),
        ConnState::Handshaking => handle_handshake(ctx, side, registry, slots, active, ready),
        ConnState::Forwarding | ConnState::HalfClosed => {
            handle_forward(ctx, side, registry, slots, active, ready);
        }
        ConnState::Accepted | ConnState::Wired | ConnState::Closed => {
            debug!(?state, "ignoring readiness on a connection outside its dispatchable states");
        }
    }
}

// ---------------------------------------------------------------------
// Pending-connect handler
// ---------------------------------------------------------------------

fn handle_pending_connect(
    ctx: &Rc<RefCell<ConnectionContext>>,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
    ready: Readiness,
) {
    let sock_err = {
        let mut c = ctx.borrow_mut();
        c.upstream.as_mut().and_then(|ep| ep.stream_mut().take_error().ok().flatten())
    };
    if ready.error || sock_err.is_some() {
        if let Some(err) = sock_err {
            debug!(%err, "upstream connect failed");
        }
        teardown_connection(ctx, registry, slots, active);
        return;
    }
    if !ready.writable {
        return;
    }

    // Upstream is connected; re-register it at its real interest and bring
    // downstream online for the first time.
    {
        let mut c = ctx.borrow_mut();
        let token = c.upstream_token.expect("pending-connect dispatch without a token");
        let interest = initial_interest(c.upstream.as_ref().unwrap());
        if let Err(err) = registry.modify(c.upstream.as_mut().unwrap(), token, interest) {
            warn!(?err, "failed to re-arm upstream after connect");
            drop(c);
            teardown_connection(ctx, registry, slots, active);
            return;
        }
    }
    if register_side(ctx, Side::Downstream, registry, slots).is_err() {
        warn!("registry full, dropping connection that just finished connecting");
        teardown_connection(ctx, registry, slots, active);
        return;
    }
    enter_forwarding_or_handshaking(ctx);
}

// ---------------------------------------------------------------------
// Handshake handler
// ---------------------------------------------------------------------

fn handle_handshake(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
    ready: Readiness,
) {
    if ready.error {
        // A handshake failure on either side invalidates the whole pairing:
        // the peer that did complete (if any) has no use for a connection
        // whose other leg never came up.
        teardown_connection(ctx, registry, slots, active);
        return;
    }

    let outcome = {
        let mut c = ctx.borrow_mut();
        let Some(ep) = c.endpoint_mut(side) else { return };
        if !ep.is_handshaking() {
            return;
        }
        ep.step_handshake()
    };

    match outcome {
        Ok(HandshakeOutcome::Done(shared)) => {
            ctx.borrow_mut().endpoint_mut(side).unwrap().finish_handshake(shared);
            set_interest(ctx, side, registry, Interest::READABLE);

            let both_ready = {
                let c = ctx.borrow();
                !c.downstream.as_ref().is_some_and(Endpoint::is_handshaking)
                    && !c.upstream.as_ref().is_some_and(Endpoint::is_handshaking)
            };
            if both_ready {
                ctx.borrow_mut().state = ConnState::Forwarding;
                debug!("handshake complete on both sides, forwarding");
            }
        }
        Ok(HandshakeOutcome::WantRead) => set_interest(ctx, side, registry, Interest::READABLE),
        Ok(HandshakeOutcome::WantWrite) => set_interest(ctx, side, registry, Interest::WRITABLE),
        Err(err) => {
            debug!(%err, ?side, "handshake failed");
            teardown_connection(ctx, registry, slots, active);
        }
    }
}

// ---------------------------------------------------------------------
// Forwarding handler
// ---------------------------------------------------------------------

fn handle_forward(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
    ready: Readiness,
) {
    if ready.error {
        teardown_connection(ctx, registry, slots, active);
        return;
    }
    if ready.readable {
        handle_readable(ctx, side, registry, slots, active);
        if matches!(ctx.borrow().state, ConnState::Closed) {
            return;
        }
    }
    if ready.writable {
        handle_writable(ctx, side, registry, slots, active);
    }
}

/// Reads from `side` into the buffer addressed to the other side.
/// Backpressure: if that buffer already has bytes queued, this side simply
/// isn't read again until the other side's send drains it.
fn handle_readable(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
) {
    let other = side.other();
    let outcome = {
        let mut c = ctx.borrow_mut();
        if !c.outgoing_to(other).is_empty() {
            return;
        }
        let (buf, ep) = c.recv_pair(side);
        match ep {
            Some(ep) => buf.recv(ep),
            None => return,
        }
    };

    match outcome {
        Ok(()) => {
            let has_data = ctx.borrow().outgoing_to(other).size() > 0;
            if has_data {
                // The other side might already be closed (half-closed
                // connection draining its last bytes the other way); if so
                // there's no writable interest to enable.
                let other_present = ctx.borrow().endpoint(other).is_some();
                if other_present {
                    enable_writable(ctx, other, registry);
                } else {
                    debug!("destination already gone, dropping received bytes");
                    teardown_connection(ctx, registry, slots, active);
                }
            }
        }
        Err(BufferError::WouldBlock) => {}
        Err(BufferError::Disconnect) => handle_recv_disconnect(ctx, side, other, registry, slots, active),
        Err(BufferError::Io(err)) => {
            debug!(%err, ?side, "fatal read error");
            teardown_connection(ctx, registry, slots, active);
        }
    }
}

fn handle_recv_disconnect(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    other: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
) {
    let pending = ctx.borrow().outgoing_to(other).size() > 0;
    if pending {
        debug!(?side, "peer disconnected with data still pending, half-closing");
        close_side(ctx, side, registry, slots);
        let other_present = ctx.borrow().endpoint(other).is_some();
        if other_present {
            enable_writable(ctx, other, registry);
        } else {
            teardown_connection(ctx, registry, slots, active);
        }
    } else {
        debug!(?side, "peer disconnected with nothing pending, closing connection");
        teardown_connection(ctx, registry, slots, active);
    }
}

/// Drains the buffer addressed to `side` into `side`'s own endpoint.
fn handle_writable(
    ctx: &Rc<RefCell<ConnectionContext>>,
    side: Side,
    registry: &mut Registry,
    slots: &mut [ConnSlot],
    active: &mut usize,
) {
    let outcome = {
        let mut c = ctx.borrow_mut();
        if c.outgoing_to(side).is_empty() {
            return;
        }
        let (buf, ep) = c.send_pair(side);
        match ep {
            Some(ep) => buf.send(ep),
            None => return,
        }
    };

    match outcome {
        Ok(()) => {
            let other = side.other();
            let other_present = ctx.borrow().endpoint(other).is_some();
            if other_present {
                disable_writable(ctx, side, registry);
            } else {
                debug!(?side, "last pending bytes flushed to the only remaining side, closing");
                teardown_connection(ctx, registry, slots, active);
            }
        }
        Err(BufferError::WouldBlock) => {}
        Err(BufferError::Disconnect) => {
            debug!(?side, "send-side disconnected, tearing down connection");
            teardown_connection(ctx, registry, slots, active);
        }
        Err(BufferError::Io(err)) => {
            debug!(%err, ?side, "fatal write error");
            teardown_connection(ctx, registry, slots, active);
        }
    }
}

