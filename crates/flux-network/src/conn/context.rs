//! Connection context: owns the pair of endpoints, their directional
//! buffers, and the per-pair lifecycle state (C5's state machine).
//!
//! Buffers are named by destination, not by source: `to_downstream` holds
//! bytes received from upstream that are queued to be written to
//! downstream, and symmetrically for `to_upstream`. This mirrors the
//! original proxy's `client_send_buf`/`server_send_buf` naming (named for
//! which socket drains them, i.e. the destination).

use std::rc::Rc;

use mio::Token;

use crate::{buffer::DirectionalBuffer, config::Config, conn::endpoint::Endpoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    PendingConnect,
    Wired,
    Handshaking,
    Forwarding,
    HalfClosed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Downstream,
    Upstream,
}

impl Side {
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Downstream => Side::Upstream,
            Side::Upstream => Side::Downstream,
        }
    }
}

pub struct ConnectionContext {
    pub config: Rc<Config>,
    pub state: ConnState,

    pub downstream: Option<Endpoint>,
    pub upstream: Option<Endpoint>,
    pub downstream_token: Option<Token>,
    pub upstream_token: Option<Token>,

    /// Bytes received from upstream, queued to be written to downstream.
    pub to_downstream: DirectionalBuffer,
    /// Bytes received from downstream, queued to be written to upstream.
    pub to_upstream: DirectionalBuffer,
}

impl ConnectionContext {
    pub fn new(config: Rc<Config>) -> Self {
        Self {
            config,
            state: ConnState::Accepted,
            downstream: None,
            upstream: None,
            downstream_token: None,
            upstream_token: None,
            to_downstream: DirectionalBuffer::default(),
            to_upstream: DirectionalBuffer::default(),
        }
    }

    #[inline]
    pub fn endpoint(&self, side: Side) -> Option<&Endpoint> {
        match side {
            Side::Downstream => self.downstream.as_ref(),
            Side::Upstream => self.upstream.as_ref(),
        }
    }

    #[inline]
    pub fn endpoint_mut(&mut self, side: Side) -> Option<&mut Endpoint> {
        match side {
            Side::Downstream => self.downstream.as_mut(),
            Side::Upstream => self.upstream.as_mut(),
        }
    }

    #[inline]
    pub fn token(&self, side: Side) -> Option<Token> {
        match side {
            Side::Downstream => self.downstream_token,
            Side::Upstream => self.upstream_token,
        }
    }

    #[inline]
    pub fn set_token(&mut self, side: Side, token: Option<Token>) {
        match side {
            Side::Downstream => self.downstream_token = token,
            Side::Upstream => self.upstream_token = token,
        }
    }

    /// Buffer holding bytes queued *to* `side` (i.e. filled by the opposite
    /// side's recv, drained by `side`'s send).
    #[inline]
    pub fn outgoing_to(&self, side: Side) -> &DirectionalBuffer {
        match side {
            Side::Downstream => &self.to_downstream,
            Side::Upstream => &self.to_upstream,
        }
    }

    /// Borrows, simultaneously, the buffer that `reading_side`'s recv fills
    /// (the one addressed to the *other* side) and `reading_side`'s own
    /// endpoint to read from. A single method so both borrows are disjoint
    /// fields the borrow checker can see through in one call.
    #[inline]
    pub fn recv_pair(&mut self, reading_side: Side) -> (&mut DirectionalBuffer, Option<&mut Endpoint>) {
        match reading_side {
            Side::Downstream => (&mut self.to_upstream, self.downstream.as_mut()),
            Side::Upstream => (&mut self.to_downstream, self.upstream.as_mut()),
        }
    }

    /// Borrows, simultaneously, the buffer addressed to `writing_side` and
    /// `writing_side`'s own endpoint to drain it into.
    #[inline]
    pub fn send_pair(&mut self, writing_side: Side) -> (&mut DirectionalBuffer, Option<&mut Endpoint>) {
        match writing_side {
            Side::Downstream => (&mut self.to_downstream, self.downstream.as_mut()),
            Side::Upstream => (&mut self.to_upstream, self.upstream.as_mut()),
        }
    }

    #[inline]
    pub fn is_fully_closed(&self) -> bool {
        self.downstream.is_none() && self.upstream.is_none()
    }
}
