//! Readiness registry (C2): a small fixed-capacity wrapper around `mio::Poll`
//! that adds the bookkeeping a production forwarding loop needs beyond what
//! `mio` gives for free — duplicate detection, a compact high-water mark, and **slot-order**
//! (not kernel readiness-order) dispatch within one batch.
//!
//! Ownership split: the registry owns only bookkeeping (interest mask,
//! last-observed-ready mask, raw fd) per slot. The actual `mio` sources
//! (`TcpStream`, `TcpListener`) and the data associated with them live in the
//! connection layer (C5), which drives `add`/`modify`/`remove` by passing the
//! source in for each call — mirroring how `flux-network`'s
//! `ConnectionManager` keeps sockets in its own `Vec` rather than inside the
//! poller.

use std::{
    io,
    ops::ControlFlow,
    os::fd::{AsRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::{Interest, Poll, event::Source};
use tracing::debug;

use crate::error::RegistryError;

pub use mio::Token;

/// Registry capacity, comfortably above what one proxy process needs;
/// `mio::Events` is sized to match so a single `poll()` call can observe
/// every live slot becoming ready at once.
pub const MAX_EVENTS: usize = 512;

/// Readiness observed for one slot, decoded once from a `mio::event::Event`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up; either direction's read/write handler should treat
    /// this as fatal for that side.
    pub error: bool,
}

impl Readiness {
    fn from_event(ev: &mio::event::Event) -> Self {
        Self {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            error: ev.is_error() || ev.is_read_closed() || ev.is_write_closed(),
        }
    }

    #[inline]
    fn is_empty(self) -> bool {
        !(self.readable || self.writable || self.error)
    }

    fn merge(&mut self, other: Self) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
    }
}

struct Slot {
    fd: RawFd,
    interest: Interest,
    ready: Readiness,
}

/// Fixed-capacity readiness registry driving one `mio::Poll`.
pub struct Registry {
    poll: Poll,
    events: mio::Events,
    slots: Vec<Option<Slot>>,
    /// One past the highest occupied index; bounds the slot-order scan.
    max_idx: usize,
    num_events: usize,
}

impl Registry {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: mio::Events::with_capacity(MAX_EVENTS),
            slots: (0..MAX_EVENTS).map(|_| None).collect(),
            max_idx: 0,
            num_events: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_events
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_events == 0
    }

    fn find(&self, fd: RawFd) -> Option<usize> {
        self.slots[..self.max_idx].iter().position(|s| matches!(s, Some(s) if s.fd == fd))
    }

    /// Registers a new source. Fails with `Duplicate` if its fd is already
    /// registered, `AtCapacity` if every slot is in use.
    pub fn add<S>(&mut self, source: &mut S, interest: Interest) -> Result<Token, RegistryError>
    where
        S: Source + AsRawFd,
    {
        let fd = source.as_raw_fd();
        if self.find(fd).is_some() {
            return Err(RegistryError::Duplicate);
        }

        let idx = if let Some(free) = self.slots[..self.max_idx].iter().position(Option::is_none)
        {
            free
        } else if self.max_idx < MAX_EVENTS {
            let idx = self.max_idx;
            self.max_idx += 1;
            idx
        } else {
            return Err(RegistryError::AtCapacity);
        };

        self.poll.registry().register(source, Token(idx), interest)?;
        self.slots[idx] = Some(Slot { fd, interest, ready: Readiness::default() });
        self.num_events += 1;
        Ok(Token(idx))
    }

    /// Updates the interest mask for `token`. Resets the last-observed-ready
    /// mask to zero so a readiness from the previous cycle is never
    /// re-delivered under the new interest.
    pub fn modify<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), RegistryError>
    where
        S: Source,
    {
        let slot = self.slots.get_mut(token.0).and_then(Option::as_mut).ok_or(
            RegistryError::NotFound,
        )?;
        self.poll.registry().reregister(source, token, interest)?;
        slot.interest = interest;
        slot.ready = Readiness::default();
        Ok(())
    }

    /// Clears the slot. Reusable; `max_idx` only shrinks when the freed slot
    /// was the last occupied one, keeping the polled range compact without
    /// an O(n) compaction on every remove.
    pub fn remove<S>(&mut self, source: &mut S, token: Token) -> Result<(), RegistryError>
    where
        S: Source,
    {
        if self.slots.get(token.0).and_then(Option::as_ref).is_none() {
            return Err(RegistryError::NotFound);
        }
        if let Err(err) = self.poll.registry().deregister(source) {
            debug!(?err, "registry: deregister failed (socket likely already dead)");
        }
        self.slots[token.0] = None;
        self.num_events -= 1;
        if token.0 + 1 == self.max_idx {
            while self.max_idx > 0 && self.slots[self.max_idx - 1].is_none() {
                self.max_idx -= 1;
            }
        }
        Ok(())
    }

    fn is_live(&self, token: Token, fd: RawFd) -> bool {
        matches!(self.slots.get(token.0), Some(Some(slot)) if slot.fd == fd)
    }

    /// Waits for readiness once and folds kernel-order events into
    /// per-slot ready masks.
    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        for ev in self.events.iter() {
            let idx = ev.token().0;
            if let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) {
                slot.ready.merge(Readiness::from_event(ev));
            }
        }
        Ok(())
    }

    /// Snapshots every slot with non-zero readiness, in **slot order**, and
    /// clears their masks. Detached from `self` so the caller can freely
    /// mutate the registry (add/modify/remove, including the slot just
    /// returned) while processing the batch.
    fn drain_ready(&mut self) -> Vec<(Token, RawFd, Readiness)> {
        let mut batch = Vec::new();
        for idx in 0..self.max_idx {
            if let Some(slot) = &mut self.slots[idx] {
                if !slot.ready.is_empty() {
                    batch.push((Token(idx), slot.fd, slot.ready));
                    slot.ready = Readiness::default();
                }
            }
        }
        batch
    }

    /// Runs the loop while `run_flag` is truthy, dispatching every ready slot
    /// in slot order to `handler`. If `handler` returns `Break(status)`, the
    /// loop exits immediately with that status.
    ///
    /// A slot that a handler removed earlier in the same batch (or whose
    /// index was reused by a freshly added, different descriptor) is
    /// skipped rather than misdispatched: each batch entry carries the fd it
    /// was observed on, and re-checked against the live slot before calling
    /// the handler.
    pub fn run_loop<F>(
        &mut self,
        run_flag: &AtomicBool,
        timeout: Option<Duration>,
        mut handler: F,
    ) -> io::Result<i32>
    where
        F: FnMut(&mut Registry, Token, Readiness) -> ControlFlow<i32>,
    {
        while run_flag.load(Ordering::Relaxed) {
            self.poll_once(timeout)?;
            let batch = self.drain_ready();
            for (token, fd, ready) in batch {
                if !self.is_live(token, fd) {
                    continue;
                }
                match handler(self, token, ready) {
                    ControlFlow::Continue(()) => {}
                    ControlFlow::Break(status) => return Ok(status),
                }
            }
        }
        Ok(0)
    }

    /// Closes every live descriptor (via `close_fn`, since the registry
    /// doesn't own the source values) and calls `free_fn` on each, then
    /// resets all bookkeeping.
    pub fn teardown(&mut self, mut free_fn: impl FnMut(RawFd)) {
        for slot in self.slots.iter_mut() {
            if let Some(s) = slot.take() {
                free_fn(s.fd);
            }
        }
        self.max_idx = 0;
        self.num_events = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use mio::net::TcpListener;

    use super::*;

    fn bind() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap()
    }

    #[test]
    fn add_rejects_duplicate_fd() {
        let mut reg = Registry::new().unwrap();
        let mut l = bind();
        reg.add(&mut l, Interest::READABLE).unwrap();
        let err = reg.add(&mut l, Interest::READABLE).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate));
    }

    #[test]
    fn remove_shrinks_high_water_only_from_the_tail() {
        let mut reg = Registry::new().unwrap();
        let mut a = bind();
        let mut b = bind();
        let ta = reg.add(&mut a, Interest::READABLE).unwrap();
        let tb = reg.add(&mut b, Interest::READABLE).unwrap();
        assert_eq!(reg.max_idx, 2);

        // Removing the non-last slot must not shrink max_idx.
        reg.remove(&mut a, ta).unwrap();
        assert_eq!(reg.max_idx, 2);
        assert_eq!(reg.len(), 1);

        // Removing the now-last slot shrinks it back to zero.
        reg.remove(&mut b, tb).unwrap();
        assert_eq!(reg.max_idx, 0);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn at_capacity_is_reported() {
        let mut reg = Registry::new().unwrap();
        let mut sockets: Vec<TcpListener> = (0..MAX_EVENTS).map(|_| bind()).collect();
        for s in sockets.iter_mut() {
            reg.add(s, Interest::READABLE).unwrap();
        }
        let mut one_more = bind();
        let err = reg.add(&mut one_more, Interest::READABLE).unwrap_err();
        assert!(matches!(err, RegistryError::AtCapacity));
    }
}
