//! Read-readiness multiplexing over many sockets with one blocking wait.
//!
//! A [`PollGroup`] never owns its members. It stores a [`PollHandle`] token
//! for each, so members must be removed before they are dropped; a stale
//! token only ever refers to a closed (or reused) descriptor.

use std::time::Duration;

use crate::error::NetResult;
use crate::sys::{self, PollFd, RawSocket};

/// Transport family a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain TCP via the OS socket layer.
    Tcp,
}

/// Capability token identifying a pollable socket and its transport family.
///
/// Issued by the type that owns the socket; a [`PollGroup`] only accepts
/// tokens of the kind it was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle {
    kind: TransportKind,
    socket: RawSocket,
}

impl PollHandle {
    pub(crate) fn new(kind: TransportKind, socket: RawSocket) -> Self {
        Self { kind, socket }
    }

    /// Transport family of the socket behind this token.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Anything that can be registered with a [`PollGroup`].
pub trait Pollable {
    /// Token for the socket this value owns.
    fn poll_handle(&self) -> PollHandle;
}

/// Set of sockets waited on together for read-readiness.
pub struct PollGroup {
    kind: TransportKind,
    fds: Vec<PollFd>,
}

impl PollGroup {
    /// Create an empty group for members of `kind`.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            fds: Vec::new(),
        }
    }

    /// Transport family this group accepts.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Register `member`. Adding a member twice has no further effect.
    ///
    /// # Panics
    ///
    /// If `member` belongs to a different transport family than the group.
    pub fn add(&mut self, member: &impl Pollable) {
        let socket = self.checked_socket(member.poll_handle());
        if self.position(socket).is_none() {
            self.fds.push(PollFd::readable(socket));
        }
    }

    /// Unregister `member`. Removing an unknown member is a no-op.
    ///
    /// # Panics
    ///
    /// If `member` belongs to a different transport family than the group.
    pub fn remove(&mut self, member: &impl Pollable) {
        let socket = self.checked_socket(member.poll_handle());
        if let Some(index) = self.position(socket) {
            self.fds.swap_remove(index);
        }
    }

    /// Block up to `timeout` until at least one member is readable.
    ///
    /// Returns how many members are ready (0 on timeout). An empty group
    /// returns `Ok(0)` at once instead of sleeping for the timeout. Use
    /// [`is_set`](Self::is_set) or the members' own `read_ready` to find out which.
    pub fn check_sockets(&mut self, timeout: Duration) -> NetResult<usize> {
        if self.fds.is_empty() {
            return Ok(0);
        }
        for fd in &mut self.fds {
            fd.clear();
        }
        match sys::poll(&mut self.fds, Some(timeout)) {
            Ok(ready) => Ok(ready),
            Err(e) => {
                tracing::warn!("Readiness wait over {} sockets failed: {e}", self.fds.len());
                Err(e.into())
            }
        }
    }

    /// Whether `member` was reported ready by the last [`check_sockets`](Self::check_sockets).
    pub fn is_set(&self, member: &impl Pollable) -> bool {
        let handle = member.poll_handle();
        handle.kind == self.kind
            && self
                .position(handle.socket)
                .is_some_and(|index| self.fds[index].is_ready())
    }

    /// Number of registered members.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Forget every member.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    fn checked_socket(&self, handle: PollHandle) -> RawSocket {
        assert_eq!(
            handle.kind, self.kind,
            "poll group for {:?} cannot hold a {:?} socket",
            self.kind, handle.kind
        );
        handle.socket
    }

    fn position(&self, socket: RawSocket) -> Option<usize> {
        self.fds.iter().position(|fd| fd.socket() == socket)
    }
}

impl std::fmt::Debug for PollGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollGroup")
            .field("kind", &self.kind)
            .field("members", &self.fds.len())
            .finish()
    }
}
