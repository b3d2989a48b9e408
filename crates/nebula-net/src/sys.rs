//! Thin readiness-wait layer over `poll(2)` / `WSAPoll`.
//!
//! Both backends are level-triggered: a socket with unread data keeps
//! reporting readable until it is drained, which is what a once-per-tick
//! poll loop needs.

use std::io;
use std::time::{Duration, Instant};

#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
pub(crate) use windows::*;

/// Convert an optional timeout into the millisecond argument `poll` expects.
///
/// `None` waits forever (`-1`); sub-millisecond remainders round up so a
/// short deadline does not degrade into a busy loop.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if Duration::from_millis(ms as u64) < t {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Millisecond argument for a wait that must end by `deadline`.
///
/// A deadline already in the past yields `0`, so the wait only samples.
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn remaining_ms(deadline: Option<Instant>) -> i32 {
    timeout_ms(deadline.map(|d| d.saturating_duration_since(Instant::now())))
}

/// Block until `socket` is readable or the timeout elapses.
pub(crate) fn wait_readable(socket: RawSocket, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [PollFd::readable(socket)];
    Ok(poll(&mut fds, timeout)? > 0)
}

/// Block until `socket` can accept more bytes or the timeout elapses.
pub(crate) fn wait_writable(socket: RawSocket, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [PollFd::writable(socket)];
    Ok(poll(&mut fds, timeout)? > 0)
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::time::{Duration, Instant};

    pub(crate) type RawSocket = std::os::fd::RawFd;

    pub(crate) fn raw_socket<S: std::os::fd::AsRawFd>(s: &S) -> RawSocket {
        s.as_raw_fd()
    }

    /// One entry of a poll set.
    #[derive(Clone, Copy)]
    #[repr(transparent)]
    pub(crate) struct PollFd(libc::pollfd);

    impl PollFd {
        pub(crate) fn readable(socket: RawSocket) -> Self {
            Self(libc::pollfd {
                fd: socket,
                events: libc::POLLIN,
                revents: 0,
            })
        }

        pub(crate) fn writable(socket: RawSocket) -> Self {
            Self(libc::pollfd {
                fd: socket,
                events: libc::POLLOUT,
                revents: 0,
            })
        }

        pub(crate) fn socket(&self) -> RawSocket {
            self.0.fd
        }

        /// Readiness reported by the last wait. Hang-up and error count as
        /// ready because the next read returns immediately.
        pub(crate) fn is_ready(&self) -> bool {
            self.0.revents != 0
        }

        pub(crate) fn clear(&mut self) {
            self.0.revents = 0;
        }
    }

    /// Wait on every entry; returns how many entries are ready.
    ///
    /// A signal interrupting the wait resumes it with whatever time is left.
    pub(crate) fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut timeout = super::timeout_ms(timeout);
        loop {
            // SAFETY: `PollFd` is `repr(transparent)` over `libc::pollfd` and the
            // slice stays borrowed for the duration of the call.
            let rc = unsafe {
                libc::poll(
                    fds.as_mut_ptr().cast::<libc::pollfd>(),
                    fds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            timeout = super::remaining_ms(deadline);
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::time::Duration;

    use windows_sys::Win32::Networking::WinSock::{
        POLLRDNORM, POLLWRNORM, SOCKET, SOCKET_ERROR, WSAPOLLFD, WSAPoll,
    };

    pub(crate) type RawSocket = std::os::windows::io::RawSocket;

    pub(crate) fn raw_socket<S: std::os::windows::io::AsRawSocket>(s: &S) -> RawSocket {
        s.as_raw_socket()
    }

    #[derive(Clone, Copy)]
    #[repr(transparent)]
    pub(crate) struct PollFd(WSAPOLLFD);

    impl PollFd {
        pub(crate) fn readable(socket: RawSocket) -> Self {
            Self(WSAPOLLFD {
                fd: socket as SOCKET,
                events: POLLRDNORM,
                revents: 0,
            })
        }

        pub(crate) fn writable(socket: RawSocket) -> Self {
            Self(WSAPOLLFD {
                fd: socket as SOCKET,
                events: POLLWRNORM,
                revents: 0,
            })
        }

        pub(crate) fn socket(&self) -> RawSocket {
            self.0.fd as RawSocket
        }

        pub(crate) fn is_ready(&self) -> bool {
            self.0.revents != 0
        }

        pub(crate) fn clear(&mut self) {
            self.0.revents = 0;
        }
    }

    pub(crate) fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = super::timeout_ms(timeout);
        // SAFETY: `PollFd` is `repr(transparent)` over `WSAPOLLFD`.
        let rc = unsafe { WSAPoll(fds.as_mut_ptr().cast::<WSAPOLLFD>(), fds.len() as u32, timeout) };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}
