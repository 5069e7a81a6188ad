//! The OS-level blocking primitive the run loop falls back to when no
//! coroutine is ready.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// What a coroutine waits for on a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_poll_events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
            Interest::ReadWrite => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// What a file descriptor turned out to be ready for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error, hang-up or invalid descriptor.
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}

/// One descriptor a blocked coroutine is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Readiness of the registration at `index` in the slice given to `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub index: usize,
    pub readiness: Readiness,
}

/// Blocks the thread until the earlier of a timeout or I/O readiness.
pub trait Waiter {
    /// Waits for any of `interests`, at most `timeout` (`None` is forever).
    ///
    /// An interrupted wait returns an empty list; the caller simply checks
    /// its timers again.
    fn wait(&mut self, interests: &[Registration], timeout: Option<Duration>)
        -> io::Result<Vec<Event>>;
}

/// [`Waiter`] built on `poll(2)`.
#[derive(Debug, Default)]
pub struct PollWaiter {
    fds: Vec<libc::pollfd>,
}

impl PollWaiter {
    pub fn new() -> Self {
        PollWaiter::default()
    }
}

impl Waiter for PollWaiter {
    fn wait(
        &mut self,
        interests: &[Registration],
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Event>> {
        self.fds.clear();
        self.fds.extend(interests.iter().map(|r| libc::pollfd {
            fd: r.fd,
            events: r.interest.to_poll_events(),
            revents: 0,
        }));
        let timeout = match timeout {
            // round up so the deadline has passed once poll returns
            Some(d) => {
                let millis = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
            None => -1,
        };
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let events = self
            .fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| fd.revents != 0)
            .map(|(index, fd)| Event {
                index,
                readiness: Readiness {
                    readable: fd.revents & libc::POLLIN != 0,
                    writable: fd.revents & libc::POLLOUT != 0,
                    error: fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
                },
            })
            .collect();
        Ok(events)
    }
}
