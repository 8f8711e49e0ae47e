//! Linux backend: epoll, with timers and user events carried by a `timerfd`
//! and an `eventfd` respectively. Both extra descriptors are owned by the
//! event record through [`TimerSource`] / [`UserSource`] and close with it.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::warn;

use super::{Filter, SlotEvent, SourceKind, Token};

pub(crate) struct Backend {
    epoll: Epoll,
}

/// A periodic timerfd armed with `it_value == it_interval`.
pub(crate) struct TimerSource {
    fd: TimerFd,
}

/// A non-blocking eventfd; triggering writes 1, coalescing in the counter.
pub(crate) struct UserSource {
    fd: EventFd,
}

impl Backend {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self { epoll })
    }

    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        out: &mut [SlotEvent],
    ) -> io::Result<usize> {
        // Timeouts beyond the epoll range degrade to an indefinite wait.
        let timeout = timeout
            .and_then(|d| EpollTimeout::try_from(d).ok())
            .unwrap_or(EpollTimeout::NONE);

        let mut events = [EpollEvent::empty(); super::EVENTS_PER_BATCH];
        let available = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };

        let mut count = 0;
        for event in &events[..available] {
            let Some(token) = Token::decode(event.data()) else {
                warn!("dropping readiness event with malformed token {:#x}", event.data());
                continue;
            };
            // epoll reports no filter of its own; the kind of the registered
            // source determines how the event is classified.
            let filter = match token.kind {
                SourceKind::Server | SourceKind::Peer => Filter::Read,
                SourceKind::Timer => Filter::Timer,
                SourceKind::User => Filter::User,
            };
            let eof = event
                .events()
                .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP);
            out[count] = SlotEvent { token, filter, eof };
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn register_read(&self, fd: BorrowedFd<'_>, token: Token) -> io::Result<()> {
        let event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            token.encode(),
        );
        self.epoll.add(fd, event).map_err(io::Error::from)
    }

    pub(crate) fn unregister_read(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.epoll.delete(fd).map_err(io::Error::from)
    }

    pub(crate) fn add_timer(
        &self,
        _id: u16,
        interval: Duration,
        token: Token,
    ) -> io::Result<TimerSource> {
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(io::Error::from)?;
        fd.set(
            Expiration::Interval(TimeSpec::from_duration(interval)),
            TimerSetTimeFlags::empty(),
        )
        .map_err(io::Error::from)?;
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token.encode());
        self.epoll.add(&fd, event).map_err(io::Error::from)?;
        Ok(TimerSource { fd })
    }

    pub(crate) fn remove_timer(&self, source: &TimerSource, _id: u16) -> io::Result<()> {
        self.epoll.delete(&source.fd).map_err(io::Error::from)
    }

    /// Discards the expiration counter so the level-triggered fd goes quiet.
    pub(crate) fn acknowledge_timer(&self, source: &TimerSource, id: u16) {
        let mut count = [0u8; 8];
        if let Err(err) = nix::unistd::read(source.fd.as_fd().as_raw_fd(), &mut count) {
            warn!("failed to clear timer {id}: {err}");
        }
    }

    pub(crate) fn add_user(&self, _id: u16, token: Token) -> io::Result<UserSource> {
        let fd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token.encode());
        self.epoll.add(&fd, event).map_err(io::Error::from)?;
        Ok(UserSource { fd })
    }

    pub(crate) fn remove_user(&self, source: &UserSource, _id: u16) -> io::Result<()> {
        self.epoll.delete(&source.fd).map_err(io::Error::from)
    }

    pub(crate) fn trigger_user(&self, source: &UserSource, _id: u16, _token: Token) -> io::Result<()> {
        source.fd.write(1).map_err(io::Error::from)?;
        Ok(())
    }

    /// Drains the eventfd counter, collapsing any burst of triggers into the
    /// single callback invocation that just ran.
    pub(crate) fn acknowledge_user(&self, source: &UserSource, id: u16, _token: Token) {
        if let Err(err) = source.fd.read() {
            warn!("failed to clear user event {id}: {err}");
        }
    }
}
