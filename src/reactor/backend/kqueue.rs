//! BSD/Darwin backend: kqueue. Timers and user events are native filters
//! (`EVFILT_TIMER`, `EVFILT_USER`), so no extra descriptors are consumed;
//! the kevent ident doubles as the event id.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::time::TimeSpec;
use tracing::warn;

use super::{Filter, SlotEvent, Token};

pub(crate) struct Backend {
    kq: Kqueue,
}

/// Marker for a registered `EVFILT_TIMER`; the kernel owns all state.
pub(crate) struct TimerSource;

/// Marker for a registered `EVFILT_USER`.
pub(crate) struct UserSource;

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn timer_flags() -> FilterFlag {
    FilterFlag::NOTE_CRITICAL
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn timer_flags() -> FilterFlag {
    FilterFlag::empty()
}

impl Backend {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = Kqueue::new().map_err(io::Error::from)?;
        Ok(Self { kq })
    }

    fn apply(&self, change: KEvent) -> io::Result<()> {
        self.kq
            .kevent(&[change], &mut [], Some(TimeSpec::new(0, 0)))
            .map_err(io::Error::from)?;
        Ok(())
    }

    pub(crate) fn wait(
        &self,
        timeout: Option<Duration>,
        out: &mut [SlotEvent],
    ) -> io::Result<usize> {
        let timeout = timeout.map(TimeSpec::from_duration);
        let mut events = [KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        ); super::EVENTS_PER_BATCH];

        let available = match self.kq.kevent(&[], &mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(err) => return Err(err.into()),
        };

        let mut count = 0;
        for event in &events[..available] {
            let Some(token) = Token::decode(event.udata() as u64) else {
                warn!("dropping kevent with malformed udata {:#x}", event.udata());
                continue;
            };
            let filter = match event.filter() {
                Ok(EventFilter::EVFILT_READ) => Filter::Read,
                Ok(EventFilter::EVFILT_TIMER) => Filter::Timer,
                Ok(EventFilter::EVFILT_USER) => Filter::User,
                other => {
                    warn!("unhandled kevent filter {other:?} for {token}");
                    continue;
                }
            };
            out[count] = SlotEvent {
                token,
                filter,
                eof: event.flags().contains(EventFlag::EV_EOF),
            };
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn register_read(&self, fd: BorrowedFd<'_>, token: Token) -> io::Result<()> {
        self.apply(KEvent::new(
            fd.as_raw_fd() as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            FilterFlag::empty(),
            0,
            token.encode() as isize,
        ))
    }

    pub(crate) fn unregister_read(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.apply(KEvent::new(
            fd.as_raw_fd() as usize,
            EventFilter::EVFILT_READ,
            EventFlag::EV_DELETE,
            FilterFlag::empty(),
            0,
            0,
        ))
    }

    pub(crate) fn add_timer(
        &self,
        id: u16,
        interval: Duration,
        token: Token,
    ) -> io::Result<TimerSource> {
        // EVFILT_TIMER data is in milliseconds by default and re-arms itself.
        let interval_ms = isize::try_from(interval.as_millis()).unwrap_or(isize::MAX);
        self.apply(KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_TIMER,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE,
            timer_flags(),
            interval_ms,
            token.encode() as isize,
        ))?;
        Ok(TimerSource)
    }

    pub(crate) fn remove_timer(&self, _source: &TimerSource, id: u16) -> io::Result<()> {
        self.apply(KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_TIMER,
            EventFlag::EV_DISABLE | EventFlag::EV_DELETE,
            FilterFlag::empty(),
            0,
            0,
        ))
    }

    pub(crate) fn acknowledge_timer(&self, _source: &TimerSource, _id: u16) {
        // Nothing to drain; kqueue timers deliver their count in the kevent.
    }

    pub(crate) fn add_user(&self, id: u16, token: Token) -> io::Result<UserSource> {
        self.apply(KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            token.encode() as isize,
        ))?;
        Ok(UserSource)
    }

    pub(crate) fn remove_user(&self, _source: &UserSource, id: u16) -> io::Result<()> {
        self.apply(KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_USER,
            EventFlag::EV_DELETE,
            FilterFlag::empty(),
            0,
            0,
        ))
    }

    /// Posts `NOTE_TRIGGER`. The token rides along because kevent rewrites
    /// udata on every changelist application.
    pub(crate) fn trigger_user(&self, _source: &UserSource, id: u16, token: Token) -> io::Result<()> {
        self.apply(KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            0,
            token.encode() as isize,
        ))
    }

    /// Re-arms the event with `EV_CLEAR` so the next trigger is a fresh edge.
    pub(crate) fn acknowledge_user(&self, _source: &UserSource, id: u16, token: Token) {
        let clear = KEvent::new(
            usize::from(id),
            EventFilter::EVFILT_USER,
            EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            token.encode() as isize,
        );
        if let Err(err) = self.apply(clear) {
            warn!("failed to clear triggered user event {id}: {err}");
        }
    }
}
