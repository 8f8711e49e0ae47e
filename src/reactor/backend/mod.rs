//! OS readiness backends.
//!
//! One backend per platform, selected at compile time, both exposing the same
//! surface: register sources, wait for a batch of slot events, acknowledge
//! consumed triggers. Timers and user events are first-class kernel filters on
//! kqueue; on epoll they are backed by a `timerfd`/`eventfd` owned by the
//! event record.

use std::fmt;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::{Backend, TimerSource, UserSource};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub(crate) use kqueue::{Backend, TimerSource, UserSource};

/// How many readiness notifications one wait may return. Kept small so the
/// deferred-free list is drained between batches.
pub(crate) const EVENTS_PER_BATCH: usize = 5;

/// What a registration watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Server,
    Peer,
    Timer,
    User,
}

/// The value attached to every kernel registration.
///
/// `seq` is a per-registration sequence number; a batch entry whose sequence
/// no longer matches the record under that id is stale and must be skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: SourceKind,
    pub(crate) id: u16,
    pub(crate) seq: u32,
}

impl Token {
    pub(crate) fn encode(self) -> u64 {
        let kind = match self.kind {
            SourceKind::Server => 0u64,
            SourceKind::Peer => 1,
            SourceKind::Timer => 2,
            SourceKind::User => 3,
        };
        (kind << 48) | (u64::from(self.id) << 32) | u64::from(self.seq)
    }

    pub(crate) fn decode(raw: u64) -> Option<Self> {
        let kind = match raw >> 48 {
            0 => SourceKind::Server,
            1 => SourceKind::Peer,
            2 => SourceKind::Timer,
            3 => SourceKind::User,
            _ => return None,
        };
        Some(Token {
            kind,
            id: (raw >> 32) as u16,
            seq: raw as u32,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.id)
    }
}

/// The readiness class reported by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Filter {
    Read,
    Timer,
    User,
}

/// One translated readiness notification.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotEvent {
    pub(crate) token: Token,
    pub(crate) filter: Filter,
    pub(crate) eof: bool,
}

impl SlotEvent {
    /// Filler for batch buffers; never dispatched (the wait count guards it).
    pub(crate) const EMPTY: SlotEvent = SlotEvent {
        token: Token {
            kind: SourceKind::User,
            id: 0,
            seq: 0,
        },
        filter: Filter::User,
        eof: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        for kind in [
            SourceKind::Server,
            SourceKind::Peer,
            SourceKind::Timer,
            SourceKind::User,
        ] {
            let token = Token {
                kind,
                id: 0xBEEF,
                seq: 0xDEAD_CAFE,
            };
            assert_eq!(Token::decode(token.encode()), Some(token));
        }
    }

    #[test]
    fn token_rejects_unknown_kind() {
        assert_eq!(Token::decode(u64::MAX), None);
    }
}
