//! Event loop integration
//!
//! The engine is reactor-agnostic: it only needs something that watches its
//! sockets for readability and wakes it by a deadline. The [`builtin`]
//! reactor runs on a current-thread tokio runtime; callers that own their
//! event loop implement [`Reactor`] and drive `Engine::before` /
//! `Engine::after` themselves.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

pub mod builtin;

pub use builtin::BuiltinReactor;

/// A socket the reactor should watch for readability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSource {
    pub fd: RawFd,
    pub local_addr: SocketAddr,
}

/// The engine's view of an event loop
pub trait Reactor {
    /// Start watching `source`. The loop must call `Engine::before` once it
    /// becomes readable.
    fn register(&mut self, source: IoSource) -> io::Result<()>;

    fn deregister(&mut self, source: IoSource);

    /// Wake the loop no later than `deadline`; `None` cancels the timer.
    fn schedule_timeout(&mut self, deadline: Option<Instant>);
}

/// Which loop drives the engine
#[derive(Default)]
pub(crate) enum LoopDriver {
    #[default]
    Unset,
    Builtin(BuiltinReactor),
    External(Box<dyn Reactor>),
}

impl LoopDriver {
    pub fn is_set(&self) -> bool {
        !matches!(self, LoopDriver::Unset)
    }

    pub fn reactor_mut(&mut self) -> Option<&mut dyn Reactor> {
        match self {
            LoopDriver::Unset => None,
            LoopDriver::Builtin(reactor) => Some(reactor),
            LoopDriver::External(reactor) => Some(reactor.as_mut()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoopDriver::Unset => "unset",
            LoopDriver::Builtin(_) => "builtin",
            LoopDriver::External(_) => "external",
        }
    }
}
