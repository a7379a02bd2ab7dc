use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use futures::future::select_all;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Runtime;
use tracing::{debug, trace};

use super::{IoSource, Reactor};

/// Borrowed descriptor; the engine keeps ownership of the socket and
/// deregisters it before closing it.
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Reactor backed by a current-thread tokio runtime
pub struct BuiltinReactor {
    runtime: Runtime,
    sources: HashMap<RawFd, AsyncFd<SocketFd>>,
    deadline: Option<Instant>,
}

impl BuiltinReactor {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            sources: HashMap::new(),
            deadline: None,
        })
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Block until a watched socket is readable or the earlier of the
    /// scheduled deadline and `limit` passes.
    pub fn wait(&mut self, limit: Option<Instant>) {
        let deadline = match (self.deadline, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return;
        }

        let sources: Vec<&AsyncFd<SocketFd>> = self.sources.values().collect();
        trace!("Waiting on {} sockets until {:?}", sources.len(), deadline);

        self.runtime.block_on(async move {
            let readable = async {
                if sources.is_empty() {
                    return std::future::pending::<()>().await;
                }
                let waits = sources.iter().map(|fd| {
                    Box::pin(async move {
                        if let Ok(mut guard) = fd.readable().await {
                            // the engine drains the socket until it would block
                            guard.clear_ready();
                        }
                    })
                });
                select_all(waits).await;
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = readable => {}
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                    }
                }
                None => readable.await,
            }
        });
    }
}

impl Reactor for BuiltinReactor {
    fn register(&mut self, source: IoSource) -> io::Result<()> {
        let _guard = self.runtime.enter();
        // SAFETY: the engine deregisters a socket before closing it, and drops
        // its loop before its sockets, so the descriptor outlives the AsyncFd.
        let fd = unsafe { AsyncFd::register_with_interest(SocketFd(source.fd), Interest::READABLE)? };
        self.sources.insert(source.fd, fd);
        debug!("Built-in loop watching {}", source.local_addr);
        Ok(())
    }

    fn deregister(&mut self, source: IoSource) {
        if self.sources.remove(&source.fd).is_some() {
            debug!("Built-in loop stopped watching {}", source.local_addr);
        }
    }

    fn schedule_timeout(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_at_deadline() {
        let mut reactor = BuiltinReactor::new().unwrap();
        let start = Instant::now();
        reactor.schedule_timeout(Some(start + Duration::from_millis(20)));
        reactor.wait(None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_readable_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();

        let mut reactor = BuiltinReactor::new().unwrap();
        reactor
            .register(IoSource {
                fd: socket.as_raw_fd(),
                local_addr: addr,
            })
            .unwrap();
        assert_eq!(reactor.source_count(), 1);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"wake", addr).unwrap();

        let start = Instant::now();
        reactor.wait(Some(start + Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));

        reactor.deregister(IoSource {
            fd: socket.as_raw_fd(),
            local_addr: addr,
        });
        assert_eq!(reactor.source_count(), 0);
    }
}
