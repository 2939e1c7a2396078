//! Run-flag supervision: signal handling and socket unblocking.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::StreamResult;

pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// Install SIGINT/SIGTERM handlers that raise the shutdown flag.
    pub fn new() -> StreamResult<Supervisor> {
        let shutdown = Arc::new(AtomicBool::new(false));
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|e| {
                crate::error::StreamError::Config(format!("signal handler: {}", e))
            })?;
        }
        Ok(Supervisor { shutdown })
    }

    /// Flag-only construction for tests.
    pub fn unsignalled() -> Supervisor {
        Supervisor {
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Watch the shutdown flag and shut the replication socket down when
    /// it is raised, unblocking a reader stuck in a socket call. The
    /// watcher exits with the flag.
    pub fn watch_socket(&self, stream: TcpStream) {
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::Builder::new()
            .name("socket-watch".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                info!("shutdown requested, closing replication socket");
                stream.shutdown(Shutdown::Both).ok();
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lifecycle() {
        let supervisor = Supervisor::unsignalled();
        assert!(supervisor.running());
        supervisor.request_shutdown();
        assert!(!supervisor.running());
    }
}
