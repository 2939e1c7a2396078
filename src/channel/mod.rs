//! Blocking TCP transport shared by both dialects.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};

pub mod mysql_socket;
pub mod pg_socket;
pub mod read_write_packet;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub trait SocketChannel {
    fn write(&mut self, buf: &[u8]) -> StreamResult<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> StreamResult<()>;
    fn is_connected(&self) -> bool;
    fn close(&mut self);
}

pub struct TcpChannel {
    channel: TcpStream,
    is_connected: bool,
}

impl TcpChannel {
    pub fn new(addr: &str, port: u16) -> StreamResult<TcpChannel> {
        let addrs: Vec<_> = std::net::ToSocketAddrs::to_socket_addrs(&(addr, port))
            .map_err(|e| StreamError::Connection(format!("resolve {}:{}: {}", addr, port, e)))?
            .collect();
        let mut last_err = None;
        for sock_addr in addrs {
            match TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT) {
                Ok(channel) => {
                    channel.set_nodelay(true).ok();
                    return Ok(TcpChannel {
                        channel,
                        is_connected: true,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(StreamError::Connection(format!(
            "connect {}:{}: {}",
            addr,
            port,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string())
        )))
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> StreamResult<()> {
        self.channel.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Clone of the underlying stream, for out-of-band shutdown by the
    /// supervisor.
    pub fn try_clone_stream(&self) -> StreamResult<TcpStream> {
        Ok(self.channel.try_clone()?)
    }
}

impl SocketChannel for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> StreamResult<()> {
        self.channel.write_all(buf)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> StreamResult<()> {
        self.channel.read_exact(buf)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected
    }

    fn close(&mut self) {
        self.channel.shutdown(Shutdown::Both).ok();
        self.is_connected = false;
    }
}
