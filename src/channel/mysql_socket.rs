//! MySQL/MariaDB client session: handshake, authentication, text-protocol
//! queries, and the binlog dump stream.

use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::read_write_packet::{read_packet, write_body, write_command};
use crate::channel::{SocketChannel, TcpChannel};
use crate::command::client::{
    BinlogDumpCommandPacket, ClientAuthenticationPacket, QueryCommandPacket, QuitCommandPacket,
    RegisterSlaveCommandPacket,
};
use crate::command::server::{
    AuthSwitchRequestPacket, ErrorPacket, FieldPacket, HandshakeInitializationPacket,
    ResultSetPacket, RowDataPacket,
};
use crate::command::{response, DEFAULT_PROTOCOL_VERSION};
use crate::error::{StreamError, StreamResult};
use crate::log::log_buffer::LogBuffer;
use crate::utils::mysql_password_encrypted::scramble411;

const DEFAULT_CHARSET_NUMBER: u8 = 33;

pub struct MysqlConnection {
    address: String,
    port: u16,
    username: String,
    password: String,
    default_schema: String,
    charset_number: u8,
    slave_id: u32,
    channel: Option<TcpChannel>,
    server_version: String,
    dumping: bool,
}

impl MysqlConnection {
    pub fn from_schema(
        address: String,
        port: u16,
        username: String,
        password: String,
        default_schema: String,
    ) -> MysqlConnection {
        MysqlConnection {
            address,
            port,
            username,
            password,
            default_schema,
            charset_number: DEFAULT_CHARSET_NUMBER,
            slave_id: 0,
            channel: None,
            server_version: String::new(),
            dumping: false,
        }
    }

    pub fn set_slave_id(&mut self, slave_id: u32) {
        self.slave_id = slave_id;
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// A second session with the same credentials, used for metadata
    /// lookups while the main session is dumping.
    pub fn fork(&self) -> MysqlConnection {
        MysqlConnection::from_schema(
            self.address.clone(),
            self.port,
            self.username.clone(),
            self.password.clone(),
            self.default_schema.clone(),
        )
    }

    pub fn connect(&mut self) -> StreamResult<()> {
        if self.channel.is_some() {
            debug!("connection to {}:{} already established", self.address, self.port);
            return Ok(());
        }
        let mut channel = TcpChannel::new(&self.address, self.port)?;
        self.negotiate(&mut channel)?;
        self.channel = Some(channel);
        info!(
            "connected to mysql {}:{} (server {})",
            self.address, self.port, self.server_version
        );
        Ok(())
    }

    fn negotiate(&mut self, channel: &mut TcpChannel) -> StreamResult<()> {
        let (sequence, body) = read_packet(channel)?;
        match body.first() {
            Some(&response::ERROR) => {
                let error = ErrorPacket::from_bytes(&body)?;
                return Err(StreamError::Connection(format!("handshake failed: {}", error)));
            }
            Some(&0xfe) => {
                return Err(StreamError::Connection(
                    "unexpected EOF packet at handshake phase".to_string(),
                ));
            }
            None => {
                return Err(StreamError::Connection("empty handshake packet".to_string()));
            }
            _ => {}
        }
        let handshake = HandshakeInitializationPacket::from_bytes(&body)?;
        if handshake.protocol_version != DEFAULT_PROTOCOL_VERSION {
            return Err(StreamError::Connection(format!(
                "unsupported protocol version {}",
                handshake.protocol_version
            )));
        }
        self.server_version = handshake.server_version.clone();

        let auth = ClientAuthenticationPacket {
            username: &self.username,
            password: &self.password,
            charset_number: self.charset_number,
            database_name: &self.default_schema,
            scramble_seed: &handshake.full_seed(),
            auth_plugin_name: "mysql_native_password",
        };
        write_body(channel, &auth.to_bytes(), sequence + 1)?;

        let (sequence, body) = read_packet(channel)?;
        match body.first() {
            Some(&response::OK) => Ok(()),
            Some(&response::ERROR) => {
                let error = ErrorPacket::from_bytes(&body)?;
                Err(StreamError::Connection(format!("auth failed: {}", error)))
            }
            Some(&response::AUTH_SWITCH) => {
                let switch = AuthSwitchRequestPacket::from_bytes(&body)?;
                if switch.auth_name != "mysql_native_password" {
                    return Err(StreamError::Connection(format!(
                        "unsupported auth plugin: {}",
                        switch.auth_name
                    )));
                }
                let token = scramble411(self.password.as_bytes(), &switch.auth_data);
                write_body(channel, &token, sequence + 1)?;
                let (_, body) = read_packet(channel)?;
                match body.first() {
                    Some(&response::OK) => Ok(()),
                    Some(&response::ERROR) => {
                        let error = ErrorPacket::from_bytes(&body)?;
                        Err(StreamError::Connection(format!("auth failed: {}", error)))
                    }
                    other => Err(StreamError::Connection(format!(
                        "unexpected auth response lead: {:?}",
                        other
                    ))),
                }
            }
            other => Err(StreamError::Connection(format!(
                "unexpected handshake response lead: {:?}",
                other
            ))),
        }
    }

    fn channel(&mut self) -> StreamResult<&mut TcpChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| StreamError::Connection("not connected".to_string()))
    }

    /// Run a statement that produces a resultset.
    pub fn query(&mut self, sql: &str) -> StreamResult<ResultSetPacket> {
        let command = QueryCommandPacket::from(sql).to_bytes();
        let channel = self.channel()?;
        write_command(channel, &command)?;

        let (_, body) = read_packet(channel)?;
        match body.first() {
            Some(&response::ERROR) => {
                let error = ErrorPacket::from_bytes(&body)?;
                return Err(StreamError::Protocol(format!("query `{}`: {}", sql, error)));
            }
            Some(&response::OK) => return Ok(ResultSetPacket::default()),
            None => return Err(StreamError::Protocol("empty query response".to_string())),
            _ => {}
        }

        let mut buf = LogBuffer::from(body);
        let column_count = buf.get_packed_long()?;
        let mut result = ResultSetPacket::default();
        for _ in 0..column_count {
            let (_, body) = read_packet(channel)?;
            result.field_descriptors.push(FieldPacket::from_bytes(&body)?);
        }
        Self::expect_eof(channel)?;
        loop {
            let (_, body) = read_packet(channel)?;
            match body.first() {
                Some(&0xfe) if body.len() < 9 => break,
                Some(&response::ERROR) => {
                    let error = ErrorPacket::from_bytes(&body)?;
                    return Err(StreamError::Protocol(format!("query `{}`: {}", sql, error)));
                }
                _ => result.rows.push(RowDataPacket::from_bytes(&body)?),
            }
        }
        Ok(result)
    }

    /// Run a statement with no resultset (SET and friends).
    pub fn update(&mut self, sql: &str) -> StreamResult<()> {
        let command = QueryCommandPacket::from(sql).to_bytes();
        let channel = self.channel()?;
        write_command(channel, &command)?;
        let (_, body) = read_packet(channel)?;
        match body.first() {
            Some(&response::OK) => Ok(()),
            Some(&response::ERROR) => {
                let error = ErrorPacket::from_bytes(&body)?;
                Err(StreamError::Protocol(format!("update `{}`: {}", sql, error)))
            }
            other => Err(StreamError::Protocol(format!(
                "unexpected update response lead: {:?}",
                other
            ))),
        }
    }

    fn expect_eof(channel: &mut TcpChannel) -> StreamResult<()> {
        let (_, body) = read_packet(channel)?;
        match body.first() {
            Some(&0xfe) if body.len() < 9 => Ok(()),
            other => Err(StreamError::Protocol(format!(
                "expected EOF packet, got lead {:?}",
                other
            ))),
        }
    }

    /// Probe whether the server appends a CRC32 trailer to binlog events,
    /// and keep it sending one if so.
    pub fn probe_checksum(&mut self) -> StreamResult<bool> {
        let result = self.query("SHOW GLOBAL VARIABLES LIKE 'binlog_checksum'")?;
        let has_checksum = result
            .rows
            .first()
            .and_then(|row| row.columns.get(1).cloned().flatten())
            .map(|v| !v.is_empty() && !v.eq_ignore_ascii_case("NONE"))
            .unwrap_or(false);
        if has_checksum {
            self.update("SET @master_binlog_checksum = @@global.binlog_checksum")?;
        }
        Ok(has_checksum)
    }

    /// Announce slave capabilities before requesting the dump.
    pub fn announce_capabilities(&mut self) -> StreamResult<()> {
        // MariaDB ignores unknown user variables on MySQL and vice versa.
        if let Err(e) = self.update("SET @mariadb_slave_capability = 4") {
            debug!("mariadb capability announce skipped: {}", e);
        }
        if let Err(e) = self.update("SET @slave_uuid = uuid()") {
            debug!("slave uuid announce skipped: {}", e);
        }
        Ok(())
    }

    pub fn query_server_id(&mut self) -> StreamResult<u32> {
        let result = self.query("SHOW VARIABLES LIKE 'server_id'")?;
        result
            .rows
            .first()
            .and_then(|row| row.columns.get(1).cloned().flatten())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StreamError::Protocol("server_id unavailable".to_string()))
    }

    /// Register and issue COM_BINLOG_DUMP at `(file, position)`.
    pub fn dump(&mut self, binlog_file: &str, position: u32) -> StreamResult<()> {
        let register = RegisterSlaveCommandPacket {
            report_host: "",
            report_port: 0,
            report_user: "",
            report_passwd: "",
            server_id: self.slave_id,
        }
        .to_bytes();
        let slave_id = self.slave_id;
        let channel = self.channel()?;
        write_command(channel, &register)?;
        let (_, body) = read_packet(channel)?;
        if body.first() == Some(&response::ERROR) {
            let error = ErrorPacket::from_bytes(&body)?;
            warn!("register slave refused: {}", error);
        }

        let dump = BinlogDumpCommandPacket {
            binlog_position: position,
            slave_server_id: slave_id,
            binlog_file_name: binlog_file,
        }
        .to_bytes();
        let channel = self.channel()?;
        write_command(channel, &dump)?;
        self.dumping = true;
        info!("binlog dump started at {}:{}", binlog_file, position);
        Ok(())
    }

    /// Next raw binlog event (header + body, without the network status
    /// byte). `Ok(None)` means the server ended the stream.
    pub fn fetch_binlog_event(&mut self) -> StreamResult<Option<Vec<u8>>> {
        if !self.dumping {
            return Err(StreamError::Protocol("not dumping".to_string()));
        }
        let channel = self.channel()?;
        let (_, mut body) = read_packet(channel)?;
        match body.first() {
            Some(&response::OK) => {
                body.remove(0);
                Ok(Some(body))
            }
            Some(&response::ERROR) => {
                let error = ErrorPacket::from_bytes(&body)?;
                Err(StreamError::Protocol(format!("binlog stream: {}", error)))
            }
            Some(&0xfe) => Ok(None),
            other => Err(StreamError::Protocol(format!(
                "unexpected binlog packet lead: {:?}",
                other
            ))),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> StreamResult<()> {
        self.channel()?.set_read_timeout(timeout)
    }

    /// Stream handle for the supervisor's out-of-band shutdown.
    pub fn try_clone_stream(&self) -> Option<TcpStream> {
        self.channel
            .as_ref()
            .and_then(|c| c.try_clone_stream().ok())
    }

    pub fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if !self.dumping {
                let quit = QuitCommandPacket.to_bytes();
                write_command(&mut channel, &quit).ok();
            }
            channel.close();
        }
        self.dumping = false;
    }
}

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
