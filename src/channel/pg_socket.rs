//! PostgreSQL client session over the v3 frontend protocol: startup with
//! `replication=database`, password authentication, simple queries, and
//! the COPY-BOTH replication stream.

use std::time::Duration;

use tracing::{debug, info};

use crate::channel::{SocketChannel, TcpChannel};
use crate::error::{StreamError, StreamResult};
use crate::log::log_buffer::LogBuffer;

const PROTOCOL_VERSION: u32 = 196608; // 3.0

// Backend message leads.
const MSG_AUTH: u8 = b'R';
const MSG_PARAMETER_STATUS: u8 = b'S';
const MSG_BACKEND_KEY: u8 = b'K';
const MSG_READY: u8 = b'Z';
const MSG_ERROR: u8 = b'E';
const MSG_NOTICE: u8 = b'N';
const MSG_ROW_DESCRIPTION: u8 = b'T';
const MSG_DATA_ROW: u8 = b'D';
const MSG_COMMAND_COMPLETE: u8 = b'C';
const MSG_EMPTY_QUERY: u8 = b'I';
const MSG_COPY_BOTH_RESPONSE: u8 = b'W';
const MSG_COPY_DATA: u8 = b'd';
const MSG_COPY_DONE: u8 = b'c';

const AUTH_OK: u32 = 0;
const AUTH_CLEARTEXT: u32 = 3;
const AUTH_MD5: u32 = 5;
const AUTH_SASL: u32 = 10;

#[derive(Debug)]
pub struct BackendMessage {
    pub kind: u8,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct PgResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl PgResultSet {
    pub fn value_of(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

pub struct PgConnection {
    host: String,
    port: u16,
    username: String,
    password: String,
    dbname: String,
    channel: Option<TcpChannel>,
}

impl PgConnection {
    pub fn new(
        host: String,
        port: u16,
        username: String,
        password: String,
        dbname: String,
    ) -> PgConnection {
        PgConnection {
            host,
            port,
            username,
            password,
            dbname,
            channel: None,
        }
    }

    /// Dial and authenticate. With `replication` set the session speaks
    /// the walsender subprotocol while still accepting simple queries.
    pub fn connect(&mut self, replication: bool) -> StreamResult<()> {
        let mut channel = TcpChannel::new(&self.host, self.port)?;

        let mut params: Vec<(&str, &str)> = vec![
            ("user", self.username.as_str()),
            ("database", self.dbname.as_str()),
            ("application_name", "mini-cdc"),
        ];
        if replication {
            params.push(("replication", "database"));
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        for (k, v) in params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut startup = Vec::with_capacity(payload.len() + 4);
        startup.extend_from_slice(&((payload.len() as u32 + 4).to_be_bytes()));
        startup.extend_from_slice(&payload);
        channel.write(&startup)?;

        self.channel = Some(channel);
        self.authenticate()?;
        self.consume_until_ready()?;
        info!(
            "connected to postgres {}:{}/{} (replication={})",
            self.host, self.port, self.dbname, replication
        );
        Ok(())
    }

    fn channel(&mut self) -> StreamResult<&mut TcpChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| StreamError::Connection("not connected".to_string()))
    }

    fn read_message(&mut self) -> StreamResult<BackendMessage> {
        let channel = self.channel()?;
        let mut head = [0u8; 5];
        channel.read_exact(&mut head)?;
        let kind = head[0];
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len < 4 {
            return Err(StreamError::Protocol(format!(
                "bad message length {} for '{}'",
                len, kind as char
            )));
        }
        let mut body = vec![0u8; len - 4];
        channel.read_exact(&mut body)?;
        Ok(BackendMessage { kind, body })
    }

    fn send_message(&mut self, kind: u8, body: &[u8]) -> StreamResult<()> {
        let channel = self.channel()?;
        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(kind);
        out.extend_from_slice(&((body.len() as u32 + 4).to_be_bytes()));
        out.extend_from_slice(body);
        channel.write(&out)
    }

    fn authenticate(&mut self) -> StreamResult<()> {
        loop {
            let msg = self.read_message()?;
            match msg.kind {
                MSG_AUTH => {
                    let mut buf = LogBuffer::from(msg.body);
                    let code = buf.get_uint32_big_endian()?;
                    match code {
                        AUTH_OK => return Ok(()),
                        AUTH_CLEARTEXT => {
                            let mut body = self.password.clone().into_bytes();
                            body.push(0);
                            self.send_message(b'p', &body)?;
                        }
                        AUTH_MD5 => {
                            let salt = buf.get_data(4)?;
                            let token = md5_password(&self.username, &self.password, &salt);
                            let mut body = token.into_bytes();
                            body.push(0);
                            self.send_message(b'p', &body)?;
                        }
                        AUTH_SASL => {
                            return Err(StreamError::Connection(
                                "server requires SCRAM authentication, which this client does not speak"
                                    .to_string(),
                            ));
                        }
                        other => {
                            return Err(StreamError::Connection(format!(
                                "unsupported authentication request: {}",
                                other
                            )));
                        }
                    }
                }
                MSG_ERROR => {
                    return Err(StreamError::Connection(format!(
                        "authentication failed: {}",
                        parse_error_fields(&msg.body)
                    )));
                }
                other => {
                    return Err(StreamError::Connection(format!(
                        "unexpected message '{}' during authentication",
                        other as char
                    )));
                }
            }
        }
    }

    fn consume_until_ready(&mut self) -> StreamResult<()> {
        loop {
            let msg = self.read_message()?;
            match msg.kind {
                MSG_READY => return Ok(()),
                MSG_PARAMETER_STATUS | MSG_BACKEND_KEY | MSG_NOTICE => {}
                MSG_ERROR => {
                    return Err(StreamError::Connection(parse_error_fields(&msg.body)));
                }
                other => {
                    debug!("ignoring startup message '{}'", other as char);
                }
            }
        }
    }

    /// Simple-protocol query collecting every data row as text.
    pub fn simple_query(&mut self, sql: &str) -> StreamResult<PgResultSet> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.send_message(b'Q', &body)?;

        let mut result = PgResultSet::default();
        let mut error: Option<String> = None;
        loop {
            let msg = self.read_message()?;
            match msg.kind {
                MSG_ROW_DESCRIPTION => {
                    let mut buf = LogBuffer::from(msg.body);
                    let nfields = buf.get_uint16_big_endian()?;
                    for _ in 0..nfields {
                        result.columns.push(buf.get_string_nul()?);
                        buf.forward(18)?; // table oid, attnum, type oid, typlen, typmod, format
                    }
                }
                MSG_DATA_ROW => {
                    let mut buf = LogBuffer::from(msg.body);
                    let ncols = buf.get_uint16_big_endian()?;
                    let mut row = Vec::with_capacity(ncols as usize);
                    for _ in 0..ncols {
                        let len = buf.get_int32_big_endian()?;
                        if len < 0 {
                            row.push(None);
                        } else {
                            let bytes = buf.get_data(len as usize)?;
                            row.push(Some(String::from_utf8_lossy(&bytes).into_owned()));
                        }
                    }
                    result.rows.push(row);
                }
                MSG_COMMAND_COMPLETE | MSG_EMPTY_QUERY | MSG_NOTICE => {}
                MSG_ERROR => error = Some(parse_error_fields(&msg.body)),
                MSG_READY => break,
                other => {
                    debug!("ignoring query message '{}'", other as char);
                }
            }
        }
        match error {
            Some(e) => Err(StreamError::Protocol(format!("query `{}`: {}", sql, e))),
            None => Ok(result),
        }
    }

    /// Enter the COPY-BOTH replication stream.
    pub fn start_replication(
        &mut self,
        slot: &str,
        start_lsn: &str,
        publication: &str,
    ) -> StreamResult<()> {
        let sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '1', publication_names '\"{}\"')",
            slot, start_lsn, publication
        );
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        self.send_message(b'Q', &body)?;
        loop {
            let msg = self.read_message()?;
            match msg.kind {
                MSG_COPY_BOTH_RESPONSE => {
                    info!("replication started on slot {} at {}", slot, start_lsn);
                    return Ok(());
                }
                MSG_ERROR => {
                    return Err(StreamError::Connection(format!(
                        "START_REPLICATION failed: {}",
                        parse_error_fields(&msg.body)
                    )));
                }
                MSG_NOTICE => {}
                other => {
                    debug!("ignoring pre-copy message '{}'", other as char);
                }
            }
        }
    }

    /// Next CopyData payload, waiting at most `timeout`. `Ok(None)` means
    /// the poll tick elapsed with nothing buffered.
    pub fn read_copy_data(&mut self, timeout: Duration) -> StreamResult<Option<Vec<u8>>> {
        self.channel()?.set_read_timeout(Some(timeout))?;
        let msg = match self.read_message() {
            Ok(msg) => msg,
            Err(StreamError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match msg.kind {
            MSG_COPY_DATA => Ok(Some(msg.body)),
            MSG_COPY_DONE | MSG_COMMAND_COMPLETE | MSG_READY => Err(StreamError::Protocol(
                "replication stream ended by server".to_string(),
            )),
            MSG_ERROR => Err(StreamError::Protocol(parse_error_fields(&msg.body))),
            other => Err(StreamError::Protocol(format!(
                "unexpected copy message '{}'",
                other as char
            ))),
        }
    }

    /// Send one CopyData payload (standby status updates). The channel is
    /// unbuffered, so the write doubles as the flush.
    pub fn send_copy_data(&mut self, payload: &[u8]) -> StreamResult<()> {
        self.send_message(MSG_COPY_DATA, payload)
    }

    pub fn send_copy_done(&mut self) -> StreamResult<()> {
        self.send_message(MSG_COPY_DONE, &[])
    }

    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            // best-effort Terminate
            let term: [u8; 5] = [b'X', 0, 0, 0, 4];
            channel.write(&term).ok();
            channel.close();
        }
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// `md5` + hex(md5(hex(md5(password ∥ user)) ∥ salt))
fn md5_password(username: &str, password: &str, salt: &[u8]) -> String {
    let inner = md5::compute(format!("{}{}", password, username));
    let inner_hex = format!("{:x}", inner);
    let mut outer_input = inner_hex.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer_input))
}

fn parse_error_fields(body: &[u8]) -> String {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();
    let mut i = 0;
    while i < body.len() && body[i] != 0 {
        let field = body[i];
        i += 1;
        let start = i;
        while i < body.len() && body[i] != 0 {
            i += 1;
        }
        let value = String::from_utf8_lossy(&body[start..i]).into_owned();
        i += 1;
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    format!("{} {}: {}", severity, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_shape() {
        let token = md5_password("cdc", "secret", &[1, 2, 3, 4]);
        assert!(token.starts_with("md5"));
        assert_eq!(token.len(), 35);
        // deterministic
        assert_eq!(token, md5_password("cdc", "secret", &[1, 2, 3, 4]));
        assert_ne!(token, md5_password("cdc", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_parse_error_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"SERROR\0");
        body.extend_from_slice(b"C42601\0");
        body.extend_from_slice(b"Msyntax error\0");
        body.push(0);
        assert_eq!(parse_error_fields(&body), "ERROR 42601: syntax error");
    }
}
