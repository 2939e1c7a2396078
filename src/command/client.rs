//! Client-to-server packets.

use crate::command::{capability, com, MAX_PACKET_LENGTH};
use crate::utils::mysql_password_encrypted::scramble411;

const CLIENT_CAPABILITY: u32 = capability::CLIENT_LONG_PASSWORD
    | capability::CLIENT_LONG_FLAG
    | capability::CLIENT_PROTOCOL_41
    | capability::CLIENT_INTERACTIVE
    | capability::CLIENT_TRANSACTIONS
    | capability::CLIENT_SECURE_CONNECTION
    | capability::CLIENT_MULTI_STATEMENTS
    | capability::CLIENT_PLUGIN_AUTH;

/**
 * <pre>
 * VERSION 4.1
 *  Bytes                        Name
 *  -----                        ----
 *  4                            client_flags
 *  4                            max_packet_size
 *  1                            charset_number
 *  23                           (filler) always 0x00...
 *  n (Null-Terminated String)   user
 *  n (Length Coded Binary)      scramble_buff (1 + x bytes)
 *  n (Null-Terminated String)   databasename (optional)
 *  n (Null-Terminated String)   auth plugin name (optional)
 * </pre>
 */
pub struct ClientAuthenticationPacket<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub charset_number: u8,
    pub database_name: &'a str,
    pub scramble_seed: &'a [u8],
    pub auth_plugin_name: &'a str,
}

impl<'a> ClientAuthenticationPacket<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut capabilities = CLIENT_CAPABILITY;
        if !self.database_name.is_empty() {
            capabilities |= capability::CLIENT_CONNECT_WITH_DB;
        }
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&capabilities.to_le_bytes());
        out.extend_from_slice(&MAX_PACKET_LENGTH.to_le_bytes());
        out.push(self.charset_number);
        out.extend_from_slice(&[0u8; 23]);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        if self.password.is_empty() {
            out.push(0);
        } else {
            let token = scramble411(self.password.as_bytes(), self.scramble_seed);
            out.push(token.len() as u8);
            out.extend_from_slice(&token);
        }
        if !self.database_name.is_empty() {
            out.extend_from_slice(self.database_name.as_bytes());
            out.push(0);
        }
        if !self.auth_plugin_name.is_empty() {
            out.extend_from_slice(self.auth_plugin_name.as_bytes());
            out.push(0);
        }
        out
    }
}

pub struct QueryCommandPacket<'a> {
    pub sql: &'a str,
}

impl<'a> QueryCommandPacket<'a> {
    pub fn from(sql: &'a str) -> Self {
        QueryCommandPacket { sql }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.sql.len() + 1);
        out.push(com::QUERY);
        out.extend_from_slice(self.sql.as_bytes());
        out
    }
}

/**
 * <pre>
 *  Bytes                        Name
 *  -----                        ----
 *  1                            command
 *  4                            binlog position to start at (little endian)
 *  2                            binlog flags (currently not used; always 0)
 *  4                            server_id of the slave (little endian)
 *  n                            binlog file name
 * </pre>
 */
pub struct BinlogDumpCommandPacket<'a> {
    pub binlog_position: u32,
    pub slave_server_id: u32,
    pub binlog_file_name: &'a str,
}

impl<'a> BinlogDumpCommandPacket<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.binlog_file_name.len());
        out.push(com::BINLOG_DUMP);
        out.extend_from_slice(&self.binlog_position.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.slave_server_id.to_le_bytes());
        out.extend_from_slice(self.binlog_file_name.as_bytes());
        out
    }
}

pub struct RegisterSlaveCommandPacket<'a> {
    pub report_host: &'a str,
    pub report_port: u16,
    pub report_user: &'a str,
    pub report_passwd: &'a str,
    pub server_id: u32,
}

impl<'a> RegisterSlaveCommandPacket<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(com::REGISTER_SLAVE);
        out.extend_from_slice(&self.server_id.to_le_bytes());
        out.push(self.report_host.len() as u8);
        out.extend_from_slice(self.report_host.as_bytes());
        out.push(self.report_user.len() as u8);
        out.extend_from_slice(self.report_user.as_bytes());
        out.push(self.report_passwd.len() as u8);
        out.extend_from_slice(self.report_passwd.as_bytes());
        out.extend_from_slice(&self.report_port.to_le_bytes());
        // replication rank (unused) + master id
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }
}

pub struct QuitCommandPacket;

impl QuitCommandPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![com::QUIT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_dump_layout() {
        let pkt = BinlogDumpCommandPacket {
            binlog_position: 12345,
            slave_server_id: 1001,
            binlog_file_name: "mysql-bin.000042",
        };
        let bytes = pkt.to_bytes();
        assert_eq!(bytes[0], com::BINLOG_DUMP);
        assert_eq!(u32::from_le_bytes(bytes[1..5].try_into().unwrap()), 12345);
        assert_eq!(&bytes[5..7], &[0, 0]);
        assert_eq!(u32::from_le_bytes(bytes[7..11].try_into().unwrap()), 1001);
        assert_eq!(&bytes[11..], b"mysql-bin.000042");
    }

    #[test]
    fn test_auth_packet_filler_and_user() {
        let pkt = ClientAuthenticationPacket {
            username: "repl",
            password: "",
            charset_number: 33,
            database_name: "",
            scramble_seed: &[],
            auth_plugin_name: "mysql_native_password",
        };
        let bytes = pkt.to_bytes();
        // 4 flags + 4 max packet + 1 charset + 23 filler
        assert_eq!(bytes[8], 33);
        assert!(bytes[9..32].iter().all(|b| *b == 0));
        assert_eq!(&bytes[32..36], b"repl");
        assert_eq!(bytes[36], 0);
        // empty password: single 0 length byte
        assert_eq!(bytes[37], 0);
    }

    #[test]
    fn test_query_command() {
        let bytes = QueryCommandPacket::from("select 1").to_bytes();
        assert_eq!(bytes[0], com::QUERY);
        assert_eq!(&bytes[1..], b"select 1");
    }
}
