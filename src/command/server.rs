//! Server-to-client packets.

use crate::command::capability::{CLIENT_PLUGIN_AUTH, CLIENT_SECURE_CONNECTION};
use crate::error::{StreamError, StreamResult};
use crate::log::log_buffer::LogBuffer;

/// The 4-byte packet header every MySQL packet starts with.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderPacket {
    pub packet_body_length: usize,
    pub packet_sequence_number: u8,
}

impl HeaderPacket {
    pub fn from_bytes(buf: &[u8; 4]) -> HeaderPacket {
        HeaderPacket {
            packet_body_length: buf[0] as usize | (buf[1] as usize) << 8 | (buf[2] as usize) << 16,
            packet_sequence_number: buf[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.packet_body_length & 0xff) as u8,
            (self.packet_body_length >> 8) as u8,
            (self.packet_body_length >> 16) as u8,
            self.packet_sequence_number,
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandshakeInitializationPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub seed: Vec<u8>,
    pub server_capabilities: u32,
    pub server_charset_number: u8,
    pub server_status: u16,
    pub rest_of_scramble_buff: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakeInitializationPacket {
    pub fn from_bytes(body: &[u8]) -> StreamResult<HandshakeInitializationPacket> {
        let mut buf = LogBuffer::from(body.to_vec());
        let protocol_version = buf.get_uint8()?;
        let server_version = buf.get_string_nul()?;
        let thread_id = buf.get_uint32()?;
        let seed = buf.get_data(8)?;
        buf.forward(1)?; // filler, always 0x00
        let capability_low = buf.get_uint16()? as u32;
        let mut packet = HandshakeInitializationPacket {
            protocol_version,
            server_version,
            thread_id,
            seed,
            server_capabilities: capability_low,
            ..Default::default()
        };
        if buf.has_remaining() {
            packet.server_charset_number = buf.get_uint8()?;
            packet.server_status = buf.get_uint16()?;
            let capability_high = buf.get_uint16()? as u32;
            packet.server_capabilities |= capability_high << 16;
            let _auth_plugin_data_len = buf.get_uint8()?;
            buf.forward(10)?; // reserved
            if packet.server_capabilities & CLIENT_SECURE_CONNECTION != 0 {
                // the trailing 13th byte is a NUL, not part of the seed
                packet.rest_of_scramble_buff = buf.get_data(12)?;
                buf.forward(1)?;
            }
            if packet.server_capabilities & CLIENT_PLUGIN_AUTH != 0 {
                packet.auth_plugin_name = buf.get_string_nul()?;
            }
        }
        Ok(packet)
    }

    /// Full 20-byte scramble seed for `mysql_native_password`.
    pub fn full_seed(&self) -> Vec<u8> {
        let mut seed = self.seed.clone();
        seed.extend_from_slice(&self.rest_of_scramble_buff);
        seed
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorPacket {
    pub error_number: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrorPacket {
    pub fn from_bytes(body: &[u8]) -> StreamResult<ErrorPacket> {
        let mut buf = LogBuffer::from(body.to_vec());
        let lead = buf.get_uint8()?;
        if lead != 0xff {
            return Err(StreamError::Protocol(format!(
                "not an error packet: lead {:#x}",
                lead
            )));
        }
        let error_number = buf.get_uint16()?;
        // optional '#' marker + 5-byte SQL state
        let mut sql_state = String::new();
        let mut rest = buf.get_fix_string(buf.remaining())?;
        if rest.starts_with('#') && rest.len() >= 6 {
            sql_state = rest[1..6].to_string();
            rest = rest[6..].to_string();
        }
        Ok(ErrorPacket {
            error_number,
            sql_state,
            message: rest,
        })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error {} ({}): {}",
            self.error_number, self.sql_state, self.message
        )
    }
}

/// EOF / auth-switch-request share the 0xfe lead; the auth switch carries
/// a plugin name and a fresh seed.
#[derive(Debug, Clone, Default)]
pub struct AuthSwitchRequestPacket {
    pub auth_name: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequestPacket {
    pub fn from_bytes(body: &[u8]) -> StreamResult<AuthSwitchRequestPacket> {
        let mut buf = LogBuffer::from(body.to_vec());
        let lead = buf.get_uint8()?;
        if lead != 0xfe {
            return Err(StreamError::Protocol(format!(
                "not an auth switch packet: lead {:#x}",
                lead
            )));
        }
        let auth_name = buf.get_string_nul()?;
        let mut auth_data = buf.get_data(buf.remaining())?;
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
        Ok(AuthSwitchRequestPacket {
            auth_name,
            auth_data,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldPacket {
    pub catalog: String,
    pub db: String,
    pub table: String,
    pub original_table: String,
    pub name: String,
    pub original_name: String,
    pub character: u16,
    pub length: u32,
    pub type_: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl FieldPacket {
    pub fn from_bytes(body: &[u8]) -> StreamResult<FieldPacket> {
        let mut buf = LogBuffer::from(body.to_vec());
        let read_lenenc_string = |buf: &mut LogBuffer| -> StreamResult<String> {
            match buf.get_packed_bytes()? {
                Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                None => Ok(String::new()),
            }
        };
        let catalog = read_lenenc_string(&mut buf)?;
        let db = read_lenenc_string(&mut buf)?;
        let table = read_lenenc_string(&mut buf)?;
        let original_table = read_lenenc_string(&mut buf)?;
        let name = read_lenenc_string(&mut buf)?;
        let original_name = read_lenenc_string(&mut buf)?;
        buf.forward(1)?; // length of fixed fields, always 0x0c
        let character = buf.get_uint16()?;
        let length = buf.get_uint32()?;
        let type_ = buf.get_uint8()?;
        let flags = buf.get_uint16()?;
        let decimals = buf.get_uint8()?;
        Ok(FieldPacket {
            catalog,
            db,
            table,
            original_table,
            name,
            original_name,
            character,
            length,
            type_,
            flags,
            decimals,
        })
    }
}

/// One text-protocol result row; NULL columns come back as `None`.
#[derive(Debug, Clone, Default)]
pub struct RowDataPacket {
    pub columns: Vec<Option<String>>,
}

impl RowDataPacket {
    pub fn from_bytes(body: &[u8]) -> StreamResult<RowDataPacket> {
        let mut buf = LogBuffer::from(body.to_vec());
        let mut columns = Vec::new();
        while buf.has_remaining() {
            columns.push(
                buf.get_packed_bytes()?
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            );
        }
        Ok(RowDataPacket { columns })
    }
}

/// A complete text-protocol resultset.
#[derive(Debug, Clone, Default)]
pub struct ResultSetPacket {
    pub field_descriptors: Vec<FieldPacket>,
    pub rows: Vec<RowDataPacket>,
}

impl ResultSetPacket {
    pub fn column_names(&self) -> Vec<String> {
        self.field_descriptors
            .iter()
            .map(|f| f.name.clone())
            .collect()
    }

    /// Value at `(row, column-name)`, for probing variable queries.
    pub fn value_of(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self
            .field_descriptors
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))?;
        self.rows.get(row)?.columns.get(idx)?.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = HeaderPacket {
            packet_body_length: 0x010203,
            packet_sequence_number: 4,
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes, [0x03, 0x02, 0x01, 4]);
        let parsed = HeaderPacket::from_bytes(&bytes);
        assert_eq!(parsed.packet_body_length, 0x010203);
        assert_eq!(parsed.packet_sequence_number, 4);
    }

    #[test]
    fn test_handshake_parse() {
        let mut body = Vec::new();
        body.push(0x0a);
        body.extend_from_slice(b"8.0.36\0");
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // seed part 1
        body.push(0);
        body.extend_from_slice(&0xffffu16.to_le_bytes()); // caps low
        body.push(33); // charset
        body.extend_from_slice(&2u16.to_le_bytes()); // status
        body.extend_from_slice(&0x000fu16.to_le_bytes()); // caps high
        body.push(21); // auth data len
        body.extend_from_slice(&[0u8; 10]); // reserved
        body.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        body.push(0);
        body.extend_from_slice(b"mysql_native_password\0");
        let p = HandshakeInitializationPacket::from_bytes(&body).unwrap();
        assert_eq!(p.protocol_version, 0x0a);
        assert_eq!(p.server_version, "8.0.36");
        assert_eq!(p.full_seed().len(), 20);
        assert_eq!(p.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_error_packet() {
        let mut body = vec![0xff];
        body.extend_from_slice(&1236u16.to_le_bytes());
        body.extend_from_slice(b"#HY000Could not find first log file name");
        let e = ErrorPacket::from_bytes(&body).unwrap();
        assert_eq!(e.error_number, 1236);
        assert_eq!(e.sql_state, "HY000");
        assert!(e.message.starts_with("Could not find"));
    }

    #[test]
    fn test_row_data_with_null() {
        let body = vec![0x01, b'a', 0xfb, 0x02, b'b', b'c'];
        let row = RowDataPacket::from_bytes(&body).unwrap();
        assert_eq!(row.columns[0].as_deref(), Some("a"));
        assert_eq!(row.columns[1], None);
        assert_eq!(row.columns[2].as_deref(), Some("bc"));
    }

    #[test]
    fn test_field_packet_name() {
        let mut body = Vec::new();
        for s in ["def", "shop", "orders", "orders", "id", "id"] {
            body.push(s.len() as u8);
            body.extend_from_slice(s.as_bytes());
        }
        body.push(0x0c);
        body.extend_from_slice(&33u16.to_le_bytes());
        body.extend_from_slice(&11u32.to_le_bytes());
        body.push(3); // LONG
        body.extend_from_slice(&0u16.to_le_bytes());
        body.push(0);
        let f = FieldPacket::from_bytes(&body).unwrap();
        assert_eq!(f.name, "id");
        assert_eq!(f.db, "shop");
        assert_eq!(f.type_, 3);
    }
}
