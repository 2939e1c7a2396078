//! Row-image decoding for WRITE/UPDATE/DELETE events.
//!
//! A rows event carries the table id, a present-columns bitmap (two for
//! UPDATE) and a run of row images. Each image starts with a null bitmap
//! sized to the number of *present* columns, followed by the values of
//! the present, non-null columns in physical order.

use bit_set::BitSet;

use crate::capture::TableCapture;
use crate::error::{StreamError, StreamResult};
use crate::log::event::{column_type, TableMapEvent};
use crate::log::log_buffer::LogBuffer;
use crate::record::{blob_preview, ColumnValue, RowImage, RowValues};
use crate::utils::time::format_unix_seconds;

/// Parsed rows-event preamble, up to the first row image.
#[derive(Debug)]
pub struct RowsEventBody {
    pub table_id: u64,
    pub column_count: usize,
    pub present: BitSet,
    /// Second bitmap carried only by UPDATE events.
    pub present_after: BitSet,
}

pub fn parse_rows_header(
    buf: &mut LogBuffer,
    v2: bool,
    is_update: bool,
) -> StreamResult<RowsEventBody> {
    let table_id = buf.get_uint48()?;
    let _flags = buf.get_uint16()?;
    if v2 {
        let extra_len = buf.get_uint16()? as usize;
        if extra_len < 2 {
            return Err(StreamError::Protocol(format!(
                "bad rows extra-data length: {}",
                extra_len
            )));
        }
        buf.forward(extra_len - 2)?;
    }
    parse_bitmap_section(buf, table_id, is_update)
}

/// The part after the post-header: column count and present bitmap(s).
/// For MariaDB compressed events this section sits inside the inflated
/// payload, so it parses from whichever buffer holds it.
pub fn parse_bitmap_section(
    buf: &mut LogBuffer,
    table_id: u64,
    is_update: bool,
) -> StreamResult<RowsEventBody> {
    let column_count = buf.get_packed_long()?;
    if column_count < 0 {
        return Err(StreamError::Protocol("negative column count".to_string()));
    }
    let column_count = column_count as usize;
    let mut present = BitSet::new();
    buf.fill_bitmap(&mut present, column_count)?;
    let mut present_after = BitSet::new();
    if is_update {
        buf.fill_bitmap(&mut present_after, column_count)?;
    }
    Ok(RowsEventBody {
        table_id,
        column_count,
        present,
        present_after,
    })
}

/// Decode every row image left in the buffer, projecting each one down
/// to the captured columns. For UPDATE the images come in before/after
/// pairs.
pub fn decode_row_images(
    buf: &mut LogBuffer,
    map: &TableMapEvent,
    capture: &TableCapture,
    body: &RowsEventBody,
    is_update: bool,
) -> StreamResult<Vec<RowImage>> {
    let mut rows = Vec::new();
    while buf.has_remaining() {
        let before = decode_one_image(buf, map, capture, &body.present)?;
        if is_update {
            if !buf.has_remaining() {
                return Err(StreamError::Protocol(
                    "update row image without after-image".to_string(),
                ));
            }
            let after = decode_one_image(buf, map, capture, &body.present_after)?;
            rows.push(RowImage::BeforeAfter { before, after });
        } else {
            rows.push(RowImage::Plain(before));
        }
    }
    Ok(rows)
}

fn decode_one_image(
    buf: &mut LogBuffer,
    map: &TableMapEvent,
    capture: &TableCapture,
    present: &BitSet,
) -> StreamResult<RowValues> {
    let present_count = (0..map.column_count).filter(|i| present.contains(*i)).count();
    let mut nulls = BitSet::new();
    buf.fill_bitmap(&mut nulls, present_count)?;

    let mut values: Vec<Option<ColumnValue>> = vec![None; map.column_count];
    let mut null_index = 0usize;
    for c in 0..map.column_count {
        if !present.contains(c) {
            continue;
        }
        let is_null = nulls.contains(null_index);
        null_index += 1;
        if is_null {
            values[c] = Some(ColumnValue::Null);
            continue;
        }
        let value = decode_value(buf, map.real_types[c], map.metadata[c], map.enum_literals[c].as_ref())?
            .ok_or_else(|| {
                StreamError::Decode(format!(
                    "unsupported column type {} in {}.{} column {}; skipping event",
                    map.real_types[c], map.schema, map.table, c
                ))
            })?;
        values[c] = Some(value);
    }

    let mut row: RowValues = Vec::new();
    for (index, name) in capture.projected() {
        let value = values
            .get(index)
            .and_then(|v| v.clone())
            .unwrap_or(ColumnValue::Null);
        row.push((name.to_string(), value));
    }
    Ok(row)
}

/// Decode a single non-null value. Returns `Ok(None)` for a type this
/// decoder cannot align past; the caller abandons the event.
fn decode_value(
    buf: &mut LogBuffer,
    real_type: u8,
    meta: u16,
    literals: Option<&Vec<String>>,
) -> StreamResult<Option<ColumnValue>> {
    use column_type::*;
    let value = match real_type {
        TINY => ColumnValue::Number(buf.get_int8()?.to_string()),
        SHORT => ColumnValue::Number(buf.get_int16()?.to_string()),
        INT24 => ColumnValue::Number(buf.get_int24()?.to_string()),
        LONG => ColumnValue::Number(buf.get_int32()?.to_string()),
        LONGLONG => ColumnValue::Number(buf.get_int64()?.to_string()),
        FLOAT => ColumnValue::Number(buf.get_float32()?.to_string()),
        DOUBLE => ColumnValue::Number(buf.get_double64()?.to_string()),
        YEAR => ColumnValue::Number(buf.get_int16()?.to_string()),
        TIMESTAMP => {
            let seconds = buf.get_uint32()?;
            ColumnValue::Text(format_unix_seconds(seconds as u64))
        }
        TIMESTAMP2 => {
            let seconds = buf.get_uint32_big_endian()?;
            let mut text = format_unix_seconds(seconds as u64);
            push_fraction(buf, meta as usize, &mut text)?;
            ColumnValue::Text(text)
        }
        DATETIME2 => {
            let packed = buf.get_uint40_big_endian()? as i64 - 0x80000_00000;
            let ymd = packed >> 17;
            let ym = ymd >> 5;
            let day = ymd & 0x1f;
            let month = ym % 13;
            let year = ym / 13;
            let hms = packed & 0x1ffff;
            let hour = hms >> 12;
            let minute = (hms >> 6) & 0x3f;
            let second = hms & 0x3f;
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            push_fraction(buf, meta as usize, &mut text)?;
            ColumnValue::Text(text)
        }
        VARCHAR | VAR_STRING => {
            let len = if meta < 256 {
                buf.get_uint8()? as usize
            } else {
                buf.get_uint16()? as usize
            };
            ColumnValue::Text(buf.get_fix_string(len)?)
        }
        STRING => {
            // Plain CHAR/BINARY: a one-byte length prefix, the declared
            // maximum living in the low meta byte.
            let len = buf.get_uint8()? as usize;
            ColumnValue::Text(buf.get_fix_string(len)?)
        }
        TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | BLOB => {
            let width = meta as usize;
            if width == 0 || width > 4 {
                return Err(StreamError::Protocol(format!(
                    "bad blob length width: {}",
                    width
                )));
            }
            let mut len = 0usize;
            for i in 0..width {
                len |= (buf.get_uint8()? as usize) << (8 * i);
            }
            let bytes = buf.get_data(len)?;
            ColumnValue::Text(blob_preview(&bytes))
        }
        ENUM => {
            let width = (meta & 0xff) as usize;
            let index = match width {
                1 => buf.get_uint8()? as usize,
                2 => buf.get_uint16()? as usize,
                _ => {
                    return Err(StreamError::Protocol(format!(
                        "bad enum packed width: {}",
                        width
                    )))
                }
            };
            // 1-based index into the literal table; fall back to the raw
            // integer when literals were never fetched.
            match literals.and_then(|lits| lits.get(index.wrapping_sub(1))) {
                Some(lit) => ColumnValue::Text(lit.clone()),
                None => ColumnValue::Number(index.to_string()),
            }
        }
        SET => {
            let width = (meta & 0xff) as usize;
            if width == 0 || width > 8 {
                return Err(StreamError::Protocol(format!(
                    "bad set packed width: {}",
                    width
                )));
            }
            let mut mask = 0u64;
            for i in 0..width {
                mask |= (buf.get_uint8()? as u64) << (8 * i);
            }
            ColumnValue::Number(mask.to_string())
        }
        NEWDECIMAL => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xff) as usize;
            ColumnValue::Text(buf.get_decimal(precision, scale)?.to_string())
        }
        // Fixed-width types outside the enumerated set: consume their
        // bytes so later columns stay aligned, emit null.
        DATE | NEWDATE | TIME => {
            buf.forward(3)?;
            ColumnValue::Null
        }
        TIME2 => {
            buf.forward(3 + (meta as usize + 1) / 2)?;
            ColumnValue::Null
        }
        DATETIME => {
            buf.forward(8)?;
            ColumnValue::Null
        }
        BIT => {
            let bits = ((meta >> 8) * 8 + (meta & 0xff)) as usize;
            buf.forward((bits + 7) / 8)?;
            ColumnValue::Null
        }
        NULL => ColumnValue::Null,
        JSON | GEOMETRY => {
            let width = (meta as usize).clamp(1, 4);
            let mut len = 0usize;
            for i in 0..width {
                len |= (buf.get_uint8()? as usize) << (8 * i);
            }
            buf.forward(len)?;
            ColumnValue::Null
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn push_fraction(buf: &mut LogBuffer, digits: usize, text: &mut String) -> StreamResult<()> {
    if digits == 0 {
        return Ok(());
    }
    if digits > 6 {
        return Err(StreamError::Protocol(format!(
            "bad fractional precision: {}",
            digits
        )));
    }
    let frac = buf.get_uint_big_endian((digits + 1) / 2)?;
    text.push('.');
    text.push_str(&format!("{:0width$}", frac, width = digits));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ColumnCapture, TableCapture};
    use crate::log::event::column_type;

    fn map_of(types: Vec<u8>, metadata: Vec<u16>) -> TableMapEvent {
        let n = types.len();
        TableMapEvent {
            table_id: 7,
            schema: "shop".into(),
            table: "orders".into(),
            column_count: n,
            real_types: types.clone(),
            types,
            metadata,
            column_names: None,
            enum_literals: vec![None; n],
            active: true,
        }
    }

    fn capture_of(cols: &[(&str, usize)]) -> TableCapture {
        TableCapture {
            name: "orders".into(),
            capture_all_columns: false,
            columns: cols
                .iter()
                .map(|(n, i)| ColumnCapture {
                    name: n.to_string(),
                    index: Some(*i),
                })
                .collect(),
            primary_keys: vec!["id".into()],
        }
    }

    #[test]
    fn test_insert_row_decode() {
        // (INT, VARCHAR(64), DECIMAL(10,2)) = (42, "ACME", 19.95)
        let map = map_of(
            vec![column_type::LONG, column_type::VARCHAR, column_type::NEWDECIMAL],
            vec![0, 64, (10 << 8) | 2],
        );
        let capture = capture_of(&[("id", 0), ("total", 2)]);

        let mut image = Vec::new();
        image.push(0b0000_0000); // null bitmap: nothing null
        image.extend_from_slice(&42i32.to_le_bytes());
        image.push(4);
        image.extend_from_slice(b"ACME");
        // DECIMAL(10,2) 19.95: intg=8 -> 4 bytes, frac 2 -> 1 byte
        let mut dec = Vec::new();
        dec.extend_from_slice(&19u32.to_be_bytes());
        dec.push(95);
        dec[0] |= 0x80;
        image.extend_from_slice(&dec);

        let mut present = BitSet::new();
        for i in 0..3 {
            present.insert(i);
        }
        let body = RowsEventBody {
            table_id: 7,
            column_count: 3,
            present,
            present_after: BitSet::new(),
        };
        let mut buf = LogBuffer::from(image);
        let rows = decode_row_images(&mut buf, &map, &capture, &body, false).unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            RowImage::Plain(values) => {
                assert_eq!(values[0], ("id".to_string(), ColumnValue::Number("42".into())));
                assert_eq!(
                    values[1],
                    ("total".to_string(), ColumnValue::Text("19.95".into()))
                );
            }
            _ => panic!("expected plain image"),
        }
    }

    #[test]
    fn test_null_column() {
        let map = map_of(vec![column_type::LONG, column_type::VARCHAR], vec![0, 64]);
        let capture = capture_of(&[("id", 0), ("name", 1)]);
        let mut present = BitSet::new();
        present.insert(0);
        present.insert(1);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 2,
            present,
            present_after: BitSet::new(),
        };
        // second column null
        let mut image = vec![0b0000_0010];
        image.extend_from_slice(&7i32.to_le_bytes());
        let mut buf = LogBuffer::from(image);
        let rows = decode_row_images(&mut buf, &map, &capture, &body, false).unwrap();
        match &rows[0] {
            RowImage::Plain(values) => {
                assert_eq!(values[1], ("name".to_string(), ColumnValue::Null));
            }
            _ => panic!("expected plain image"),
        }
    }

    #[test]
    fn test_update_before_after_pairing() {
        let map = map_of(vec![column_type::LONG], vec![0]);
        let capture = capture_of(&[("id", 0)]);
        let mut present = BitSet::new();
        present.insert(0);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 1,
            present: present.clone(),
            present_after: present,
        };
        let mut image = Vec::new();
        image.push(0); // before null bitmap
        image.extend_from_slice(&1i32.to_le_bytes());
        image.push(0); // after null bitmap
        image.extend_from_slice(&2i32.to_le_bytes());
        let mut buf = LogBuffer::from(image);
        let rows = decode_row_images(&mut buf, &map, &capture, &body, true).unwrap();
        match &rows[0] {
            RowImage::BeforeAfter { before, after } => {
                assert_eq!(before[0].1, ColumnValue::Number("1".into()));
                assert_eq!(after[0].1, ColumnValue::Number("2".into()));
            }
            _ => panic!("expected before/after image"),
        }
    }

    #[test]
    fn test_enum_literal_resolution() {
        let mut map = map_of(vec![column_type::ENUM], vec![(column_type::ENUM as u16) << 8 | 1]);
        map.enum_literals[0] = Some(vec!["open".into(), "paid".into(), "cancelled".into()]);
        let capture = capture_of(&[("status", 0)]);
        let mut present = BitSet::new();
        present.insert(0);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 1,
            present,
            present_after: BitSet::new(),
        };
        let mut buf = LogBuffer::from(vec![0, 2]); // null bitmap + index 2
        let rows = decode_row_images(&mut buf, &map, &capture, &body, false).unwrap();
        match &rows[0] {
            RowImage::Plain(values) => {
                assert_eq!(values[0].1, ColumnValue::Text("paid".into()));
            }
            _ => panic!("expected plain image"),
        }
    }

    #[test]
    fn test_enum_without_literals_falls_back_to_index() {
        let map = map_of(vec![column_type::ENUM], vec![(column_type::ENUM as u16) << 8 | 1]);
        let capture = capture_of(&[("status", 0)]);
        let mut present = BitSet::new();
        present.insert(0);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 1,
            present,
            present_after: BitSet::new(),
        };
        let mut buf = LogBuffer::from(vec![0, 2]);
        let rows = decode_row_images(&mut buf, &map, &capture, &body, false).unwrap();
        match &rows[0] {
            RowImage::Plain(values) => {
                assert_eq!(values[0].1, ColumnValue::Number("2".into()));
            }
            _ => panic!("expected plain image"),
        }
    }

    #[test]
    fn test_unknown_type_aborts_event() {
        let map = map_of(vec![200], vec![0]);
        let capture = capture_of(&[("x", 0)]);
        let mut present = BitSet::new();
        present.insert(0);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 1,
            present,
            present_after: BitSet::new(),
        };
        let mut buf = LogBuffer::from(vec![0, 1, 2, 3]);
        assert!(decode_row_images(&mut buf, &map, &capture, &body, false).is_err());
    }

    #[test]
    fn test_datetime2_decode() {
        // 2024-03-05 17:30:00
        let year = 2024i64;
        let month = 3i64;
        let day = 5i64;
        let ym = year * 13 + month;
        let ymd = (ym << 5) | day;
        let hms = (17i64 << 12) | (30 << 6);
        let packed = ((ymd << 17) | hms) + 0x80000_00000;
        let bytes = packed.to_be_bytes();
        let map = map_of(vec![column_type::DATETIME2], vec![0]);
        let capture = capture_of(&[("ts", 0)]);
        let mut present = BitSet::new();
        present.insert(0);
        let body = RowsEventBody {
            table_id: 7,
            column_count: 1,
            present,
            present_after: BitSet::new(),
        };
        let mut image = vec![0u8];
        image.extend_from_slice(&bytes[3..8]);
        let mut buf = LogBuffer::from(image);
        let rows = decode_row_images(&mut buf, &map, &capture, &body, false).unwrap();
        match &rows[0] {
            RowImage::Plain(values) => {
                assert_eq!(values[0].1, ColumnValue::Text("2024-03-05 17:30:00".into()));
            }
            _ => panic!("expected plain image"),
        }
    }

    #[test]
    fn test_rows_header_v2_extra_data() {
        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_le_bytes()[..6]);
        body.extend_from_slice(&[0, 0]); // flags
        body.extend_from_slice(&2u16.to_le_bytes()); // extra len (nothing after)
        body.push(2); // column count
        body.push(0b11); // present bitmap
        let mut buf = LogBuffer::from(body);
        let parsed = parse_rows_header(&mut buf, true, false).unwrap();
        assert_eq!(parsed.table_id, 7);
        assert_eq!(parsed.column_count, 2);
        assert!(parsed.present.contains(0) && parsed.present.contains(1));
    }
}
