//! TABLE_MAP and row-image decoding.
//!
//! Row events are only meaningful against the table map that preceded
//! them; every function here takes that map explicitly and reads through a
//! bounds-checked [`PayloadReader`].

use super::event::{
    ColumnDef, ColumnType, ColumnValue, DateTimeValue, DateValue, RowChange, TableMapEvent,
    TimeValue,
};
use super::reader::PayloadReader;
use crate::error::{ClientError, Result};

const DIGITS_PER_WORD: usize = 9;
const WORD_BYTES: usize = 4;
const LEFTOVER_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

pub fn decode_table_map(body: &[u8]) -> Result<TableMapEvent> {
    let mut r = PayloadReader::new(body);
    let table_id = r.u48_le()?;
    let _flags = r.u16_le()?;
    let schema_len = r.u8()? as usize;
    let schema = String::from_utf8_lossy(r.bytes(schema_len)?).into_owned();
    r.skip(1)?;
    let table_len = r.u8()? as usize;
    let table = String::from_utf8_lossy(r.bytes(table_len)?).into_owned();
    r.skip(1)?;

    let column_count = usize::try_from(r.packed_int()?)
        .map_err(|_| ClientError::protocol("table map column count overflow"))?;
    let type_codes = r.bytes(column_count)?;
    let mut types = Vec::with_capacity(column_count);
    for code in type_codes {
        let column_type = ColumnType::from_u8(*code)
            .ok_or_else(|| ClientError::protocol(format!("unsupported column type {}", code)))?;
        types.push(column_type);
    }

    let meta_len = usize::try_from(r.packed_int()?)
        .map_err(|_| ClientError::protocol("table map metadata length overflow"))?;
    let meta_block = r.bytes(meta_len)?;
    let mut meta_reader = PayloadReader::new(meta_block);
    let mut metas = Vec::with_capacity(column_count);
    for column_type in &types {
        metas.push(read_column_meta(&mut meta_reader, *column_type)?);
    }

    let null_bitmap = r.bytes(column_count.div_ceil(8))?;
    // Optional metadata (column names, signedness, ...) follows; not used.

    let columns = types
        .into_iter()
        .zip(metas)
        .enumerate()
        .map(|(i, (column_type, meta))| ColumnDef {
            column_type,
            meta,
            nullable: bit_set(null_bitmap, i),
        })
        .collect();

    Ok(TableMapEvent {
        table_id,
        schema,
        table,
        columns,
    })
}

fn read_column_meta(r: &mut PayloadReader<'_>, column_type: ColumnType) -> Result<u16> {
    use ColumnType::*;
    Ok(match column_type {
        Float | Double | Blob | TinyBlob | MediumBlob | LongBlob | Json | Geometry | Time2
        | DateTime2 | Timestamp2 => r.u8()? as u16,
        Varchar | VarString => r.u16_le()?,
        // Big-endian pairs: (real type, length) / (precision, scale)
        String | Enum | Set | NewDecimal => r.uint_be(2)? as u16,
        // (bits % 8, whole bytes)
        Bit => {
            let bits = r.u8()? as u16;
            let bytes = r.u8()? as u16;
            bytes << 8 | bits
        }
        _ => 0,
    })
}

/// Table id at the start of a rows event body, without consuming it.
pub fn peek_table_id(body: &[u8]) -> Result<u64> {
    PayloadReader::new(body).u48_le()
}

/// Decode the row images of a rows event body against `table`.
///
/// `v2` selects the extra-data header; `has_after_bitmap` is true for
/// update events.
pub fn decode_rows(
    body: &[u8],
    table: &TableMapEvent,
    v2: bool,
    kind: RowImageKind,
) -> Result<Vec<RowChange>> {
    let mut r = PayloadReader::new(body);
    let _table_id = r.u48_le()?;
    let _flags = r.u16_le()?;
    if v2 {
        let extra_len = r.u16_le()? as usize;
        if extra_len < 2 {
            return Err(ClientError::protocol(format!(
                "rows event extra data length {} below 2",
                extra_len
            )));
        }
        r.skip(extra_len - 2)?;
    }

    let column_count = usize::try_from(r.packed_int()?)
        .map_err(|_| ClientError::protocol("rows event column count overflow"))?;
    if column_count != table.columns.len() {
        return Err(ClientError::protocol(format!(
            "rows event for {}.{} has {} columns, table map has {}",
            table.schema,
            table.table,
            column_count,
            table.columns.len()
        )));
    }
    let bitmap_len = column_count.div_ceil(8);
    let before_present = r.bytes(bitmap_len)?;
    let after_present = if kind == RowImageKind::Update {
        r.bytes(bitmap_len)?
    } else {
        before_present
    };

    let mut rows = Vec::new();
    while !r.is_empty() {
        let start = r.position();
        let row = match kind {
            RowImageKind::Write => RowChange {
                before: None,
                after: Some(decode_row(&mut r, table, after_present)?),
            },
            RowImageKind::Delete => RowChange {
                before: Some(decode_row(&mut r, table, before_present)?),
                after: None,
            },
            RowImageKind::Update => {
                let before = decode_row(&mut r, table, before_present)?;
                let after = decode_row(&mut r, table, after_present)?;
                RowChange {
                    before: Some(before),
                    after: Some(after),
                }
            }
        };
        if r.position() == start {
            return Err(ClientError::protocol(format!(
                "empty row image in rows event for {}.{} with {} trailing bytes",
                table.schema,
                table.table,
                r.remaining()
            )));
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowImageKind {
    Write,
    Update,
    Delete,
}

/// One row image. Columns absent from the image come back as `Null`.
fn decode_row(
    r: &mut PayloadReader<'_>,
    table: &TableMapEvent,
    present: &[u8],
) -> Result<Vec<ColumnValue>> {
    let present_count = (0..table.columns.len())
        .filter(|i| bit_set(present, *i))
        .count();
    let null_bitmap = r.bytes(present_count.div_ceil(8))?;

    let mut values = Vec::with_capacity(table.columns.len());
    let mut null_idx = 0;
    for (i, column) in table.columns.iter().enumerate() {
        if !bit_set(present, i) {
            values.push(ColumnValue::Null);
            continue;
        }
        let is_null = bit_set(null_bitmap, null_idx);
        null_idx += 1;
        if is_null {
            values.push(ColumnValue::Null);
        } else {
            values.push(decode_value(r, column.column_type, column.meta)?);
        }
    }
    Ok(values)
}

fn bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|b| b & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

/// Decode one non-NULL value of `column_type`.
pub fn decode_value(r: &mut PayloadReader<'_>, column_type: ColumnType, meta: u16) -> Result<ColumnValue> {
    use ColumnType::*;
    Ok(match column_type {
        Tiny => ColumnValue::Int(r.i8()? as i64),
        Short => ColumnValue::Int(r.i16_le()? as i64),
        Int24 => ColumnValue::Int(r.i24_le()? as i64),
        Long => ColumnValue::Int(r.i32_le()? as i64),
        LongLong => ColumnValue::Int(r.i64_le()?),
        Float => ColumnValue::Float(r.f32_le()?),
        Double => ColumnValue::Double(r.f64_le()?),
        NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(r, precision, scale)?)
        }
        Year => {
            let v = r.u8()? as u16;
            ColumnValue::Year(if v == 0 { 0 } else { v + 1900 })
        }
        Date => {
            let v = r.u24_le()?;
            ColumnValue::Date(DateValue {
                year: (v >> 9) as u16,
                month: ((v >> 5) & 0x0F) as u8,
                day: (v & 0x1F) as u8,
            })
        }
        Time => {
            let v = r.i24_le()?;
            let abs = v.unsigned_abs();
            ColumnValue::Time(TimeValue {
                negative: v < 0,
                hours: abs / 10_000,
                minutes: ((abs / 100) % 100) as u8,
                seconds: (abs % 100) as u8,
                micros: 0,
            })
        }
        Time2 => ColumnValue::Time(decode_time2(r, meta as u8)?),
        DateTime => {
            let v = r.u64_le()?;
            ColumnValue::DateTime(DateTimeValue {
                year: (v / 10_000_000_000) as u16,
                month: ((v / 100_000_000) % 100) as u8,
                day: ((v / 1_000_000) % 100) as u8,
                hour: ((v / 10_000) % 100) as u8,
                minute: ((v / 100) % 100) as u8,
                second: (v % 100) as u8,
                micros: 0,
            })
        }
        DateTime2 => ColumnValue::DateTime(decode_datetime2(r, meta as u8)?),
        Timestamp => ColumnValue::Timestamp {
            seconds: r.u32_le()?,
            micros: 0,
        },
        Timestamp2 => {
            let seconds = r.uint_be(4)? as u32;
            let micros = read_fraction(r, meta as u8)?;
            ColumnValue::Timestamp { seconds, micros }
        }
        Varchar | VarString => {
            let len = if meta < 256 { r.u8()? as usize } else { r.u16_le()? as usize };
            ColumnValue::Bytes(r.bytes(len)?.to_vec())
        }
        String | Enum | Set => decode_string_family(r, meta)?,
        Blob | TinyBlob | MediumBlob | LongBlob | Geometry => {
            ColumnValue::Bytes(read_prefixed(r, meta)?.to_vec())
        }
        Json => ColumnValue::Json(read_prefixed(r, meta)?.to_vec()),
        Bit => {
            let nbits = (meta >> 8) as usize * 8 + (meta & 0xFF) as usize;
            ColumnValue::Bit(r.bytes(nbits.div_ceil(8))?.to_vec())
        }
        Decimal | Null | NewDate => {
            return Err(ClientError::protocol(format!(
                "unsupported column type {:?} in row image",
                column_type
            )))
        }
    })
}

/// CHAR/ENUM/SET share the STRING type code; the real type rides in the
/// metadata's high byte.
fn decode_string_family(r: &mut PayloadReader<'_>, meta: u16) -> Result<ColumnValue> {
    let mut real_type = (meta >> 8) as u8;
    let mut max_len = meta & 0xFF;
    if real_type & 0x30 != 0x30 {
        // CHAR longer than 255: two extra length bits stolen from the type byte
        max_len |= (((real_type & 0x30) ^ 0x30) as u16) << 4;
        real_type |= 0x30;
    }
    match ColumnType::from_u8(real_type) {
        Some(ColumnType::Enum) => {
            let v = r.uint_le((meta & 0xFF) as usize)?;
            Ok(ColumnValue::Enum(v as u16))
        }
        Some(ColumnType::Set) => {
            let v = r.uint_le((meta & 0xFF) as usize)?;
            Ok(ColumnValue::Set(v))
        }
        _ => {
            let len = if max_len < 256 { r.u8()? as usize } else { r.u16_le()? as usize };
            Ok(ColumnValue::Bytes(r.bytes(len)?.to_vec()))
        }
    }
}

fn read_prefixed<'a>(r: &mut PayloadReader<'a>, prefix_len: u16) -> Result<&'a [u8]> {
    if !(1..=4).contains(&prefix_len) {
        return Err(ClientError::protocol(format!(
            "invalid length prefix size {}",
            prefix_len
        )));
    }
    let len = r.uint_le(prefix_len as usize)? as usize;
    r.bytes(len)
}

/// Fractional seconds of a TIME2/DATETIME2/TIMESTAMP2 value, in micros.
fn read_fraction(r: &mut PayloadReader<'_>, fsp: u8) -> Result<u32> {
    let bytes = fraction_bytes(fsp)?;
    if bytes == 0 {
        return Ok(0);
    }
    let v = r.uint_be(bytes)? as u32;
    Ok(v * 10u32.pow(6 - 2 * bytes as u32))
}

fn fraction_bytes(fsp: u8) -> Result<usize> {
    if fsp > 6 {
        return Err(ClientError::protocol(format!("invalid fractional precision {}", fsp)));
    }
    Ok((fsp as usize + 1) / 2)
}

fn decode_datetime2(r: &mut PayloadReader<'_>, fsp: u8) -> Result<DateTimeValue> {
    let packed = r.uint_be(5)? as i64 - 0x80_0000_0000;
    let micros = read_fraction(r, fsp)?;
    let v = packed.unsigned_abs();
    let year_month = (v >> 22) & 0x1_FFFF;
    Ok(DateTimeValue {
        year: (year_month / 13) as u16,
        month: (year_month % 13) as u8,
        day: ((v >> 17) & 0x1F) as u8,
        hour: ((v >> 12) & 0x1F) as u8,
        minute: ((v >> 6) & 0x3F) as u8,
        second: (v & 0x3F) as u8,
        micros,
    })
}

fn decode_time2(r: &mut PayloadReader<'_>, fsp: u8) -> Result<TimeValue> {
    // Packed form: (hms << 24) + micros, stored with an offset so that it
    // sorts as unsigned.
    let packed: i64 = match fraction_bytes(fsp)? {
        0 => (r.uint_be(3)? as i64 - 0x80_0000) << 24,
        1 => {
            let mut int_part = r.uint_be(3)? as i64 - 0x80_0000;
            let mut frac = r.i8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        2 => {
            let mut int_part = r.uint_be(3)? as i64 - 0x80_0000;
            let mut frac = r.uint_be(2)? as u16 as i16 as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x1_0000;
            }
            (int_part << 24) + frac * 100
        }
        _ => r.uint_be(6)? as i64 - 0x8000_0000_0000,
    };
    let negative = packed < 0;
    let abs = packed.unsigned_abs();
    let hms = abs >> 24;
    Ok(TimeValue {
        negative,
        hours: ((hms >> 12) & 0x3FF) as u32,
        minutes: ((hms >> 6) & 0x3F) as u8,
        seconds: (hms & 0x3F) as u8,
        micros: (abs & 0xFF_FFFF) as u32,
    })
}

/// NEWDECIMAL: sign-flipped, big-endian base-10^9 words.
pub fn decode_decimal(r: &mut PayloadReader<'_>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision || precision == 0 {
        return Err(ClientError::protocol(format!(
            "invalid decimal precision/scale {}/{}",
            precision, scale
        )));
    }
    let int_digits = precision - scale;
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;
    let int_leftover_bytes = LEFTOVER_BYTES[int_leftover];
    let frac_leftover_bytes = LEFTOVER_BYTES[frac_leftover];
    let size = int_leftover_bytes + int_words * WORD_BYTES + frac_words * WORD_BYTES + frac_leftover_bytes;

    let mut bytes = r.bytes(size)?.to_vec();
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut d = PayloadReader::new(&bytes);
    let mut int_part = String::new();
    if int_leftover_bytes > 0 {
        int_part.push_str(&d.uint_be(int_leftover_bytes)?.to_string());
    }
    for _ in 0..int_words {
        let word = d.uint_be(WORD_BYTES)?;
        if int_part.is_empty() || int_part == "0" {
            int_part = word.to_string();
        } else {
            int_part.push_str(&format!("{:09}", word));
        }
    }
    let trimmed = int_part.trim_start_matches('0');
    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }
    out.push_str(if trimmed.is_empty() { "0" } else { trimmed });

    if scale > 0 {
        out.push('.');
        for _ in 0..frac_words {
            out.push_str(&format!("{:09}", d.uint_be(WORD_BYTES)?));
        }
        if frac_leftover_bytes > 0 {
            let v = d.uint_be(frac_leftover_bytes)?;
            out.push_str(&format!("{:0width$}", v, width = frac_leftover));
        }
    }
    Ok(out)
}
