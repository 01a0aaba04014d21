//! RDB snapshot loading, treated as an opaque component: we load the
//! key/value/expiry records a real RDB file contains and ignore the rest
//! of the format (aux fields, resize hints, any value type this server
//! doesn't model). The only thing we write back out is the bare 5-byte
//! magic placeholder used when no snapshot file exists yet.
//! Based on https://rdb.fnordig.de/file_format.html.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{bail, Result};

use crate::protocol::resp::FILE_MAGIC;

use super::KeyspaceEntry;

const RDB_EMPTY_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

enum LengthEncoding {
    Len(u32),
    Byte(u8),
    Short(u16),
    Int(u32),
}

fn read_byte(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_crc64(reader: &mut impl Read) -> Result<[u8; 8]> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_length(reader: &mut impl Read) -> Result<LengthEncoding> {
    let head = read_byte(reader)?;
    match head & 0b1100_0000 {
        0b0000_0000 => Ok(LengthEncoding::Len(head as u32)),
        0b0100_0000 => {
            let first6 = head & 0b0011_1111;
            let second = read_byte(reader)?;
            Ok(LengthEncoding::Len(u16::from_le_bytes([first6, second]) as u32))
        }
        0b1000_0000 => Ok(LengthEncoding::Len(read_u32(reader)?)),
        0b1100_0000 => {
            let first6 = head & 0b0011_1111;
            match first6 {
                0 => Ok(LengthEncoding::Byte(read_byte(reader)?)),
                1 => {
                    let mut buf = [0u8; 2];
                    reader.read_exact(&mut buf)?;
                    Ok(LengthEncoding::Short(u16::from_le_bytes(buf)))
                }
                2 => Ok(LengthEncoding::Int(read_u32(reader)?)),
                3 => bail!("compressed (LZF) string encoding is not supported"),
                _ => bail!("unknown length encoding byte: {:#x}", head),
            }
        }
        _ => unreachable!(),
    }
}

fn read_int(reader: &mut impl Read) -> Result<i64> {
    Ok(match read_length(reader)? {
        LengthEncoding::Len(v) => v as i64,
        LengthEncoding::Byte(v) => v as i64,
        LengthEncoding::Short(v) => v as i64,
        LengthEncoding::Int(v) => v as i64,
    })
}

fn read_string(reader: &mut impl Read) -> Result<String> {
    match read_length(reader)? {
        LengthEncoding::Len(len) => {
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            Ok(String::from_utf8(buf)?)
        }
        LengthEncoding::Byte(v) => Ok(v.to_string()),
        LengthEncoding::Short(v) => Ok(v.to_string()),
        LengthEncoding::Int(v) => Ok(v.to_string()),
    }
}

/// Loads the key/value/expiry records out of an RDB file, ignoring
/// everything this server has no use for (aux metadata, db selector,
/// resize hints, non-string value types).
pub fn load(path: &Path) -> Result<HashMap<String, KeyspaceEntry>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 5];
    reader.read_exact(&mut magic)?;
    if &magic != b"REDIS" {
        bail!("not an RDB file: bad magic header");
    }
    // A real RDB carries a 4-digit version right after the magic; the
    // placeholder file `load_or_create` writes when no snapshot exists yet
    // is just the bare 5-byte magic, so the version read is best-effort.
    let mut version = [0u8; 4];
    let _ = reader.read_exact(&mut version);

    let mut entries = HashMap::new();
    let mut pending_expiry_ms: Option<u64> = None;

    loop {
        let op = match read_byte(&mut reader) {
            Ok(b) => b,
            Err(_) => break,
        };
        match op {
            0xFA => {
                read_string(&mut reader)?;
                read_string(&mut reader)?;
            }
            0xFE => {
                read_length(&mut reader)?;
            }
            0xFB => {
                read_int(&mut reader)?;
                read_int(&mut reader)?;
            }
            0xFD => {
                pending_expiry_ms = Some((read_u32(&mut reader)? as u64) * 1000);
            }
            0xFC => {
                pending_expiry_ms = Some(read_u64(&mut reader)?);
            }
            0xFF => {
                read_crc64(&mut reader)?;
                break;
            }
            0..=14 => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                entries.insert(key, KeyspaceEntry::string(value, pending_expiry_ms.take()));
            }
            other => bail!("unsupported rdb value-type opcode: {:#x}", other),
        }
    }
    Ok(entries)
}

/// The fixed empty-database payload sent verbatim after `FULLRESYNC` on a
/// new replica's first full resync.
pub fn empty_payload() -> Vec<u8> {
    hex_to_bytes(RDB_EMPTY_HEX)
}

/// Loads `<dir>/<dbfilename>` if present, else creates it containing just
/// the 5-byte magic `REDIS` and returns an empty keyspace. This is distinct
/// from `empty_payload()`: that's the FULLRESYNC wire payload, this is the
/// on-disk placeholder for a snapshot that was never written.
pub fn load_or_create(dir: &Path, dbfilename: &str) -> Result<HashMap<String, KeyspaceEntry>> {
    let path = dir.join(dbfilename);
    if path.exists() {
        return load(&path);
    }
    let mut file = File::create(&path)?;
    file.write_all(FILE_MAGIC)?;
    Ok(HashMap::new())
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    debug_assert_eq!(hex.len() % 2, 0);
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let byte_str = std::str::from_utf8(&bytes[i..i + 2]).unwrap();
        out.push(u8::from_str_radix(byte_str, 16).unwrap());
        i += 2;
    }
    out
}
