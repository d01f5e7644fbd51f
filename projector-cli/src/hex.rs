//! Intel HEX, the format avrdude reads and writes EEPROM images in.

use std::fmt::Write;

use anyhow::{bail, Context, Result};

/// Data bytes per record when writing. avrdude uses the same.
const RECORD_LEN: usize = 16;

/// A parsed segment of data at a specific address from an Intel HEX file.
#[derive(Debug, Clone)]
pub struct HexSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Parse an Intel HEX string into address-data segments.
///
/// Supports record types:
/// - 00: Data
/// - 01: End of File
/// - 02: Extended Segment Address
pub fn parse_hex(input: &str) -> Result<Vec<HexSegment>> {
    let mut segments: Vec<HexSegment> = Vec::new();
    let mut base_address: u32 = 0;

    for (line_num, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix(':') else {
            bail!("line {}: missing start code ':'", line_num + 1);
        };

        let bytes = decode_hex_bytes(body)
            .with_context(|| format!("line {}: invalid hex data", line_num + 1))?;
        if bytes.len() < 5 {
            bail!("line {}: record too short", line_num + 1);
        }

        let byte_count = usize::from(bytes[0]);
        if bytes.len() != 5 + byte_count {
            bail!(
                "line {}: expected {} data bytes, got {}",
                line_num + 1,
                byte_count,
                bytes.len() - 5
            );
        }
        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        let data = &bytes[4..4 + byte_count];

        if checksum(&bytes) != 0 {
            bail!("line {}: checksum mismatch", line_num + 1);
        }

        match record_type {
            0x00 => {
                let full_address = base_address + u32::from(address);

                if let Some(last) = segments.last_mut() {
                    let last_end = last.address + last.data.len() as u32;
                    if full_address == last_end {
                        last.data.extend_from_slice(data);
                        continue;
                    }
                }

                segments.push(HexSegment {
                    address: full_address,
                    data: data.to_vec(),
                });
            }
            0x01 => break,
            0x02 => {
                if byte_count != 2 {
                    bail!(
                        "line {}: extended segment address must be 2 bytes",
                        line_num + 1
                    );
                }
                base_address = u32::from(u16::from_be_bytes([data[0], data[1]])) << 4;
            }
            other => {
                bail!("line {}: unsupported record type 0x{:02X}", line_num + 1, other);
            }
        }
    }

    Ok(segments)
}

/// Flatten parsed segments into one contiguous image.
/// Returns (base_address, data); gaps read as erased (0xFF).
pub fn flatten_segments(segments: &[HexSegment]) -> Result<(u32, Vec<u8>)> {
    let Some(min_addr) = segments.iter().map(|s| s.address).min() else {
        bail!("no data segments in HEX file");
    };
    let max_addr = segments
        .iter()
        .map(|s| s.address + s.data.len() as u32)
        .max()
        .unwrap_or(min_addr);

    let mut image = vec![0xFFu8; (max_addr - min_addr) as usize];
    for seg in segments {
        let offset = (seg.address - min_addr) as usize;
        image[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
    }

    Ok((min_addr, image))
}

/// Render `data` at `base` as data records plus the end-of-file record.
/// Addresses above 64 KiB are not needed for EEPROM and are rejected.
pub fn write_hex(base: u16, data: &[u8]) -> Result<String> {
    if usize::from(base) + data.len() > 0x1_0000 {
        bail!(
            "{} bytes at 0x{:04X} do not fit 16-bit addressing",
            data.len(),
            base
        );
    }

    let mut out = String::new();
    for (index, chunk) in data.chunks(RECORD_LEN).enumerate() {
        let address = base + (index * RECORD_LEN) as u16;
        let mut record = vec![chunk.len() as u8];
        record.extend_from_slice(&address.to_be_bytes());
        record.push(0x00);
        record.extend_from_slice(chunk);
        record.push(checksum(&record).wrapping_neg());

        out.push(':');
        for byte in &record {
            // Writing into a String cannot fail.
            let _ = write!(out, "{:02X}", byte);
        }
        out.push('\n');
    }
    out.push_str(":00000001FF\n");
    Ok(out)
}

/// Sum of all bytes mod 256. A valid record, checksum included, sums to 0.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn decode_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("odd number of hex characters");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .with_context(|| format!("invalid hex at position {}", i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_hex() {
        let hex = ":10000000000102030405060708090A0B0C0D0E0F78\n\
                   :00000001FF\n";
        let segments = parse_hex(hex).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0);
        assert_eq!(segments[0].data, (0..16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_parse_extended_segment() {
        let hex = ":020000020100FB\n\
                   :10000000112233445566778899AABBCCDDEEFF00F8\n\
                   :00000001FF\n";
        let segments = parse_hex(hex).unwrap();
        assert_eq!(segments[0].address, 0x1000);
    }

    #[test]
    fn test_checksum_error() {
        let hex = ":10000000000102030405060708090A0B0C0D0E0F00\n\
                   :00000001FF\n";
        assert!(parse_hex(hex).is_err());
    }

    #[test]
    fn test_short_record_is_an_error_not_a_panic() {
        assert!(parse_hex(":10000000AA55\n").is_err());
    }

    #[test]
    fn test_flatten_fills_gaps_as_erased() {
        let segments = vec![
            HexSegment {
                address: 0x100,
                data: vec![0xAA, 0xBB],
            },
            HexSegment {
                address: 0x110,
                data: vec![0xCC, 0xDD],
            },
        ];
        let (base, image) = flatten_segments(&segments).unwrap();
        assert_eq!(base, 0x100);
        assert_eq!(image.len(), 0x12);
        assert_eq!(image[2], 0xFF);
        assert_eq!(image[0x11], 0xDD);
        assert!(flatten_segments(&[]).is_err());
    }

    #[test]
    fn test_write_matches_known_record() {
        let data: Vec<u8> = (0..16).collect();
        assert_eq!(
            write_hex(0, &data).unwrap(),
            ":10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n"
        );
    }

    #[test]
    fn test_written_image_parses_back() {
        let data: Vec<u8> = (0..40u8).map(|b| b.wrapping_mul(7)).collect();
        let text = write_hex(0x20, &data).unwrap();
        assert_eq!(text.lines().count(), 4);

        let (base, image) = flatten_segments(&parse_hex(&text).unwrap()).unwrap();
        assert_eq!(base, 0x20);
        assert_eq!(image, data);
    }
}
