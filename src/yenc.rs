//! yEnc encoding for article payloads
//!
//! Maps every byte to `byte + 42 mod 256`, escapes the critical set and
//! wraps output to fixed-length CRLF-terminated lines. Decoding lives with
//! the downloaders; a poster only ever encodes.

/// Standard yEnc line width used by virtually every indexer and reader.
pub const DEFAULT_LINE_LENGTH: usize = 128;

/// NUL, CR, LF and `=` are critical everywhere; TAB/SPACE only at the
/// first or last column; `.` only at the first column.
fn needs_escape(encoded: u8, line_pos: usize, line_length: usize) -> bool {
    match encoded {
        0x00 | b'\r' | b'\n' | b'=' => true,
        b' ' | b'\t' => line_pos == 0 || line_pos == line_length - 1,
        b'.' => line_pos == 0,
        _ => false,
    }
}

/// Encode `input` into `out` as CRLF-terminated lines of at most
/// `line_length` columns.
///
/// An escape pair (`=` + shifted byte) costs two columns and is never
/// split across a line boundary: when only one column remains the line is
/// wrapped first and the escape decision is re-evaluated at column zero,
/// since escaping is position-dependent.
pub fn encode_into(input: &[u8], line_length: usize, out: &mut Vec<u8>) {
    debug_assert!(line_length >= 2);

    let mut line_pos = 0;
    for &byte in input {
        let encoded = byte.wrapping_add(42);
        let mut escape = needs_escape(encoded, line_pos, line_length);

        if escape && line_length - line_pos < 2 {
            out.extend_from_slice(b"\r\n");
            line_pos = 0;
            escape = needs_escape(encoded, 0, line_length);
        }

        if escape {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            line_pos += 2;
        } else {
            out.push(encoded);
            line_pos += 1;
        }

        if line_pos >= line_length {
            out.extend_from_slice(b"\r\n");
            line_pos = 0;
        }
    }

    if line_pos > 0 {
        out.extend_from_slice(b"\r\n");
    }
}

/// Convenience wrapper allocating the output buffer.
pub fn encode(input: &[u8], line_length: usize) -> Vec<u8> {
    // Worst case doubles every byte; typical payloads expand ~2%.
    let mut out = Vec::with_capacity(input.len() + input.len() / 32 + 64);
    encode_into(input, line_length, &mut out);
    out
}
