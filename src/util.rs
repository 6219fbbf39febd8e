// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Debug helpers.

use std::fmt::Write;

/// Classic 16-bytes-per-line hex dump with an ASCII column.
///
/// ```
/// let dump = fpspin::util::hexdump(b"SLMP");
/// assert!(dump.starts_with("53 4C 4D 50"));
/// assert!(dump.trim_end().ends_with("|  SLMP"));
/// ```
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for line in data.chunks(16) {
        for (i, byte) in line.iter().enumerate() {
            let _ = write!(out, "{byte:02X} ");
            if i == 7 {
                out.push(' ');
            }
        }
        // Pad short lines so the ASCII column lines up.
        for i in line.len()..16 {
            out.push_str("   ");
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |  ");
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_lines() {
        let data: Vec<u8> = (0x40..0x58).collect();
        let dump = hexdump(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].find('|'), lines[1].find('|'));
        assert!(lines[0].ends_with("@ABCDEFGHIJKLMNO"));
        assert!(lines[1].ends_with("PQRSTUVW"));
    }

    #[test]
    fn test_hexdump_non_printable() {
        assert!(hexdump(&[0, 0x7f, b'a']).trim_end().ends_with("..a"));
        assert!(hexdump(&[]).is_empty());
    }
}
