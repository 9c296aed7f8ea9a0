//! 16進ダンプ表示

/// 1行あたりのバイト数
const BYTES_PER_LINE: usize = 16;

/// メモリ内容を16進ダンプ形式にする
///
/// ```
/// use kumo_dwarf::hexdump::hexdump;
///
/// let dump = hexdump(0x1000, b"Hi");
/// assert!(dump.contains("48 69"));
/// ```
pub fn hexdump(base: u64, bytes: &[u8]) -> String {
    let end = base.saturating_add(bytes.len() as u64);
    let addr_width = format!("{:x}", end).len().max(8);

    let mut out = String::new();
    out.push_str(&" ".repeat(addr_width + 2));
    for i in 0..BYTES_PER_LINE {
        out.push_str(&format!("{:2X} ", i));
    }
    out.push(' ');
    for i in 0..BYTES_PER_LINE {
        out.push_str(&format!("{:X}", i));
    }

    for (row, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        let addr = base + (row * BYTES_PER_LINE) as u64;
        out.push('\n');
        out.push_str(&format!("{:0width$x}  ", addr, width = addr_width));

        for b in chunk {
            out.push_str(&format!("{:02x} ", b));
        }
        for _ in chunk.len()..BYTES_PER_LINE {
            out.push_str("   ");
        }
        out.push(' ');

        for &b in chunk {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row() {
        let dump = hexdump(0x1000, b"Hello\0");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].trim_start().starts_with("0  1  2"));
        assert!(lines[1].starts_with("00001000  48 65 6c 6c 6f 00 "));
        assert!(lines[1].ends_with("Hello."));
    }

    #[test]
    fn test_multiple_rows() {
        let data: Vec<u8> = (0u8..40).collect();
        let dump = hexdump(0x2000, &data);
        assert_eq!(dump.lines().count(), 4);
        assert!(dump.contains("00002010  10 11"));
        assert!(dump.contains("00002020  20 21"));
    }

    #[test]
    fn test_empty() {
        assert_eq!(hexdump(0, &[]).lines().count(), 1);
    }
}
