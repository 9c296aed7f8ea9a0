//! 値の書式記述子
//!
//! `TAG[.name]` 形式の短い文字列で、生の値をどう表示するかを指定します。
//!
//! | TAG   | 意味 |
//! |-------|------|
//! | `p`   | ポインタ |
//! | `i`   | 32bit符号付き整数 |
//! | `s`   | NUL終端文字列 |
//! | `u`   | NUL終端ワイド文字列（UTF-16） |
//! | `d<N>`| Nバイトのダンプ（Nなし・0ならデフォルト長） |
//! | `v`   | ポインタ => 値 |
//! | `w`   | ポインタ => ポインタ => 値 |
//! | `r`   | レジスタ（予約） |

use std::convert::Infallible;
use std::str::FromStr;

/// 記述子のタグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Pointer,
    Int32,
    CString,
    WideString,
    /// バイトダンプ（Noneならデフォルト長）
    Blob(Option<usize>),
    Deref,
    DoubleDeref,
    Register,
    Unknown,
}

/// 値の書式記述子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDescriptor {
    tag: ValueTag,
    token: String,
}

impl ValueDescriptor {
    /// 記述子をパースする（失敗しない。不明なタグは [`ValueTag::Unknown`]）
    pub fn parse(token: &str) -> Self {
        let mut chars = token.chars();
        let tag = match chars.next() {
            Some('p') => ValueTag::Pointer,
            Some('i') => ValueTag::Int32,
            Some('s') => ValueTag::CString,
            Some('u') => ValueTag::WideString,
            Some('d') => ValueTag::Blob(parse_length(chars.as_str())),
            Some('v') => ValueTag::Deref,
            Some('w') => ValueTag::DoubleDeref,
            Some('r') => ValueTag::Register,
            _ => ValueTag::Unknown,
        };

        Self {
            tag,
            token: token.to_string(),
        }
    }

    pub fn tag(&self) -> ValueTag {
        self.tag
    }

    /// フィールド名（最初の`.`より後ろ。`.`がなければ記述子全体）
    pub fn field(&self) -> &str {
        match self.token.find('.') {
            Some(pos) => &self.token[pos + 1..],
            None => &self.token,
        }
    }

    /// ダンプ型か（呼び出しサマリーでは後回しにして表示する）
    pub fn is_blob(&self) -> bool {
        matches!(self.tag, ValueTag::Blob(_))
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

/// 先頭の数字列を長さとして読む（0・数字なしはデフォルト長）
///
/// `0x`/`0X`で始まれば16進として読みます。
fn parse_length(rest: &str) -> Option<usize> {
    let (digits, radix) = match rest.get(..2) {
        Some("0x" | "0X") => (&rest[2..], 16),
        _ => (rest, 10),
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    usize::from_str_radix(&digits[..end], radix)
        .ok()
        .filter(|len| *len > 0)
}

impl FromStr for ValueDescriptor {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for ValueDescriptor {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!(ValueDescriptor::parse("p.flag").tag(), ValueTag::Pointer);
        assert_eq!(ValueDescriptor::parse("i.fd").tag(), ValueTag::Int32);
        assert_eq!(ValueDescriptor::parse("s.path").tag(), ValueTag::CString);
        assert_eq!(ValueDescriptor::parse("u.name").tag(), ValueTag::WideString);
        assert_eq!(ValueDescriptor::parse("v.out").tag(), ValueTag::Deref);
        assert_eq!(ValueDescriptor::parse("w.pp").tag(), ValueTag::DoubleDeref);
        assert_eq!(ValueDescriptor::parse("r.x0").tag(), ValueTag::Register);
        assert_eq!(ValueDescriptor::parse("z.foo").tag(), ValueTag::Unknown);
        assert_eq!(ValueDescriptor::parse("").tag(), ValueTag::Unknown);
    }

    #[test]
    fn test_blob_length() {
        assert_eq!(ValueDescriptor::parse("d64.buf").tag(), ValueTag::Blob(Some(64)));
        assert_eq!(ValueDescriptor::parse("d0").tag(), ValueTag::Blob(None));
        assert_eq!(ValueDescriptor::parse("d.buf").tag(), ValueTag::Blob(None));
        assert!(ValueDescriptor::parse("d16").is_blob());
    }

    #[test]
    fn test_blob_length_hex() {
        assert_eq!(ValueDescriptor::parse("d0x40.buf").tag(), ValueTag::Blob(Some(64)));
        assert_eq!(ValueDescriptor::parse("d0XfF").tag(), ValueTag::Blob(Some(255)));
        assert_eq!(ValueDescriptor::parse("d0x.buf").tag(), ValueTag::Blob(None));
        assert_eq!(ValueDescriptor::parse("d0x40.buf").field(), "buf");
    }

    #[test]
    fn test_field_name() {
        assert_eq!(ValueDescriptor::parse("s.name").field(), "name");
        assert_eq!(ValueDescriptor::parse("d32.a.b").field(), "a.b");
        assert_eq!(ValueDescriptor::parse("p").field(), "p");
    }
}
