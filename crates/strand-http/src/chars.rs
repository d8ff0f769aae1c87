//! Byte classification for the HTTP grammar.
//!
//! One 256-entry table, consulted per byte while scanning; category checks
//! never branch on ranges at parse time.

pub const VCHAR: u8 = 1 << 0;
pub const TOKEN: u8 = 1 << 1;
pub const DIGIT: u8 = 1 << 2;
pub const HEXDIGIT: u8 = 1 << 3;

static CATEGORIES: [u8; 256] = build_categories();

const fn build_categories() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut c = 0x21usize;
    while c <= 0x7e {
        table[c] |= VCHAR;
        c += 1;
    }
    let mut c = b'0' as usize;
    while c <= b'9' as usize {
        table[c] |= TOKEN | DIGIT | HEXDIGIT;
        c += 1;
    }
    let mut c = b'a' as usize;
    while c <= b'z' as usize {
        table[c] |= TOKEN;
        c += 1;
    }
    let mut c = b'A' as usize;
    while c <= b'Z' as usize {
        table[c] |= TOKEN;
        c += 1;
    }
    let mut c = b'a' as usize;
    while c <= b'f' as usize {
        table[c] |= HEXDIGIT;
        c += 1;
    }
    let mut c = b'A' as usize;
    while c <= b'F' as usize {
        table[c] |= HEXDIGIT;
        c += 1;
    }
    // tchar specials per RFC 9110.
    let specials = b"!#$%&'*+-.^_`|~";
    let mut i = 0;
    while i < specials.len() {
        table[specials[i] as usize] |= TOKEN;
        i += 1;
    }
    table
}

#[inline]
pub fn category(byte: u8) -> u8 {
    CATEGORIES[byte as usize]
}

#[inline]
pub fn is(byte: u8, categories: u8) -> bool {
    CATEGORIES[byte as usize] & categories != 0
}

/// Hex digit value, or 0xFF for anything else.
static HEXDECODE: [u8; 256] = build_hexdecode();

const fn build_hexdecode() -> [u8; 256] {
    let mut table = [0xFFu8; 256];
    let mut c = 0usize;
    while c < 10 {
        table[b'0' as usize + c] = c as u8;
        c += 1;
    }
    let mut c = 0usize;
    while c < 6 {
        table[b'a' as usize + c] = 10 + c as u8;
        table[b'A' as usize + c] = 10 + c as u8;
        c += 1;
    }
    table
}

#[inline]
pub fn hex_value(byte: u8) -> Option<u8> {
    match HEXDECODE[byte as usize] {
        0xFF => None,
        v => Some(v),
    }
}

/// True when every byte of `input` matches `categories` or appears in
/// `extra`.
pub fn validate(input: &[u8], categories: u8, extra: &[u8]) -> bool {
    input
        .iter()
        .all(|&b| is(b, categories) || extra.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_chars() {
        for b in b"abcXYZ019!#$%&'*+-.^_`|~" {
            assert!(is(*b, TOKEN), "expected token: {}", *b as char);
        }
        for b in b" \t:;,/()<>@\"\\[]{}=?" {
            assert!(!is(*b, TOKEN), "unexpected token: {}", *b as char);
        }
    }

    #[test]
    fn test_vchar_bounds() {
        assert!(!is(0x20, VCHAR));
        assert!(is(0x21, VCHAR));
        assert!(is(0x7e, VCHAR));
        assert!(!is(0x7f, VCHAR));
        assert!(!is(0x80, VCHAR));
    }

    #[test]
    fn test_hex_value() {
        assert_eq!(hex_value(b'0'), Some(0));
        assert_eq!(hex_value(b'9'), Some(9));
        assert_eq!(hex_value(b'a'), Some(10));
        assert_eq!(hex_value(b'F'), Some(15));
        assert_eq!(hex_value(b'g'), None);
        assert_eq!(hex_value(b' '), None);
    }

    #[test]
    fn test_validate_with_extra() {
        assert!(validate(b"text/plain; q=0.9", VCHAR, b" \t"));
        assert!(!validate(b"bad\x01value", VCHAR, b" \t"));
    }
}
