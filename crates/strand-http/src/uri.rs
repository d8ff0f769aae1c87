//! URI parsing, validation and normalization (RFC 3986 subset).
//!
//! Parsing produces a [`UriRef`] of subslices into the input; validation is
//! strict (a bad percent-escape anywhere is a hard error, which the
//! connection layer turns into a 400). Normalization percent-decodes
//! unreserved characters, lowercases the hex of remaining escapes and
//! optionally lowercases the component itself (scheme, host).

use strand_core::{Arena, ArenaError, AStr};

const GEN_DELIM: u8 = 1 << 0;
const SUB_DELIM: u8 = 1 << 1;
const UNRESERVED: u8 = 1 << 2;
const SCHEME_BEGIN: u8 = 1 << 3;
const SCHEME_CONTINUE: u8 = 1 << 4;
const HEXDIGIT: u8 = 1 << 5;
const DIGIT: u8 = 1 << 6;
const PCT_ENCODED: u8 = 1 << 7;

static CATEGORIES: [u8; 256] = build_categories();

const fn build_categories() -> [u8; 256] {
    let mut t = [0u8; 256];

    let gen_delims = b":/?#[]@";
    let mut i = 0;
    while i < gen_delims.len() {
        t[gen_delims[i] as usize] |= GEN_DELIM;
        i += 1;
    }

    let sub_delims = b"!$&'()*+,;=";
    let mut i = 0;
    while i < sub_delims.len() {
        t[sub_delims[i] as usize] |= SUB_DELIM;
        i += 1;
    }

    t[b'+' as usize] |= SCHEME_CONTINUE;
    t[b'-' as usize] |= UNRESERVED | SCHEME_CONTINUE;
    t[b'.' as usize] |= UNRESERVED | SCHEME_CONTINUE;
    t[b'_' as usize] |= UNRESERVED;
    t[b'~' as usize] |= UNRESERVED;

    let mut c = b'0' as usize;
    while c <= b'9' as usize {
        t[c] |= UNRESERVED | SCHEME_CONTINUE | HEXDIGIT | DIGIT;
        c += 1;
    }
    let mut c = b'a' as usize;
    while c <= b'z' as usize {
        t[c] |= UNRESERVED | SCHEME_BEGIN | SCHEME_CONTINUE;
        c += 1;
    }
    let mut c = b'A' as usize;
    while c <= b'Z' as usize {
        t[c] |= UNRESERVED | SCHEME_BEGIN | SCHEME_CONTINUE;
        c += 1;
    }
    let mut c = 0usize;
    while c < 6 {
        t[b'a' as usize + c] |= HEXDIGIT;
        t[b'A' as usize + c] |= HEXDIGIT;
        c += 1;
    }
    t
}

#[inline]
fn cat(byte: u8) -> u8 {
    CATEGORIES[byte as usize]
}

pub const URI_SCHEME: u8 = 1 << 0;
pub const URI_AUTHORITY: u8 = 1 << 1;
pub const URI_QUERY: u8 = 1 << 2;
pub const URI_FRAGMENT: u8 = 1 << 3;

/// Parsed URI borrowing its components from the input bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UriRef<'a> {
    pub scheme: &'a [u8],
    pub authority: &'a [u8],
    pub userinfo: &'a [u8],
    pub host: &'a [u8],
    pub port: &'a [u8],
    pub path: &'a [u8],
    pub query: &'a [u8],
    pub fragment: &'a [u8],
    pub flags: u8,
}

impl<'a> UriRef<'a> {
    /// Authority-form target (CONNECT): the whole input is the authority.
    pub fn from_authority(input: &'a [u8]) -> UriRef<'a> {
        let uri = UriRef {
            authority: input,
            flags: URI_AUTHORITY,
            ..UriRef::default()
        };
        parse_authority(uri)
    }

    /// Asterisk-form target (OPTIONS *).
    pub fn from_path(input: &'a [u8]) -> UriRef<'a> {
        UriRef {
            path: input,
            ..UriRef::default()
        }
    }
}

/// Normalized URI with components interned in the request arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uri {
    pub scheme: AStr,
    pub authority: AStr,
    pub userinfo: AStr,
    pub host: AStr,
    pub port: AStr,
    pub path: AStr,
    pub query: AStr,
    pub fragment: AStr,
    pub flags: u8,
}

/// Split `authority` into userinfo, host and port in place.
pub fn parse_authority(mut uri: UriRef<'_>) -> UriRef<'_> {
    uri.host = uri.authority;

    if let Some(at) = uri.host.iter().position(|&b| b == b'@') {
        uri.userinfo = &uri.authority[..at];
        uri.host = &uri.host[at + 1..];
    }

    // Scan backwards so an IPv6 literal's colons are skipped via ']'.
    for i in (1..=uri.host.len()).rev() {
        match uri.host[i - 1] {
            b']' => break,
            b':' => {
                uri.port = &uri.host[i..];
                uri.host = &uri.host[..i - 1];
                break;
            }
            _ => {}
        }
    }

    uri
}

/// Parse `scheme://authority/path?query#fragment`, any part optional.
pub fn parse(input: &[u8]) -> UriRef<'_> {
    let mut uri = UriRef::default();
    let mut rest = input;

    for (i, &b) in rest.iter().enumerate() {
        if b == b'/' || b == b'?' || b == b'#' {
            break;
        }
        if b == b':' {
            uri.scheme = &rest[..i];
            uri.flags |= URI_SCHEME;
            rest = &rest[i + 1..];
            break;
        }
    }

    if rest.len() > 1 && rest[0] == b'/' && rest[1] == b'/' {
        rest = &rest[2..];
        let end = rest
            .iter()
            .position(|&b| b == b'/' || b == b'?' || b == b'#')
            .unwrap_or(rest.len());
        uri.authority = &rest[..end];
        uri.flags |= URI_AUTHORITY;
        rest = &rest[end..];
    }

    if !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == b'?' || b == b'#')
            .unwrap_or(rest.len());
        uri.path = &rest[..end];
        rest = &rest[end..];
    }

    if !rest.is_empty() && rest[0] == b'?' {
        rest = &rest[1..];
        let end = rest.iter().position(|&b| b == b'#').unwrap_or(rest.len());
        uri.query = &rest[..end];
        uri.flags |= URI_QUERY;
        rest = &rest[end..];
    }

    if !rest.is_empty() {
        uri.fragment = &rest[1..];
        uri.flags |= URI_FRAGMENT;
    }

    parse_authority(uri)
}

/// One grammar atom: a literal byte or a `%XX` escape.
///
/// Returns the atom length when it matches `categories`/`extra`, 0 when it
/// does not (including a malformed escape).
fn atom_len(input: &[u8], categories: u8, extra: &[u8]) -> usize {
    if input[0] != b'%' {
        let matched = cat(input[0]) & categories != 0 || extra.contains(&input[0]);
        return if matched { 1 } else { 0 };
    }
    if input.len() >= 3
        && cat(input[1]) & HEXDIGIT != 0
        && cat(input[2]) & HEXDIGIT != 0
        && categories & PCT_ENCODED != 0
    {
        return 3;
    }
    0
}

fn validate(input: &[u8], categories: u8, extra: &[u8]) -> bool {
    let mut rest = input;
    while !rest.is_empty() {
        let n = atom_len(rest, categories, extra);
        if n == 0 {
            return false;
        }
        rest = &rest[n..];
    }
    true
}

fn valid_scheme(scheme: &[u8]) -> bool {
    match scheme.split_first() {
        None => false,
        Some((&first, rest)) => {
            cat(first) & SCHEME_BEGIN != 0
                && rest.iter().all(|&b| cat(b) & SCHEME_CONTINUE != 0)
        }
    }
}

/// Longest dec-octet prefix of `input`: a value 0..=255 with no
/// multi-digit leading zero. Returns the matched length, 0 for no match.
fn parse_dec_octet(input: &[u8]) -> usize {
    let digits = input
        .iter()
        .take(3)
        .take_while(|&&b| cat(b) & DIGIT != 0)
        .count();
    match digits {
        0 => 0,
        1 => 1,
        _ if input[0] == b'0' => 1,
        2 => 2,
        _ => {
            let over_255 = input[0] > b'2'
                || (input[0] == b'2' && (input[1] > b'5' || (input[1] == b'5' && input[2] > b'5')));
            if over_255 {
                2
            } else {
                3
            }
        }
    }
}

fn valid_ipv4(host: &[u8]) -> bool {
    let mut rest = host;
    for i in 0..4 {
        if i != 0 {
            if rest.first() != Some(&b'.') {
                return false;
            }
            rest = &rest[1..];
        }
        let n = parse_dec_octet(rest);
        if n == 0 {
            return false;
        }
        rest = &rest[n..];
    }
    rest.is_empty()
}

fn hexword_len(input: &[u8]) -> usize {
    input
        .iter()
        .take(4)
        .take_while(|&&b| cat(b) & HEXDIGIT != 0)
        .count()
}

fn valid_ipv6(host: &[u8]) -> bool {
    let mut rest = host;
    let mut prefix = 0usize;
    let mut suffix = 0usize;
    let mut short_form = false;

    while prefix + suffix + usize::from(short_form) < 8 && !rest.is_empty() {
        if (!short_form && prefix == 6) || (short_form && suffix < 6) {
            if valid_ipv4(rest) {
                if short_form {
                    suffix += 2;
                } else {
                    prefix += 2;
                }
                rest = &[];
                break;
            }
        }

        let n = hexword_len(rest);
        rest = &rest[n..];
        if n > 0 {
            if short_form {
                suffix += 1;
            } else {
                prefix += 1;
            }
        }

        if rest.first() != Some(&b':') {
            break;
        }
        rest = &rest[1..];

        if rest.first() == Some(&b':') {
            if short_form {
                return false;
            }
            short_form = true;
            rest = &rest[1..];
        }
    }

    if !short_form && prefix != 8 {
        return false;
    }
    rest.is_empty()
}

fn valid_host(host: &[u8]) -> bool {
    if host.len() >= 2 && host[0] == b'[' && host[host.len() - 1] == b']' {
        return valid_ipv6(&host[1..host.len() - 1]);
    }
    if valid_ipv4(host) {
        return true;
    }
    validate(host, UNRESERVED | SUB_DELIM | PCT_ENCODED, b"")
}

fn valid_path(path: &[u8]) -> bool {
    path.split(|&b| b == b'/')
        .all(|segment| {
            segment.is_empty()
                || validate(segment, UNRESERVED | SUB_DELIM | PCT_ENCODED, b":@")
        })
}

/// Component-wise strict validation of a parsed URI.
pub fn valid(uri: &UriRef<'_>) -> bool {
    if uri.flags & URI_SCHEME != 0 && !valid_scheme(uri.scheme) {
        return false;
    }
    if !uri.userinfo.is_empty()
        && !validate(uri.userinfo, UNRESERVED | SUB_DELIM | PCT_ENCODED, b":")
    {
        return false;
    }
    if !uri.port.is_empty() && !validate(uri.port, DIGIT, b"") {
        return false;
    }
    if !uri.host.is_empty() && !valid_host(uri.host) {
        return false;
    }
    if !uri.path.is_empty() && !valid_path(uri.path) {
        return false;
    }
    if !uri.query.is_empty()
        && !validate(uri.query, UNRESERVED | SUB_DELIM | PCT_ENCODED, b":@/?")
    {
        return false;
    }
    if !uri.fragment.is_empty()
        && !validate(uri.fragment, UNRESERVED | SUB_DELIM | PCT_ENCODED, b":@/?")
    {
        return false;
    }
    true
}

#[inline]
fn lowercase(b: u8) -> u8 {
    b.to_ascii_lowercase()
}

/// Normalize a validated component into `arena`: decode escapes of
/// unreserved characters, lowercase the hex of kept escapes, and lowercase
/// literal bytes when `fold_case` is set. A truncated escape at the end of
/// unvalidated input passes through literally.
pub fn normalize(arena: &Arena, input: &[u8], fold_case: bool) -> Result<AStr, ArenaError> {
    if input.is_empty() {
        return Ok(AStr::empty());
    }

    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        if rest[0] == b'%' && rest.len() >= 3 {
            let hi = crate::chars::hex_value(rest[1]).unwrap_or(0);
            let lo = crate::chars::hex_value(rest[2]).unwrap_or(0);
            let decoded = hi << 4 | lo;
            if cat(decoded) & UNRESERVED != 0 {
                out.push(decoded);
            } else {
                out.push(b'%');
                out.push(lowercase(rest[1]));
                out.push(lowercase(rest[2]));
            }
            rest = &rest[3..];
        } else {
            out.push(if fold_case { lowercase(rest[0]) } else { rest[0] });
            rest = &rest[1..];
        }
    }
    AStr::intern(arena, &out)
}

/// Collapse `.` and `..` segments out of a normalized path.
pub fn remove_dot_segments(path: &[u8]) -> Vec<u8> {
    let mut output: Vec<u8> = Vec::with_capacity(path.len());
    let mut rest = path;

    while !rest.is_empty() {
        let size = rest
            .iter()
            .position(|&b| b == b'/')
            .map_or(rest.len(), |i| i + 1);
        let segment = &rest[..size];
        rest = &rest[size..];

        match segment {
            b"./" | b"." => {}
            b"../" | b".." => {
                // A one-byte output can only be "/", which has no parent.
                if output.len() == 1 {
                    continue;
                }
                output.pop();
                while let Some(&last) = output.last() {
                    if last == b'/' {
                        break;
                    }
                    output.pop();
                }
            }
            _ => output.extend_from_slice(segment),
        }
    }

    output
}

/// Reassemble a URI into `scheme://authority/path?query#fragment`.
pub fn write_uri(out: &mut Vec<u8>, uri: &Uri, arena: &Arena) {
    if uri.flags & URI_SCHEME != 0 {
        out.extend_from_slice(uri.scheme.resolve(arena));
        out.push(b':');
    }
    if !uri.authority.is_empty() {
        out.extend_from_slice(b"//");
        out.extend_from_slice(uri.authority.resolve(arena));
    }
    out.extend_from_slice(uri.path.resolve(arena));
    if !uri.query.is_empty() {
        out.push(b'?');
        out.extend_from_slice(uri.query.resolve(arena));
    }
    if !uri.fragment.is_empty() {
        out.push(b'#');
        out.extend_from_slice(uri.fragment.resolve(arena));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use strand_core::kib;

    fn arena() -> Rc<Arena> {
        Rc::new(Arena::new(kib(4), kib(64)).unwrap())
    }

    #[test]
    fn test_parse_origin_form() {
        let uri = parse(b"/where?q=now#frag");
        assert_eq!(uri.path, b"/where");
        assert_eq!(uri.query, b"q=now");
        assert_eq!(uri.fragment, b"frag");
        assert_eq!(uri.flags & URI_SCHEME, 0);
        assert!(valid(&uri));
    }

    #[test]
    fn test_parse_absolute_form() {
        let uri = parse(b"http://user@example.com:8080/a/b?x=1");
        assert_eq!(uri.scheme, b"http");
        assert_eq!(uri.authority, b"user@example.com:8080");
        assert_eq!(uri.userinfo, b"user");
        assert_eq!(uri.host, b"example.com");
        assert_eq!(uri.port, b"8080");
        assert_eq!(uri.path, b"/a/b");
        assert_eq!(uri.query, b"x=1");
        assert!(valid(&uri));
    }

    #[test]
    fn test_parse_authority_ipv6_keeps_port() {
        let uri = UriRef::from_authority(b"[::1]:443");
        assert_eq!(uri.host, b"[::1]");
        assert_eq!(uri.port, b"443");
        assert!(valid(&uri));
    }

    #[test]
    fn test_ipv6_validation() {
        assert!(valid_ipv6(b"::1"));
        assert!(valid_ipv6(b"2001:db8::8a2e:370:7334"));
        assert!(valid_ipv6(b"::ffff:192.0.2.1"));
        assert!(!valid_ipv6(b"1::2::3"));
        assert!(!valid_ipv6(b"12345::"));
    }

    #[test]
    fn test_ipv4_validation() {
        assert!(valid_ipv4(b"127.0.0.1"));
        assert!(valid_ipv4(b"255.255.255.255"));
        assert!(valid_ipv4(b"249.1.2.3"));
        assert!(!valid_ipv4(b"256.0.0.1"));
        assert!(!valid_ipv4(b"300.1.2.3"));
        assert!(!valid_ipv4(b"1.2.3"));
        assert!(!valid_ipv4(b"1.2.3.4.5"));
        assert!(!valid_ipv4(b"01.2.3.4"));
    }

    #[test]
    fn test_invalid_percent_escape_rejected() {
        let uri = parse(b"/%gg");
        assert!(!valid(&uri));
        let uri = parse(b"/a%2");
        assert!(!valid(&uri));
    }

    #[test]
    fn test_normalize_tolerates_truncated_escape() {
        let a = arena();
        let s = normalize(&a, b"/x%", false).unwrap();
        assert_eq!(s.resolve(&a), b"/x%");
        let s = normalize(&a, b"/x%4", false).unwrap();
        assert_eq!(s.resolve(&a), b"/x%4");
    }

    #[test]
    fn test_normalize_decodes_unreserved_and_folds() {
        let a = arena();
        let s = normalize(&a, b"/%7Euser/%2Fbin", false).unwrap();
        assert_eq!(s.resolve(&a), b"/~user/%2fbin");
        let h = normalize(&a, b"EXAMPLE.com", true).unwrap();
        assert_eq!(h.resolve(&a), b"example.com");
    }

    #[test]
    fn test_remove_dot_segments() {
        assert_eq!(remove_dot_segments(b"/a/b/../c"), b"/a/c");
        assert_eq!(remove_dot_segments(b"/a/./b/"), b"/a/b/");
        assert_eq!(remove_dot_segments(b"/../a"), b"/a");
        assert_eq!(remove_dot_segments(b"/a/.."), b"/");
    }
}
