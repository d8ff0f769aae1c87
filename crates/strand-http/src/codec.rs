//! HTTP/1.1 wire codec.
//!
//! Request-line and field parsing over byte slices, request validation (the
//! framing decision), query/path parameter extraction, and response
//! serialization. Parsed strings are interned into the connection arena;
//! nothing here does I/O.

use crate::chars;
use crate::error::HttpError;
use crate::uri::{self, Uri, UriRef, URI_AUTHORITY};
use std::fmt::Write as _;
use std::rc::Rc;
use strand_core::{Arena, ArenaError, AStr, Buffer, StrMultiMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub const COUNT: usize = 9;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

/// Exact, case-sensitive method match.
pub fn parse_method(input: &[u8]) -> Option<Method> {
    match input {
        b"GET" => Some(Method::Get),
        b"HEAD" => Some(Method::Head),
        b"POST" => Some(Method::Post),
        b"PUT" => Some(Method::Put),
        b"DELETE" => Some(Method::Delete),
        b"CONNECT" => Some(Method::Connect),
        b"OPTIONS" => Some(Method::Options),
        b"TRACE" => Some(Method::Trace),
        b"PATCH" => Some(Method::Patch),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V09,
    V10,
    V11,
    V20,
    V30,
}

/// Literal `HTTP/<digit>.<digit>` versions this parser knows about.
pub fn parse_version(input: &[u8]) -> Option<Version> {
    match input {
        b"HTTP/0.9" => Some(Version::V09),
        b"HTTP/1.0" => Some(Version::V10),
        b"HTTP/1.1" => Some(Version::V11),
        b"HTTP/2.0" => Some(Version::V20),
        b"HTTP/3.0" => Some(Version::V30),
        _ => None,
    }
}

/// Reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// One request epoch. Recreated (not reused) after every response, together
/// with the arena free back to the connection's post-accept marker.
pub struct Request {
    arena: Rc<Arena>,
    pub method: Method,
    pub version: Version,
    pub uri: Uri,
    pub uri_raw: AStr,
    pub headers: StrMultiMap,
    pub trailers: StrMultiMap,
    pub params: StrMultiMap,
    pub query: StrMultiMap,
    pub content_length: usize,
    pub chunked: bool,
    pub close: bool,
    content_ptr: *const u8,
    content_len: usize,
}

impl Request {
    pub fn new(arena: Rc<Arena>) -> Self {
        Self {
            method: Method::Get,
            version: Version::V11,
            uri: Uri::default(),
            uri_raw: AStr::empty(),
            headers: StrMultiMap::new(arena.clone(), 16),
            trailers: StrMultiMap::new(arena.clone(), 4),
            params: StrMultiMap::new(arena.clone(), 8),
            query: StrMultiMap::new(arena.clone(), 8),
            content_length: 0,
            chunked: false,
            close: false,
            content_ptr: std::ptr::null(),
            content_len: 0,
            arena,
        }
    }

    #[inline]
    pub fn arena(&self) -> &Rc<Arena> {
        &self.arena
    }

    /// Request body, fully buffered.
    pub fn content(&self) -> &[u8] {
        if self.content_len == 0 {
            return &[];
        }
        // Safety: points into the connection's content buffer, which outlives
        // the request epoch.
        unsafe { std::slice::from_raw_parts(self.content_ptr, self.content_len) }
    }

    pub(crate) fn set_content(&mut self, bytes: &[u8]) {
        self.content_ptr = bytes.as_ptr();
        self.content_len = bytes.len();
    }

    /// Normalized request path.
    pub fn path(&self) -> &[u8] {
        self.uri.path.resolve(&self.arena)
    }
}

/// Response under construction; the body is always fully buffered before
/// serialization (no chunked responses).
pub struct Response {
    pub status: u16,
    pub headers: StrMultiMap,
    pub body: Buffer,
}

impl Response {
    pub fn new(arena: Rc<Arena>) -> Result<Self, ArenaError> {
        Ok(Self {
            status: 200,
            headers: StrMultiMap::new(arena.clone(), 16),
            body: Buffer::with_capacity(arena, 256)?,
        })
    }
}

/// Bytes up to the first delimiter; the delimiter stays in `input`.
fn next_token<'a>(input: &mut &'a [u8], delims: &[u8]) -> &'a [u8] {
    let end = input
        .iter()
        .position(|b| delims.contains(b))
        .unwrap_or(input.len());
    let (token, rest) = input.split_at(end);
    *input = rest;
    token
}

/// Consume leading bytes found in `chars`, at most `limit` (0 = unlimited).
/// Returns how many were consumed.
fn consume_chars(input: &mut &[u8], set: &[u8], limit: usize) -> usize {
    let mut n = 0;
    while n < input.len() && set.contains(&input[n]) {
        n += 1;
        if limit != 0 && n == limit {
            break;
        }
    }
    *input = &input[n..];
    n
}

fn trim<'a>(mut input: &'a [u8], set: &[u8]) -> &'a [u8] {
    while let Some(first) = input.first() {
        if !set.contains(first) {
            break;
        }
        input = &input[1..];
    }
    while let Some(last) = input.last() {
        if !set.contains(last) {
            break;
        }
        input = &input[..input.len() - 1];
    }
    input
}

/// Field names are stored Title-Case-With-Hyphens regardless of the case on
/// the wire.
pub fn canonical_field_name(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len());
    let mut start_of_word = true;
    for &b in name {
        if start_of_word {
            out.push(b.to_ascii_uppercase());
        } else {
            out.push(b.to_ascii_lowercase());
        }
        start_of_word = b == b'-';
    }
    out
}

/// Parse `method SP request-target SP HTTP-version` with exactly one space
/// between parts.
pub fn parse_reqline(
    arena: &Rc<Arena>,
    request: &mut Request,
    line: &[u8],
) -> Result<(), HttpError> {
    let mut rest = line;

    let method_token = next_token(&mut rest, b" ");
    let method = parse_method(method_token).ok_or(HttpError::Malformed)?;
    if consume_chars(&mut rest, b" ", 0) != 1 {
        return Err(HttpError::Malformed);
    }

    let target = next_token(&mut rest, b" ");
    if target.is_empty() {
        return Err(HttpError::Malformed);
    }
    if consume_chars(&mut rest, b" ", 0) != 1 {
        return Err(HttpError::Malformed);
    }

    let version = parse_version(rest).ok_or(HttpError::Malformed)?;

    request.method = method;
    request.version = version;

    let parsed = if method == Method::Connect {
        let authority = UriRef::from_authority(target);
        if !authority.userinfo.is_empty() {
            return Err(HttpError::Malformed);
        }
        authority
    } else if method == Method::Options && target == b"*" {
        UriRef::from_path(target)
    } else {
        uri::parse(target)
    };

    if !uri::valid(&parsed) {
        return Err(HttpError::Malformed);
    }

    request.uri_raw = AStr::intern(arena, target)?;
    request.uri = normalize_uri(arena, &parsed)?;
    Ok(())
}

/// Normalize every component into the arena; the fragment is dropped (a
/// server has no use for it).
fn normalize_uri(arena: &Rc<Arena>, parsed: &UriRef<'_>) -> Result<Uri, HttpError> {
    let path = uri::normalize(arena, parsed.path, false)?;
    let path = if parsed.path.is_empty() {
        path
    } else {
        let collapsed = uri::remove_dot_segments(path.resolve(arena));
        AStr::intern(arena, &collapsed)?
    };

    Ok(Uri {
        scheme: uri::normalize(arena, parsed.scheme, true)?,
        authority: uri::normalize(arena, parsed.authority, false)?,
        userinfo: uri::normalize(arena, parsed.userinfo, false)?,
        host: uri::normalize(arena, parsed.host, true)?,
        port: uri::normalize(arena, parsed.port, false)?,
        path,
        query: uri::normalize(arena, parsed.query, false)?,
        fragment: AStr::empty(),
        flags: parsed.flags,
    })
}

/// Parse `field-name ":" OWS field-value OWS` and add it to `fields`.
pub fn parse_field(fields: &mut StrMultiMap, line: &[u8]) -> Result<(), HttpError> {
    let mut rest = line;

    let name = next_token(&mut rest, b":");
    if name.is_empty() || !chars::validate(name, chars::TOKEN, b"") {
        return Err(HttpError::Malformed);
    }
    if consume_chars(&mut rest, b":", 0) != 1 {
        return Err(HttpError::Malformed);
    }

    let value = trim(rest, b" \t");
    if !chars::validate(value, chars::VCHAR, b" \t") {
        return Err(HttpError::Malformed);
    }

    let canonical = canonical_field_name(name);
    fields.add(&canonical, value)?;
    Ok(())
}

/// Percent-decode a query component; `+` decodes to space.
fn pctdecode_query(out: &mut Vec<u8>, input: &[u8]) -> Result<(), HttpError> {
    out.clear();
    let mut rest = input;
    while let Some(&b) = rest.first() {
        match b {
            b'%' => {
                if rest.len() < 3 {
                    return Err(HttpError::Malformed);
                }
                let hi = chars::hex_value(rest[1]).ok_or(HttpError::Malformed)?;
                let lo = chars::hex_value(rest[2]).ok_or(HttpError::Malformed)?;
                out.push(hi << 4 | lo);
                rest = &rest[3..];
            }
            b'+' => {
                out.push(b' ');
                rest = &rest[1..];
            }
            _ => {
                out.push(b);
                rest = &rest[1..];
            }
        }
    }
    Ok(())
}

/// Split `name=value&name=value` into the multimap, percent-decoding both
/// sides. Empty items and empty names are skipped.
pub fn parse_query(fields: &mut StrMultiMap, query: &[u8]) -> Result<(), HttpError> {
    let mut rest = query;
    let mut name_buf = Vec::new();
    let mut value_buf = Vec::new();

    while !rest.is_empty() {
        let mut item = next_token(&mut rest, b"&");
        consume_chars(&mut rest, b"&", 1);
        if item.is_empty() {
            continue;
        }

        let name = next_token(&mut item, b"=");
        consume_chars(&mut item, b"=", 1);
        if name.is_empty() {
            continue;
        }

        pctdecode_query(&mut name_buf, name)?;
        pctdecode_query(&mut value_buf, item)?;
        fields.add(&name_buf, &value_buf)?;
    }
    Ok(())
}

/// Zip the request path against the route path, collecting `^name` capture
/// segments into `params`.
pub fn parse_uriparams(
    params: &mut StrMultiMap,
    path: &[u8],
    route_path: &[u8],
) -> Result<(), HttpError> {
    let mut path_rest = path;
    let mut route_rest = route_path;

    loop {
        consume_chars(&mut path_rest, b"/", 0);
        let segment = next_token(&mut path_rest, b"/");
        if segment.is_empty() {
            break;
        }

        consume_chars(&mut route_rest, b"/", 0);
        let route_segment = next_token(&mut route_rest, b"/");
        if route_segment.first() != Some(&b'^') {
            continue;
        }

        params.add(&route_segment[1..], segment)?;
    }
    Ok(())
}

/// Decide framing and connection lifetime from the parsed header fields.
///
/// Enforces: HTTP/1.0 or 1.1 only, exactly one `Host`, `Transfer-Encoding`
/// only as the single value `chunked`, a single all-digit `Content-Length`
/// exclusive with chunked, and `Connection` as `close` or `keep-alive`.
/// Rewrites the stored `Host` to the canonical `host:port` and parses the
/// query string.
pub fn validate_request(arena: &Rc<Arena>, request: &mut Request) -> Result<(), HttpError> {
    request.content_length = 0;
    request.chunked = false;

    match request.version {
        Version::V10 => request.close = true,
        Version::V11 => request.close = false,
        _ => return Err(HttpError::Malformed),
    }

    if request.headers.count(b"Host") != 1 {
        return Err(HttpError::Malformed);
    }

    if request.uri.flags & URI_AUTHORITY != 0 && request.uri.authority.is_empty() {
        return Err(HttpError::Malformed);
    }

    if request.uri.scheme.is_empty() {
        request.uri.scheme = AStr::intern(arena, b"http")?;
    }
    if request.uri.scheme.resolve(arena) != b"http" {
        return Err(HttpError::Malformed);
    }

    if request.method != Method::Connect && request.uri.authority.is_empty() {
        let (authority, userinfo, host, port) = {
            let host_value = request.headers.get(b"Host").unwrap_or(b"");
            let parsed = UriRef::from_authority(host_value);
            if !uri::valid(&parsed) {
                return Err(HttpError::Malformed);
            }
            (
                AStr::intern(arena, parsed.authority)?,
                AStr::intern(arena, parsed.userinfo)?,
                uri::normalize(arena, parsed.host, true)?,
                AStr::intern(arena, parsed.port)?,
            )
        };
        request.uri.authority = authority;
        request.uri.userinfo = userinfo;
        request.uri.host = host;
        request.uri.port = port;
    }

    if request.uri.port.is_empty() {
        request.uri.port = AStr::intern(arena, b"80")?;
    }
    if request.uri.authority.is_empty() {
        return Err(HttpError::Malformed);
    }

    let canonical_host = {
        let mut joined = request.uri.host.resolve(arena).to_vec();
        joined.push(b':');
        joined.extend_from_slice(request.uri.port.resolve(arena));
        joined
    };
    request.headers.set(b"Host", &canonical_host)?;

    if request.headers.contains(b"Transfer-Encoding") {
        if request.headers.count(b"Transfer-Encoding") != 1
            || request.headers.get(b"Transfer-Encoding") != Some(&b"chunked"[..])
        {
            return Err(HttpError::Malformed);
        }
        request.chunked = true;
    }

    if request.headers.contains(b"Content-Length") {
        if request.chunked || request.headers.count(b"Content-Length") != 1 {
            return Err(HttpError::Malformed);
        }
        let value = request.headers.get(b"Content-Length").unwrap_or(b"");
        if value.is_empty() || !chars::validate(value, chars::DIGIT, b"") {
            return Err(HttpError::Malformed);
        }
        let mut length: usize = 0;
        for &b in value {
            length = length
                .checked_mul(10)
                .and_then(|n| n.checked_add((b - b'0') as usize))
                .ok_or(HttpError::Malformed)?;
        }
        request.content_length = length;
    }

    if request.headers.contains(b"Connection") {
        if request.headers.count(b"Connection") != 1 {
            return Err(HttpError::Malformed);
        }
        match request.headers.get(b"Connection") {
            Some(b"close") => request.close = true,
            Some(b"keep-alive") => request.close = false,
            _ => return Err(HttpError::Malformed),
        }
    }

    let query = request.uri.query;
    let query_bytes = query.resolve(arena).to_vec();
    parse_query(&mut request.query, &query_bytes)?;

    Ok(())
}

/// Hex prefix of a chunk-size line. Returns the value and the number of hex
/// digits consumed; anything after the digits (chunk extensions) is accepted
/// without validation.
pub fn parse_hex_prefix(line: &[u8]) -> Result<(usize, usize), HttpError> {
    let mut value: usize = 0;
    let mut digits = 0;
    for &b in line {
        let Some(v) = chars::hex_value(b) else {
            break;
        };
        value = value
            .checked_mul(16)
            .and_then(|n| n.checked_add(v as usize))
            .ok_or(HttpError::Malformed)?;
        digits += 1;
    }
    if digits == 0 {
        return Err(HttpError::Malformed);
    }
    Ok((value, digits))
}

static WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
static MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Gregorian date from a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// `Sun, 06 Nov 1994 08:49:37 GMT` for a unix timestamp.
pub fn write_imf_fixdate(out: &mut Buffer, unix_secs: u64) -> Result<(), ArenaError> {
    let days = (unix_secs / 86_400) as i64;
    let rem = unix_secs % 86_400;
    let weekday = WEEKDAYS[((days + 4) % 7) as usize];
    let (year, month, day) = civil_from_days(days);
    write!(
        out,
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        weekday,
        day,
        MONTHS[(month - 1) as usize],
        year,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60,
    )
    .map_err(|_| ArenaError::OutOfMemory)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serialize the status line, `Date`, `Content-Length`, the optional close
/// marker, every header chain as repeated lines, and the body.
pub fn write_response(
    out: &mut Buffer,
    response: &Response,
    close: bool,
) -> Result<(), ArenaError> {
    write!(
        out,
        "HTTP/1.1 {} {}\r\n",
        response.status,
        status_text(response.status)
    )
    .map_err(|_| ArenaError::OutOfMemory)?;

    out.write(b"Date: ")?;
    write_imf_fixdate(out, unix_now())?;
    out.write(b"\r\n")?;

    write!(out, "Content-Length: {}\r\n", response.body.len())
        .map_err(|_| ArenaError::OutOfMemory)?;

    if close {
        out.write(b"Connection: close\r\n")?;
    }

    for (name, value) in response.headers.iter() {
        out.write(name)?;
        out.write(b": ")?;
        out.write(value)?;
        out.write(b"\r\n")?;
    }

    out.write(b"\r\n")?;
    out.write(response.body.as_slice())?;
    Ok(())
}

/// Turn `response` into a plain-text status page (404, 400, 500, ...).
pub fn write_status(response: &mut Response, status: u16) -> Result<(), ArenaError> {
    response.status = status;
    response
        .headers
        .set(b"Content-Type", b"text/plain; charset=UTF-8")?;
    response.body.clear();
    write!(response.body, "{} {}\n", status, status_text(status))
        .map_err(|_| ArenaError::OutOfMemory)
}
