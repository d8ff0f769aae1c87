//! # strand echo server
//!
//! Small end-to-end demo of the strand HTTP stack.
//!
//! Routes:
//! - `POST /` - echo the request back as a JSON report; `?tabsize=N`
//!   pretty-prints with N-space indentation
//! - `GET /^id` - path capture plus query parameters
//! - `PUT /fail` - handler error, exercising the 500 path
//! - `DELETE /explode` - exhausts the connection arena on purpose
//!
//! ## Usage
//!
//!     cargo run -p strand-echo --release -- [--port 8080] [--workers 4]
//!
//! Environment variables (`STRAND_HTTP_*`, `STRAND_LOG_LEVEL`) apply first;
//! flags override them.

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;
use strand_core::kprint::{set_log_level, LogLevel};
use strand_core::{kerror, kib, kwarn, mib, Arena};
use strand_http::{serve, HttpError, Method, Request, Response, Router, ServerOptions};

#[derive(Serialize)]
struct EchoReport {
    method: String,
    uri: String,
    size: usize,
    headers: BTreeMap<String, Vec<String>>,
    body: Value,
}

fn error_response(resp: &mut Response, status: u16, msg: &str) -> Result<(), HttpError> {
    resp.status = status;
    resp.headers.set(b"Content-Type", b"text/plain; charset=UTF-8")?;
    resp.body.clear();
    resp.body.write(msg.as_bytes())?;
    resp.body.push(b'\n')?;
    Ok(())
}

fn header_map(fields: &strand_core::StrMultiMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in fields.iter() {
        map.entry(String::from_utf8_lossy(name).into_owned())
            .or_default()
            .push(String::from_utf8_lossy(value).into_owned());
    }
    map
}

fn render(report: &impl Serialize, tabsize: usize) -> Result<Vec<u8>, HttpError> {
    let rendered = if tabsize == 0 {
        serde_json::to_vec(report)
    } else {
        let indent = vec![b' '; tabsize];
        let mut out = Vec::new();
        let formatter = PrettyFormatter::with_indent(&indent);
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        report.serialize(&mut ser).map(|_| out)
    };
    rendered.map_err(|_| HttpError::Malformed)
}

fn tabsize_of(req: &Request) -> usize {
    req.query
        .get(b"tabsize")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
        .min(8)
}

fn echo(arena: &Rc<Arena>, req: &Request, resp: &mut Response) -> Result<(), HttpError> {
    let body = if req.content().is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(req.content()) {
            Ok(v) => v,
            Err(e) => return error_response(resp, 400, &format!("invalid JSON: {e}")),
        }
    };

    let report = EchoReport {
        method: req.method.as_str().to_string(),
        uri: String::from_utf8_lossy(req.uri_raw.resolve(arena)).into_owned(),
        size: req.content().len(),
        headers: header_map(&req.headers),
        body,
    };

    let rendered = render(&report, tabsize_of(req))?;
    resp.headers.set(b"Content-Type", b"application/json")?;
    resp.body.write(&rendered)?;
    resp.body.push(b'\n')?;
    Ok(())
}

fn params(_: &Rc<Arena>, req: &Request, resp: &mut Response) -> Result<(), HttpError> {
    let id = String::from_utf8_lossy(req.params.get(b"id").unwrap_or(b"")).into_owned();
    let report = serde_json::json!({
        "id": id,
        "query": header_map(&req.query),
    });

    let rendered = render(&report, tabsize_of(req))?;
    resp.headers.set(b"Content-Type", b"application/json")?;
    resp.body.write(&rendered)?;
    resp.body.push(b'\n')?;
    Ok(())
}

fn fail(_: &Rc<Arena>, _: &Request, _: &mut Response) -> Result<(), HttpError> {
    Err(HttpError::Malformed)
}

/// Allocate until the connection arena refuses, to show what ceiling
/// enforcement looks like from the client side.
fn explode(arena: &Rc<Arena>, _: &Request, _: &mut Response) -> Result<(), HttpError> {
    let mut total = 0;
    while arena.alloc(kib(64), 8, false).is_some() {
        total += kib(64);
    }
    kwarn!("explode: arena exhausted after {total} extra bytes");
    Err(HttpError::OutOfMemory)
}

fn usage() -> ! {
    eprintln!(
        "usage: echo [-a HOST] [-p PORT] [-w WORKERS] [-m BYTES] [-v]\n\
         \n\
         -a, --addr HOST      bind address (default 0.0.0.0)\n\
         -p, --port PORT      bind port (default 8080)\n\
         -w, --workers N      worker threads, 0 = CPU count (default 0)\n\
         -m, --mem BYTES      per-connection memory ceiling (default 1 MiB)\n\
         -v, --verbose        debug logging"
    );
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut options = ServerOptions::from_env();
    options.mem_connection_max = mib(1);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" | "-a" => {
                i += 1;
                options.host = args.get(i).cloned().unwrap_or_else(|| usage());
            }
            "--port" | "-p" => {
                i += 1;
                options.port = args.get(i).cloned().unwrap_or_else(|| usage());
            }
            "--workers" | "-w" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(w) => options.workers = w,
                    None => usage(),
                }
            }
            "--mem" | "-m" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(m) => options.mem_connection_max = m,
                    None => usage(),
                }
            }
            "--verbose" | "-v" => set_log_level(LogLevel::Debug),
            _ => usage(),
        }
        i += 1;
    }

    let mut router = Router::new();
    router
        .add(Method::Post, "/", echo)
        .add(Method::Get, "/^id", params)
        .add(Method::Put, "/fail", fail)
        .add(Method::Delete, "/explode", explode);

    if let Err(e) = serve(options, router) {
        kerror!("echo: {e}");
        std::process::exit(1);
    }
}
