//! Request handlers: buffered, streaming, and static.
//!
//! Dispatch works on plain request data and returns either a complete
//! [`Reply`] or a streaming plan the adapter executes. The buffered path
//! guarantees a failed template never writes response bytes; the streaming
//! path trades that for incremental flushing. Both finalize the dot's
//! pending transaction exactly once on every exit.

use crate::build::assets::{clean_url_path, guess_content_type};
use crate::build::{FileInfo, RouteKind};
use crate::dot::flush::{FlushSink, SharedSink};
use crate::dot::Dot;
use crate::server::instance::Instance;
use crate::server::negotiate::negotiate_encoding;
use crate::server::request::{CancelPair, Reply, ReplyBody, RequestCx};
use crate::tmpl::{ExecError, HandlerAction};
use crate::{debug, log};
use crossbeam::queue::SegQueue;
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;
use std::sync::{Arc, LazyLock};

// =============================================================================
// Buffer pool
// =============================================================================

/// Reusable byte buffers for the buffered executor. Lock-free; the only
/// shared mutable state in the serve path.
static BUF_POOL: LazyLock<SegQueue<Vec<u8>>> = LazyLock::new(SegQueue::new);

/// Buffers above this capacity are dropped instead of pooled.
const MAX_POOLED_BUF: usize = 1 << 20;

fn get_buffer() -> Vec<u8> {
    match BUF_POOL.pop() {
        Some(mut buf) => {
            buf.clear();
            buf
        }
        None => Vec::with_capacity(4096),
    }
}

fn put_buffer(buf: Vec<u8>) {
    if buf.capacity() <= MAX_POOLED_BUF {
        BUF_POOL.push(buf);
    }
}

// =============================================================================
// Outcome classification
// =============================================================================

/// The four execution outcomes the handlers distinguish.
pub enum ExecOutcome {
    Success,
    Returned,
    Handler(HandlerAction),
    Failed(String),
}

/// Fold an executor result into an outcome.
pub fn classify(result: Result<(), ExecError>) -> ExecOutcome {
    match result {
        Ok(()) => ExecOutcome::Success,
        Err(ExecError::Return) => ExecOutcome::Returned,
        Err(ExecError::Handler(action)) => ExecOutcome::Handler(action),
        Err(ExecError::Failure(msg)) => ExecOutcome::Failed(msg),
        Err(ExecError::Io(e)) => ExecOutcome::Failed(format!("write: {e}")),
    }
}

impl ExecOutcome {
    /// Clean completion (normal or early return).
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success | ExecOutcome::Returned)
    }

    pub fn describe(&self) -> String {
        match self {
            ExecOutcome::Success => "success".to_string(),
            ExecOutcome::Returned => "returned".to_string(),
            ExecOutcome::Handler(action) => format!("handler: {action}"),
            ExecOutcome::Failed(msg) => msg.clone(),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// What the adapter should do with a request.
pub enum Dispatch {
    Reply(Reply),
    /// An SSE route matched; stream after sending the event-stream headers.
    Stream { template: String, req: Rc<RequestCx> },
}

/// Route a request and run the matching handler.
pub fn dispatch(instance: &Arc<Instance>, mut req: RequestCx) -> Dispatch {
    if instance.is_cancelled() {
        log!("error"; "received request after instance {} cancelled: {} {}", instance.id, req.method, req.path);
        return Dispatch::Reply(Reply::text(500, "server stopped"));
    }

    let (route, path_values) = match instance.routes.lookup(&req.method, &req.path) {
        Some(found) => found,
        None => return Dispatch::Reply(Reply::not_found()),
    };
    req.path_values = path_values;
    let route = route.value.clone();

    debug!("serve"; "{} {} -> {}", req.method, req.path, route.pattern);

    match route.kind {
        RouteKind::Static => Dispatch::Reply(serve_static(instance, &req)),
        RouteKind::Buffered => {
            Dispatch::Reply(run_buffered(instance, Rc::new(req), &route.target))
        }
        RouteKind::Stream => {
            let accepts_sse = req
                .header("accept")
                .map(|accept| {
                    accept
                        .split(',')
                        .any(|t| t.trim().starts_with("text/event-stream"))
                })
                .unwrap_or(false);
            if !accepts_sse {
                return Dispatch::Reply(Reply::text(406, "SSE endpoint"));
            }
            Dispatch::Stream {
                template: route.target,
                req: Rc::new(req),
            }
        }
    }
}

// =============================================================================
// Buffered handler
// =============================================================================

/// Execute a template to completion, then commit a single response.
fn run_buffered(instance: &Arc<Instance>, req: Rc<RequestCx>, template: &str) -> Reply {
    let tree = match instance.namespace.get(template) {
        Some(tree) => tree.clone(),
        None => {
            log!("error"; "route bound to missing template '{}'", template);
            return Reply::internal_error();
        }
    };

    let mut buf = get_buffer();
    let dot = Rc::new(Dot::buffered(instance, req.clone()));
    let result = instance.executor().execute(&tree, &dot.value(), &mut buf);

    match classify(result) {
        ExecOutcome::Handler(action) => {
            // the template elected custom response handling; the buffered
            // body is discarded
            if let Err(e) = dot.finalize(true) {
                log!("warn"; "failed to commit transaction: {:#}", e);
            }
            debug!("serve"; "forwarding response handling: {}", action);
            put_buffer(buf);
            handler_reply(action)
        }
        ExecOutcome::Success | ExecOutcome::Returned => {
            if let Err(e) = dot.finalize(true) {
                log!("error"; "error finalizing template '{}': {:#}", template, e);
                put_buffer(buf);
                return Reply::internal_error();
            }
            let (status, headers) = dot.response().expect("buffered dot has response control");
            let body = buf.to_vec();
            put_buffer(buf);
            Reply {
                status,
                headers,
                body: ReplyBody::Bytes(body),
            }
        }
        ExecOutcome::Failed(msg) => {
            if let Err(e) = dot.finalize(false) {
                log!("warn"; "rollback failed: {:#}", e);
            }
            log!("error"; "error executing template '{}': {}", template, msg);
            put_buffer(buf);
            Reply::internal_error()
        }
    }
}

/// Produce a response from a handler sentinel action.
fn handler_reply(action: HandlerAction) -> Reply {
    match action {
        HandlerAction::ServeFile(path) => match serve_whole_file(&path) {
            Some(reply) => reply,
            None => Reply::internal_error(),
        },
        HandlerAction::ServeContent { name, body, .. } => {
            let content_type = guess_content_type(std::path::Path::new(&name), &body);
            Reply {
                status: 200,
                headers: vec![("Content-Type".to_string(), content_type)],
                body: ReplyBody::Bytes(body),
            }
        }
        HandlerAction::Redirect { status, location } => {
            Reply::status(status).with_header("Location", &location)
        }
    }
}

fn serve_whole_file(path: &std::path::Path) -> Option<Reply> {
    let mut file = std::fs::File::open(path).ok()?;
    let meta = file.metadata().ok()?;
    let mut head = [0u8; 512];
    let n = file.read(&mut head).ok()?;
    file.seek(SeekFrom::Start(0)).ok()?;
    let content_type = guess_content_type(path, &head[..n]);

    let mut headers = vec![("Content-Type".to_string(), content_type)];
    if let Ok(modtime) = meta.modified() {
        headers.push(("Last-Modified".to_string(), httpdate::fmt_http_date(modtime)));
    }
    Some(Reply {
        status: 200,
        headers,
        body: ReplyBody::File {
            file,
            length: meta.len(),
        },
    })
}

// =============================================================================
// Static handler
// =============================================================================

/// Hash query prefixes shorter than this are rejected outright.
const MIN_HASH_PREFIX: usize = 40;

/// Serve a pre-indexed static file with negotiation, conditional GET, and
/// single-range support.
fn serve_static(instance: &Arc<Instance>, req: &RequestCx) -> Reply {
    let urlpath = clean_url_path(&req.path);
    let info = match instance.files.get(&urlpath) {
        Some(info) => info,
        None => {
            // should not happen; routes only exist for indexed files
            log!("warn"; "tried to serve a file that doesn't exist: {}", urlpath);
            return Reply::not_found();
        }
    };

    // the hash query gate requires a strong prefix of the stored hash
    let query_hash = req.query_value("hash");
    if let Some(qh) = &query_hash {
        if qh.len() < MIN_HASH_PREFIX || !info.hash.starts_with(qh.as_str()) {
            debug!("serve"; "request for {} with wrong hash query: {}", urlpath, qh);
            return Reply::not_found();
        }
    }

    let accept: Vec<&str> = req.header_all("accept-encoding");
    let negotiated = match negotiate_encoding(&accept, &info.encodings) {
        Some(n) => n,
        None => {
            log!("error"; "static entry {} has no encodings", urlpath);
            return Reply::internal_error();
        }
    };
    if let Some(warning) = negotiated.warning {
        log!("warn"; "{}: {}", urlpath, warning);
    }
    let variant = negotiated.variant;

    let abs = instance.config.template_dir.join(&variant.path);
    let mut file = match std::fs::File::open(&abs) {
        Ok(f) => f,
        Err(e) => {
            log!("error"; "failed to open {}: {}", abs.display(), e);
            return Reply::internal_error();
        }
    };

    // serving a file modified since build is logged but allowed
    if let Ok(meta) = file.metadata() {
        if meta.modified().ok() != Some(variant.modtime) {
            log!("warn"; "{} modified since instance load", variant.path);
        }
    }

    let mut headers = vec![
        ("Etag".to_string(), format!("\"{}\"", info.hash)),
        ("Content-Type".to_string(), info.content_type.clone()),
        ("Content-Encoding".to_string(), variant.encoding.to_string()),
        ("Vary".to_string(), "Accept-Encoding".to_string()),
        (
            "Last-Modified".to_string(),
            httpdate::fmt_http_date(variant.modtime),
        ),
        ("Accept-Ranges".to_string(), "bytes".to_string()),
    ];
    if query_hash.is_some() {
        // a hash-disambiguated URL can be cached aggressively
        headers.push((
            "Cache-Control".to_string(),
            "public, max-age=31536000".to_string(),
        ));
    }

    if not_modified(req, info, variant.modtime) {
        return Reply {
            status: 304,
            headers,
            body: ReplyBody::Empty,
        };
    }

    // single-range requests; anything unparsable falls back to the full body
    if let Some(range) = req.header("range") {
        if let Some((start, end)) = parse_range(range, variant.size) {
            let length = end - start + 1;
            if file.seek(SeekFrom::Start(start)).is_ok() {
                headers.push((
                    "Content-Range".to_string(),
                    format!("bytes {}-{}/{}", start, end, variant.size),
                ));
                return Reply {
                    status: 206,
                    headers,
                    body: ReplyBody::File { file, length },
                };
            }
        }
    }

    Reply {
        status: 200,
        headers,
        body: ReplyBody::File {
            file,
            length: variant.size,
        },
    }
}

/// Conditional GET: `If-None-Match` against the Etag, then
/// `If-Modified-Since` against the variant modtime.
fn not_modified(req: &RequestCx, info: &FileInfo, modtime: std::time::SystemTime) -> bool {
    if let Some(inm) = req.header("if-none-match") {
        let etag = format!("\"{}\"", info.hash);
        return inm == "*" || inm.split(',').any(|t| t.trim().trim_start_matches("W/") == etag);
    }
    if let Some(ims) = req.header("if-modified-since") {
        if let Ok(since) = httpdate::parse_http_date(ims) {
            // HTTP dates have second precision; truncate before comparing
            let modtime_secs = modtime
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let since_secs = since
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            return modtime_secs <= since_secs;
        }
    }
    false
}

/// Parse a `bytes=start-end` range header against the resource size.
fn parse_range(raw: &str, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let spec = raw.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None; // multi-range unsupported; serve the whole body
    }
    let (start_s, end_s) = spec.split_once('-')?;
    match (start_s.trim(), end_s.trim()) {
        ("", suffix) => {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some((size.saturating_sub(n), size - 1))
        }
        (start, "") => {
            let start: u64 = start.parse().ok()?;
            if start >= size {
                return None;
            }
            Some((start, size - 1))
        }
        (start, end) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start > end || start >= size {
                return None;
            }
            Some((start, end.min(size - 1)))
        }
    }
}

// =============================================================================
// Streaming handler
// =============================================================================

/// Headers the adapter must send before running a stream.
pub fn sse_headers() -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "text/event-stream".to_string()),
        ("Cache-Control".to_string(), "no-cache".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
    ]
}

/// Execute an SSE template against a flush-capable sink. Headers are
/// already on the wire; errors here can only terminate the stream.
pub fn run_stream(
    instance: &Arc<Instance>,
    req: Rc<RequestCx>,
    template: &str,
    sink: Rc<RefCell<dyn FlushSink>>,
    cancel: CancelPair,
) {
    let tree = match instance.namespace.get(template) {
        Some(tree) => tree.clone(),
        None => {
            log!("error"; "route bound to missing template '{}'", template);
            return;
        }
    };

    let dot = Rc::new(Dot::streaming(instance, req, sink.clone(), cancel));
    let mut out = SharedSink(sink.clone());
    let result = instance.executor().execute(&tree, &dot.value(), &mut out);

    match classify(result) {
        ExecOutcome::Handler(action) => {
            if let Err(e) = dot.finalize(true) {
                log!("warn"; "failed to commit transaction: {:#}", e);
            }
            // headers are gone; delegation can only append to the body tail
            debug!("serve"; "stream forwarding response handling: {}", action);
            stream_tail(&sink, action);
        }
        ExecOutcome::Success | ExecOutcome::Returned => {
            if let Err(e) = dot.finalize(true) {
                log!("error"; "error finalizing stream '{}': {:#}", template, e);
            }
        }
        ExecOutcome::Failed(msg) => {
            if let Err(e) = dot.finalize(false) {
                log!("warn"; "rollback failed: {:#}", e);
            }
            log!("error"; "error executing stream '{}': {}", template, msg);
        }
    }

    let _ = sink.borrow_mut().flush_chunk();
}

fn stream_tail(sink: &Rc<RefCell<dyn FlushSink>>, action: HandlerAction) {
    match action {
        HandlerAction::ServeFile(path) => {
            if let Ok(body) = std::fs::read(&path) {
                let _ = sink.borrow_mut().write_all(&body);
            }
        }
        HandlerAction::ServeContent { body, .. } => {
            let _ = sink.borrow_mut().write_all(&body);
        }
        HandlerAction::Redirect { location, .. } => {
            log!("warn"; "redirect to {} ignored on an open stream", location);
        }
    }
}
