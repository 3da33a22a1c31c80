//! tiny_http glue.
//!
//! Owns everything that touches the HTTP library: binding with port retry,
//! the request loop over a rayon pool, converting requests into the
//! engine's snapshot form, writing replies back, and bridging SSE
//! execution through a bounded channel into a chunked response body.

use crate::dot::flush::FlushSink;
use crate::server::handlers::{self, Dispatch};
use crate::server::request::{CancelPair, Reply, ReplyBody, RequestCx};
use crate::server::supervisor::Supervisor;
use crate::{debug, log, state};
use anyhow::Result;
use crossbeam::channel::{Receiver, Sender};
use std::cell::RefCell;
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tiny_http::{Header, Request, Response, Server, StatusCode};

/// Maximum number of port binding attempts.
const MAX_PORT_RETRIES: u16 = 10;

/// Request bodies beyond this are truncated.
const MAX_BODY: usize = 10 << 20;

/// Bind to the configured address, retrying successive ports when taken.
pub fn bind_with_retry(listen: &str) -> Result<(Server, SocketAddr)> {
    let base: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", listen, e))?;

    for offset in 0..MAX_PORT_RETRIES {
        let port = base.port().saturating_add(offset);
        let addr = SocketAddr::new(base.ip(), port);
        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {} in use, using {} instead", base.port(), port);
                }
                // resolve the actual port when the caller asked for :0
                let actual = server.server_addr().to_ip().unwrap_or(addr);
                return Ok((server, actual));
            }
            Err(_) if offset + 1 < MAX_PORT_RETRIES => continue,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to bind after {} attempts (ports {}-{}): {}",
                    MAX_PORT_RETRIES,
                    base.port(),
                    port,
                    e
                ))
            }
        }
    }
    unreachable!()
}

/// Run the request loop until the server is unblocked by shutdown.
pub fn run_request_loop(server: &Server, supervisor: &Arc<Supervisor>) {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(8)
        .build()
        .expect("failed to create request pool");

    for request in server.incoming_requests() {
        if state::is_shutdown() {
            let _ = request.respond(Response::from_string("503 shutting down").with_status_code(StatusCode(503)));
            continue;
        }
        let supervisor = Arc::clone(supervisor);
        pool.spawn(move || {
            if let Err(e) = handle_request(&supervisor, request) {
                log!("serve"; "request error: {:#}", e);
            }
        });
    }
}

/// Handle one request end to end against the current instance.
fn handle_request(supervisor: &Arc<Supervisor>, mut request: Request) -> Result<()> {
    let instance = supervisor.instance();
    let req = snapshot(&mut request)?;
    let head_only = req.method == "HEAD";

    match handlers::dispatch(&instance, req) {
        Dispatch::Reply(reply) => write_reply(request, reply, head_only),
        Dispatch::Stream { template, req } => {
            stream_response(&instance, request, &template, req)
        }
    }
}

/// Decode a tiny_http request into the engine's snapshot form.
fn snapshot(request: &mut Request) -> Result<RequestCx> {
    let method = request.method().to_string().to_uppercase();
    let mut req = RequestCx::new(&method, request.url());
    req.remote_addr = request.remote_addr().copied();
    req.headers = request
        .headers()
        .iter()
        .map(|h| (h.field.to_string(), h.value.to_string()))
        .collect();

    // bodies are read eagerly for methods that carry them
    if !matches!(method.as_str(), "GET" | "HEAD") {
        let mut body = Vec::new();
        request
            .as_reader()
            .take(MAX_BODY as u64)
            .read_to_end(&mut body)?;
        req.body = Some(body);
    }
    Ok(req)
}

/// Write a buffered reply to the wire.
fn write_reply(request: Request, reply: Reply, head_only: bool) -> Result<()> {
    let headers = make_headers(&reply.headers);
    let status = StatusCode(reply.status);

    if head_only {
        let mut response = Response::empty(status);
        for h in headers {
            response.add_header(h);
        }
        request.respond(response)?;
        return Ok(());
    }

    match reply.body {
        ReplyBody::Empty => {
            let mut response = Response::empty(status);
            for h in headers {
                response.add_header(h);
            }
            request.respond(response)?;
        }
        ReplyBody::Bytes(bytes) => {
            let len = bytes.len();
            let response = Response::new(status, headers, Cursor::new(bytes), Some(len), None);
            request.respond(response)?;
        }
        ReplyBody::File { file, length } => {
            let response =
                Response::new(status, headers, file.take(length), Some(length as usize), None);
            request.respond(response)?;
        }
    }
    Ok(())
}

fn make_headers(headers: &[(String, String)]) -> Vec<Header> {
    headers
        .iter()
        .filter_map(|(k, v)| Header::from_bytes(k.as_bytes(), v.as_bytes()).ok())
        .collect()
}

// =============================================================================
// SSE bridge
// =============================================================================

/// Sink side: accumulates template output, ships a chunk per flush.
struct ChannelSink {
    pending: Vec<u8>,
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_chunk()
    }
}

impl FlushSink for ChannelSink {
    fn flush_chunk(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.pending);
        self.tx
            .send(chunk)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client gone"))
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        let _ = self.flush_chunk();
    }
}

/// Reader side: feeds tiny_http's chunked response body from the channel.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0), // sender dropped: end of stream
            }
        }
        let n = (&self.current[self.pos..]).read(buf)?;
        self.pos += n;
        Ok(n)
    }
}

/// Send the event-stream headers, then execute the template with a
/// flush-capable sink feeding the response body.
fn stream_response(
    instance: &Arc<crate::server::instance::Instance>,
    request: Request,
    template: &str,
    req: Rc<RequestCx>,
) -> Result<()> {
    let (tx, rx) = crossbeam::channel::bounded::<Vec<u8>>(16);
    let client_gone = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let cancel = CancelPair {
        instance: instance.cancel.clone(),
        client: client_gone.clone(),
    };

    let reader = ChannelReader {
        rx,
        current: Vec::new(),
        pos: 0,
    };
    let headers = make_headers(&handlers::sse_headers());
    let response = Response::new(StatusCode(200), headers, reader, None, None);

    // the responder thread owns the connection; it ends when the sink
    // drops (stream complete) or the client disconnects
    let responder = std::thread::spawn(move || {
        if let Err(e) = request.respond(response) {
            debug!("serve"; "stream client closed: {}", e);
        }
        client_gone.store(true, Ordering::Relaxed);
    });

    {
        let sink: Rc<RefCell<dyn FlushSink>> = Rc::new(RefCell::new(ChannelSink {
            pending: Vec::new(),
            tx,
        }));
        handlers::run_stream(instance, req, template, sink, cancel);
        // sink drops here, closing the channel
    }

    responder
        .join()
        .map_err(|_| anyhow::anyhow!("stream responder panicked"))?;
    Ok(())
}
