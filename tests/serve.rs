//! End-to-end tests: build an instance from a real template tree and drive
//! the dispatch layer the way the HTTP adapter does.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::Arc;

use xtemplate::config::Config;
use xtemplate::dot::flush::FlushSink;
use xtemplate::server::handlers::{dispatch, run_stream, sse_headers, Dispatch};
use xtemplate::server::request::{CancelPair, Reply, ReplyBody, RequestCx};
use xtemplate::server::{Instance, Supervisor};

fn write_tree(dir: &std::path::Path, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

fn build(dir: &std::path::Path) -> Arc<Instance> {
    let config = Config {
        template_dir: dir.to_path_buf(),
        watch: false,
        ..Config::default()
    };
    Instance::build(&config).unwrap()
}

fn get(instance: &Arc<Instance>, method: &str, path: &str) -> Reply {
    request(instance, RequestCx::new(method, path))
}

fn request(instance: &Arc<Instance>, req: RequestCx) -> Reply {
    match dispatch(instance, req) {
        Dispatch::Reply(reply) => reply,
        Dispatch::Stream { .. } => panic!("expected buffered reply"),
    }
}

fn body_string(reply: Reply) -> String {
    match reply.body {
        ReplyBody::Bytes(b) => String::from_utf8(b).unwrap(),
        ReplyBody::Empty => String::new(),
        ReplyBody::File { mut file, length } => {
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).unwrap();
            String::from_utf8(buf).unwrap()
        }
    }
}

fn header<'r>(reply: &'r Reply, name: &str) -> Option<&'r str> {
    reply
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// =============================================================================
// Scenario: index file serves the root path
// =============================================================================

#[test]
fn index_template_serves_root() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("index.html", b"hi")]);
    let instance = build(dir.path());

    let reply = get(&instance, "GET", "/");
    assert_eq!(reply.status, 200);
    assert_eq!(body_string(reply), "hi");

    // the {$} anchor: subtree paths do not match
    let reply = get(&instance, "GET", "/anything");
    assert_eq!(reply.status, 404);
}

// =============================================================================
// Scenario: pre-compressed static variant with matching Etag
// =============================================================================

#[test]
fn compressed_variant_served_with_identity_etag() {
    let identity: &[u8] = b"body { margin: 0; padding: 0 }";
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
    enc.write_all(identity).unwrap();
    let gz = enc.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[("style.css", identity), ("style.css.gz", gz.as_slice())],
    );
    let instance = build(dir.path());

    let mut req = RequestCx::new("GET", "/style.css");
    req.headers
        .push(("Accept-Encoding".to_string(), "gzip".to_string()));
    let reply = request(&instance, req);

    assert_eq!(reply.status, 200);
    assert_eq!(header(&reply, "Content-Encoding"), Some("gzip"));
    let etag = header(&reply, "Etag").unwrap().to_string();

    // the served bytes decode to the hash recorded in the Etag
    let served = match reply.body {
        ReplyBody::File { mut file, length } => {
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf).unwrap();
            buf
        }
        other => panic!("expected file body, got {other:?}"),
    };
    let mut dec = flate2::read::GzDecoder::new(served.as_slice());
    let mut decoded = Vec::new();
    dec.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, identity);

    let expected_hash = instance.files.get("/style.css").unwrap().hash.clone();
    assert_eq!(etag, format!("\"{expected_hash}\""));
}

// =============================================================================
// Scenario: METHOD route definition with path parameter
// =============================================================================

#[test]
fn method_definition_routes_and_file_route_coexist() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[(
            "a.html",
            br#"file-level{{define "DELETE /x/{id}"}}{{.Resp.SetStatus 204}}{{end}}"#
                as &[u8],
        )],
    );
    let instance = build(dir.path());

    let reply = get(&instance, "DELETE", "/x/42");
    assert_eq!(reply.status, 204);
    assert_eq!(body_string(reply), "");

    let reply = get(&instance, "GET", "/a");
    assert_eq!(reply.status, 200);
    assert_eq!(body_string(reply), "file-level");
}

#[test]
fn path_values_reach_the_template() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[(
            "a.html",
            br#"x{{define "GET /items/{id}"}}item={{.Req.PathValue "id"}}{{end}}"# as &[u8],
        )],
    );
    let instance = build(dir.path());

    let reply = get(&instance, "GET", "/items/7");
    assert_eq!(body_string(reply), "item=7");
}

// =============================================================================
// Scenario: SSE stream
// =============================================================================

struct CaptureSink {
    pending: Vec<u8>,
    chunks: Vec<Vec<u8>>,
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl FlushSink for CaptureSink {
    fn flush_chunk(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            self.chunks.push(std::mem::take(&mut self.pending));
        }
        Ok(())
    }
}

#[test]
fn sse_route_streams_flushed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[(
            "sse.html",
            b"{{define \"SSE /events\"}}data: hi\n\n{{.Flush}}{{end}}" as &[u8],
        )],
    );
    let instance = build(dir.path());

    let mut req = RequestCx::new("GET", "/events");
    req.headers
        .push(("Accept".to_string(), "text/event-stream".to_string()));

    let (template, req) = match dispatch(&instance, req) {
        Dispatch::Stream { template, req } => (template, req),
        Dispatch::Reply(reply) => panic!("expected stream, got status {}", reply.status),
    };

    // the adapter sends these before executing
    let headers = sse_headers();
    assert!(headers
        .iter()
        .any(|(k, v)| k == "Content-Type" && v == "text/event-stream"));
    assert!(headers.iter().any(|(k, _)| k == "Cache-Control"));

    let sink = Rc::new(RefCell::new(CaptureSink {
        pending: Vec::new(),
        chunks: Vec::new(),
    }));
    run_stream(
        &instance,
        req,
        &template,
        sink.clone(),
        CancelPair::default(),
    );

    let sink = sink.borrow();
    assert_eq!(sink.chunks[0], b"data: hi\n\n");
}

#[test]
fn sse_without_accept_header_is_406() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[("sse.html", br#"{{define "SSE /events"}}x{{end}}"# as &[u8])],
    );
    let instance = build(dir.path());

    let reply = get(&instance, "GET", "/events");
    assert_eq!(reply.status, 406);
}

// =============================================================================
// Scenario: failed template rolls back its transaction
// =============================================================================

#[test]
fn failed_template_rolls_back_writes() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[(
            "api.html",
            br#"page{{define "INIT schema"}}{{.Exec "CREATE TABLE IF NOT EXISTS notes (body TEXT)"}}{{end}}{{define "POST /fail"}}{{.Exec "INSERT INTO notes VALUES ('doomed')"}}{{failf "later failure"}}{{end}}{{define "POST /ok"}}{{.Exec "INSERT INTO notes VALUES ('kept')"}}saved{{end}}"#
                as &[u8],
        )],
    );
    let config = Config {
        template_dir: dir.path().to_path_buf(),
        db: Some(dir.path().join("app.db")),
        watch: false,
        ..Config::default()
    };
    let instance = Instance::build(&config).unwrap();
    let db = instance.db.clone().unwrap();

    // failure path: 500, write rolled back
    let reply = get(&instance, "POST", "/fail");
    assert_eq!(reply.status, 500);
    let rows = db.query("SELECT count(*) AS n FROM notes", &[]).unwrap();
    assert_eq!(rows[0].get("n").unwrap().to_string(), "0");

    // success path: committed
    let reply = get(&instance, "POST", "/ok");
    assert_eq!(reply.status, 200);
    let rows = db.query("SELECT body FROM notes", &[]).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("body").unwrap().to_string(), "kept");
}

// =============================================================================
// Scenario: reload
// =============================================================================

#[test]
fn reload_swaps_atomically_and_cancels_retired_instance() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("index.html", b"first")]);
    let config = Config {
        template_dir: dir.path().to_path_buf(),
        watch: false,
        ..Config::default()
    };
    let supervisor = Supervisor::new(config).unwrap();

    // a request in flight holds the old instance across the reload
    let in_flight = supervisor.instance();

    write_tree(dir.path(), &[("index.html", b"second")]);
    supervisor.reload().unwrap();

    // the held instance still serves its own namespace
    let tree = in_flight.namespace.get("/index.html").unwrap();
    let mut out = Vec::new();
    in_flight
        .executor()
        .execute(tree, &xtemplate::tmpl::Value::Null, &mut out)
        .unwrap();
    assert_eq!(out, b"first");
    assert!(in_flight.is_cancelled());

    // the next request lands on the new instance
    let reply = get(&supervisor.instance(), "GET", "/");
    assert_eq!(body_string(reply), "second");
}

// =============================================================================
// Boundary behaviours
// =============================================================================

#[test]
fn hidden_template_is_invokable_but_not_routed() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            (".layout.html", b"<b>{{.}}</b>" as &[u8]),
            (
                "page.html",
                br#"{{.X.Template "/.layout.html" "body"}}"# as &[u8],
            ),
        ],
    );
    let instance = build(dir.path());

    assert_eq!(get(&instance, "GET", "/.layout").status, 404);
    assert_eq!(get(&instance, "GET", "/.layout.html").status, 404);

    let reply = get(&instance, "GET", "/page");
    assert_eq!(body_string(reply), "<b>body</b>");
}

#[test]
fn route_definitions_inside_hidden_files_are_routed() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[(
            ".api.html",
            br#"{{define "GET /from-hidden"}}ok{{end}}"# as &[u8],
        )],
    );
    let instance = build(dir.path());

    let reply = get(&instance, "GET", "/from-hidden");
    assert_eq!(reply.status, 200);
    assert_eq!(body_string(reply), "ok");
}

#[test]
fn nested_index_routes_to_directory_path() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("docs/index.html", b"docs home")]);
    let instance = build(dir.path());

    assert_eq!(body_string(get(&instance, "GET", "/docs/")), "docs home");
    assert_eq!(get(&instance, "GET", "/docs/deeper").status, 404);
}

#[test]
fn user_config_reaches_templates() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[("a.html", br#"{{.X.Config "greeting"}}"# as &[u8])],
    );
    let mut config = Config {
        template_dir: dir.path().to_path_buf(),
        watch: false,
        ..Config::default()
    };
    config
        .user
        .insert("greeting".to_string(), "salut".to_string());
    let instance = Instance::build(&config).unwrap();

    assert_eq!(body_string(get(&instance, "GET", "/a")), "salut");
}

#[test]
fn static_file_hash_links() {
    let dir = tempfile::tempdir().unwrap();
    write_tree(
        dir.path(),
        &[
            ("app.css", b"h1 { color: teal }" as &[u8]),
            (
                "a.html",
                br#"{{.X.StaticFileHash "/app.css"}}"# as &[u8],
            ),
        ],
    );
    let instance = build(dir.path());

    let hash = body_string(get(&instance, "GET", "/a"));
    assert!(hash.starts_with("sha384-"));

    // the emitted hash gates the cache-busting URL
    let reply = get(
        &instance,
        "GET",
        &format!("/app.css?hash={}", &hash[..40]),
    );
    assert_eq!(reply.status, 200);
    assert!(header(&reply, "Cache-Control").is_some());
}
