//! xtemplate — an HTTP server engine that turns a directory tree of HTML
//! templates and static assets into a live web application.
//!
//! Build phase: scan the template root, hash and index static files with
//! their pre-compressed variants, parse templates into a shared namespace,
//! derive a route table, run `INIT ` templates, and freeze everything into
//! an immutable [`server::Instance`]. Serve phase: look up the route,
//! assemble a per-request dot, and execute the bound template (buffered or
//! streaming) or stream the negotiated static variant.

pub mod build;
pub mod config;
pub mod dot;
pub mod logger;
pub mod server;
pub mod state;
pub mod tmpl;
pub mod watch;
