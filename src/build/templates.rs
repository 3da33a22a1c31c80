//! Template file loader and route derivation.
//!
//! Each template file parses into one or more named trees. The file's own
//! tree may become a `GET` route at its extension-stripped path; `define`
//! blocks named `METHOD /path` become routes of their own; everything else
//! stays invokable by name only.

use crate::build::assets::clean_url_path;
use crate::build::minify::minify_html;
use crate::tmpl::{parse, Tree};
use anyhow::{Context, Result};
use regex::Regex;
use rustc_hash::FxHashSet;
use std::path::Path;
use std::sync::OnceLock;

/// How a derived route is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Execute into a buffer, flush atomically.
    Buffered,
    /// Execute with a flushing writer (server-sent events).
    Stream,
    /// Stream a static file with negotiation.
    Static,
}

/// A route derived during the build.
#[derive(Debug, Clone)]
pub struct DerivedRoute {
    /// `METHOD /path` pattern string.
    pub pattern: String,
    pub kind: RouteKind,
    /// Bind target: the template's namespace name, or the identity path
    /// for static routes.
    pub target: String,
}

/// Result of loading one template file.
pub struct TemplateFileLoad {
    /// Identity path of the source file (always a namespace entry).
    pub identity_path: String,
    pub trees: Vec<Tree>,
    pub routes: Vec<DerivedRoute>,
}

fn route_name_matcher() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^(GET|POST|PUT|PATCH|DELETE|SSE) (.*)$").expect("static regex"))
}

/// Read, optionally minify, and parse one template file; derive its routes.
pub fn load_template_file(
    root: &Path,
    rel: &str,
    template_ext: &str,
    ldelim: &str,
    rdelim: &str,
    minify: bool,
    func_names: &FxHashSet<String>,
) -> Result<TemplateFileLoad> {
    let abs = root.join(rel);
    let content = std::fs::read_to_string(&abs)
        .with_context(|| format!("could not read template file '{rel}'"))?;
    let content = if minify {
        minify_html(&content, ldelim, rdelim)
    } else {
        content
    };

    let identity_path = clean_url_path(rel);
    let trees = parse(&identity_path, &content, ldelim, rdelim, func_names)
        .with_context(|| format!("could not parse template file '{rel}'"))?;

    let mut routes = Vec::new();
    for tree in &trees {
        if let Some(route) = derive_route(&tree.name, &identity_path, template_ext) {
            routes.push(route);
        }
    }

    Ok(TemplateFileLoad {
        identity_path,
        trees,
        routes,
    })
}

/// Apply the routing rules to one template name.
///
/// Returns `None` for hidden files and for plain `define` names, which stay
/// invokable but unrouted.
pub fn derive_route(name: &str, identity_path: &str, template_ext: &str) -> Option<DerivedRoute> {
    if name == identity_path {
        // don't register routes to hidden files
        let base = identity_path.rsplit('/').next().unwrap_or("");
        if base.starts_with('.') {
            return None;
        }
        let mut route_path = identity_path
            .strip_suffix(template_ext)
            .unwrap_or(identity_path)
            .to_string();
        // files named 'index' handle requests to their directory
        if route_path.rsplit('/').next() == Some("index") {
            route_path.truncate(route_path.len() - "index".len());
        }
        if route_path.ends_with('/') {
            route_path.push_str("{$}");
        }
        return Some(DerivedRoute {
            pattern: format!("GET {route_path}"),
            kind: RouteKind::Buffered,
            target: name.to_string(),
        });
    }

    let caps = route_name_matcher().captures(name)?;
    let method = caps.get(1).expect("group 1").as_str();
    let path = caps.get(2).expect("group 2").as_str();
    if method == "SSE" {
        Some(DerivedRoute {
            pattern: format!("GET {path}"),
            kind: RouteKind::Stream,
            target: name.to_string(),
        })
    } else {
        Some(DerivedRoute {
            pattern: format!("{method} {path}"),
            kind: RouteKind::Buffered,
            target: name.to_string(),
        })
    }
}
