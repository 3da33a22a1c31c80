//! Method+path route table.
//!
//! Patterns are `"METHOD /path"` strings where a path may contain
//! per-segment placeholders (`{name}`), end in `/` to match a whole
//! subtree, or end in `/{$}` to anchor exactly the directory path.
//! The most specific matching pattern wins; equal patterns are replaced by
//! later registrations.

use crate::log;
use rustc_hash::FxHashMap;

/// One path segment of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Lit(String),
    /// `{name}` placeholder capturing one segment.
    Param(String),
}

/// How the pattern treats the end of the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Match exactly these segments.
    Exact,
    /// Pattern ended in `/{$}`: match the directory path itself only.
    AnchoredDir,
    /// Pattern ended in `/`: match the directory and everything below it.
    Subtree,
}

/// A parsed route pattern.
#[derive(Debug, Clone)]
struct Pattern {
    method: Option<String>,
    segs: Vec<Seg>,
    tail: Tail,
}

/// A registered route.
#[derive(Debug, Clone)]
pub struct Route<T> {
    /// The original pattern string, `"METHOD /path"`.
    pub pattern: String,
    pub value: T,
    parsed: Pattern,
}

/// Captured `{name}` path values from a match.
pub type PathValues = Vec<(String, String)>;

/// The route table. `T` carries the bound handler description.
#[derive(Debug)]
pub struct RouteTable<T> {
    routes: Vec<Route<T>>,
    /// pattern string -> index, for later-wins replacement
    index: FxHashMap<String, usize>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        RouteTable {
            routes: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<T> RouteTable<T> {
    /// Register a pattern. An equal pattern replaces the earlier
    /// registration with a warning; that is how later template definitions
    /// override earlier ones.
    pub fn register(&mut self, pattern: &str, value: T) {
        let parsed = match parse_pattern(pattern) {
            Some(p) => p,
            None => {
                log!("warn"; "ignoring unparsable route pattern '{}'", pattern);
                return;
            }
        };
        if let Some(&at) = self.index.get(pattern) {
            log!("warn"; "route pattern '{}' registered twice, later definition wins", pattern);
            self.routes[at] = Route {
                pattern: pattern.to_string(),
                value,
                parsed,
            };
            return;
        }
        self.index.insert(pattern.to_string(), self.routes.len());
        self.routes.push(Route {
            pattern: pattern.to_string(),
            value,
            parsed,
        });
    }

    /// Look up the best route for a request. Returns the route and the
    /// captured path values.
    pub fn lookup(&self, method: &str, path: &str) -> Option<(&Route<T>, PathValues)> {
        let segs = split_path(path);
        let trailing_slash = path.ends_with('/') && path != "/";
        let mut best: Option<(&Route<T>, PathValues, Specificity)> = None;

        for route in &self.routes {
            let values = match match_pattern(&route.parsed, method, &segs, trailing_slash, path) {
                Some(v) => v,
                None => continue,
            };
            let spec = specificity(&route.parsed);
            let better = match &best {
                None => true,
                Some((_, _, best_spec)) => spec > *best_spec,
            };
            if better {
                best = Some((route, values, spec));
            }
        }
        best.map(|(route, values, _)| (route, values))
    }

    /// All registered routes in registration order.
    pub fn routes(&self) -> &[Route<T>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Precedence key: higher compares greater. Explicit method beats wildcard;
/// anchored/exact beats subtree; more literal segments beats fewer; longer
/// patterns beat shorter.
type Specificity = (bool, bool, usize, usize);

fn specificity(p: &Pattern) -> Specificity {
    let literals = p.segs.iter().filter(|s| matches!(s, Seg::Lit(_))).count();
    (
        p.method.is_some(),
        p.tail != Tail::Subtree,
        literals,
        p.segs.len(),
    )
}

/// Parse a `"METHOD /path"` or `"/path"` pattern string.
fn parse_pattern(pattern: &str) -> Option<Pattern> {
    let (method, path) = match pattern.split_once(' ') {
        Some((m, p)) if !m.is_empty() => (Some(m.to_string()), p),
        _ => (None, pattern),
    };
    if !path.starts_with('/') {
        return None;
    }

    let mut segs = Vec::new();
    let mut tail = if path.ends_with('/') && path != "/" {
        Tail::Subtree
    } else if path == "/" {
        Tail::Subtree
    } else {
        Tail::Exact
    };

    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "{$}" {
            tail = Tail::AnchoredDir;
            continue;
        }
        if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            segs.push(Seg::Param(name.to_string()));
        } else {
            segs.push(Seg::Lit(part.to_string()));
        }
    }
    Some(Pattern { method, segs, tail })
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Match one pattern against a request. `SSE` routes are registered as
/// `GET`, so method comparison here is plain equality (HEAD is admitted to
/// GET routes, per the usual file-serving convention).
fn match_pattern(
    pattern: &Pattern,
    method: &str,
    segs: &[&str],
    trailing_slash: bool,
    raw_path: &str,
) -> Option<PathValues> {
    if let Some(m) = &pattern.method {
        let method_matches = m == method || (m == "GET" && method == "HEAD");
        if !method_matches {
            return None;
        }
    }

    match pattern.tail {
        Tail::Exact => {
            if segs.len() != pattern.segs.len() {
                return None;
            }
            // an exact pattern doesn't match the directory form of the path
            if trailing_slash && !pattern.segs.is_empty() {
                return None;
            }
            capture(&pattern.segs, segs)
        }
        Tail::AnchoredDir => {
            // matches only the directory path itself: /a/b/ (or / for root)
            if segs.len() != pattern.segs.len() {
                return None;
            }
            if !trailing_slash && raw_path != "/" {
                return None;
            }
            capture(&pattern.segs, segs)
        }
        Tail::Subtree => {
            if segs.len() < pattern.segs.len() {
                return None;
            }
            // the bare directory path without its slash is not in the subtree
            if segs.len() == pattern.segs.len() && !trailing_slash && raw_path != "/" {
                return None;
            }
            capture(&pattern.segs, &segs[..pattern.segs.len()])
        }
    }
}

fn capture(pattern: &[Seg], segs: &[&str]) -> Option<PathValues> {
    let mut values = PathValues::new();
    for (p, s) in pattern.iter().zip(segs) {
        match p {
            Seg::Lit(lit) => {
                if lit != s {
                    return None;
                }
            }
            Seg::Param(name) => values.push((name.clone(), (*s).to_string())),
        }
    }
    Some(values)
}
