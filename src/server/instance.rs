//! Immutable instance assembly.
//!
//! One build walks the template root, loads static files and templates,
//! registers routes, runs the `INIT ` templates, and freezes the result
//! behind an `Arc`. Instances are never mutated; reload builds a new one
//! and retires the old by cancelling its lifecycle token.

use crate::build::scan::walk_files;
use crate::build::templates::load_template_file;
use crate::build::{DerivedRoute, FileInfo, RouteKind, StaticSet};
use crate::config::Config;
use crate::dot::sql::SqlHandle;
use crate::dot::Dot;
use crate::server::router::RouteTable;
use crate::tmpl::funcs::builtin_funcs;
use crate::tmpl::{Executor, Funcs, Namespace};
use crate::{debug, log};
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-wide monotonic instance id, to tell concurrent instances apart
/// in logs.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Summary counters from one build.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub routes: usize,
    pub template_files: usize,
    pub template_definitions: usize,
    pub template_initializers: usize,
    pub static_files: usize,
    pub static_file_encodings: usize,
}

/// A configured, immutable request handler ready to execute templates and
/// serve static files.
pub struct Instance {
    pub config: Config,
    pub id: u64,
    pub routes: RouteTable<DerivedRoute>,
    pub namespace: Namespace,
    pub files: FxHashMap<String, FileInfo>,
    pub funcs: Funcs,
    pub db: Option<SqlHandle>,
    pub stats: Stats,
    /// Lifecycle token; set when the instance is retired.
    pub cancel: Arc<AtomicBool>,
}

impl Instance {
    /// Build an instance from a config snapshot. Every failure here is
    /// fatal to the build; no partial instance is ever exposed.
    pub fn build(config: &Config) -> Result<Arc<Instance>> {
        let start = Instant::now();
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed) + 1;
        log!("build"; "initializing instance {}", id);

        let funcs = builtin_funcs();
        let func_names: FxHashSet<String> = funcs.keys().cloned().collect();

        let db = match &config.db {
            Some(path) => Some(SqlHandle::open(path)?),
            None => None,
        };

        let mut namespace = Namespace::default();
        let mut statics = StaticSet::default();
        let mut routes: RouteTable<DerivedRoute> = RouteTable::default();
        let mut stats = Stats::default();

        let files = walk_files(&config.template_dir)
            .with_context(|| format!("error scanning {}", config.template_dir.display()))?;

        for rel in &files {
            let is_template = rel.ends_with(&config.template_ext) && !config.template_ext.is_empty();
            if is_template {
                let load = load_template_file(
                    &config.template_dir,
                    rel,
                    &config.template_ext,
                    &config.ldelim,
                    &config.rdelim,
                    config.minify,
                    &func_names,
                )?;
                stats.template_files += 1;
                for tree in load.trees {
                    if namespace.contains_key(&tree.name) {
                        log!("warn"; "overriding template '{}' with definition from {}", tree.name, load.identity_path);
                    }
                    namespace.insert(tree.name.clone(), Arc::new(tree));
                    stats.template_definitions += 1;
                }
                for route in load.routes {
                    debug!("build"; "added route {} -> template '{}'", route.pattern, route.target);
                    let pattern = route.pattern.clone();
                    routes.register(&pattern, route);
                    stats.routes += 1;
                }
            } else if let Some(identity) = statics.add_file(&config.template_dir, rel)? {
                let pattern = format!("GET {identity}");
                debug!("build"; "added route {} -> static file", pattern);
                routes.register(
                    &pattern.clone(),
                    DerivedRoute {
                        pattern,
                        kind: RouteKind::Static,
                        target: identity,
                    },
                );
                stats.routes += 1;
                stats.static_files += 1;
            } else {
                stats.static_file_encodings += 1;
            }
        }

        stats.template_initializers = namespace
            .keys()
            .filter(|name| name.starts_with("INIT "))
            .count();

        let instance = Arc::new(Instance {
            config: config.clone(),
            id,
            routes,
            namespace,
            files: statics.files,
            funcs,
            db,
            stats,
            cancel: Arc::new(AtomicBool::new(false)),
        });

        run_initializers(&instance)?;

        log!(
            "build";
            "instance {} loaded in {:?}: {} routes, {} template files, {} definitions, {} initializers, {} static files, {} alternate encodings",
            instance.id,
            start.elapsed(),
            instance.stats.routes,
            instance.stats.template_files,
            instance.stats.template_definitions,
            instance.stats.template_initializers,
            instance.stats.static_files,
            instance.stats.static_file_encodings
        );
        Ok(instance)
    }

    /// Retire the instance: in-flight streams observe this and exit.
    pub fn cancel(&self) {
        log!("serve"; "instance {} cancelled", self.id);
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn executor(&self) -> Executor<'_> {
        Executor::new(&self.namespace, &self.funcs)
    }
}

/// Execute every template whose name begins with `INIT `, once, against the
/// minimal dot. Output is discarded; failures abort the build.
fn run_initializers(instance: &Arc<Instance>) -> Result<()> {
    let mut init_names: Vec<&String> = instance
        .namespace
        .keys()
        .filter(|name| name.starts_with("INIT "))
        .collect();
    init_names.sort();

    for name in init_names {
        debug!("build"; "running initializer '{}'", name);
        let dot = Rc::new(Dot::init(instance));
        let value = dot.value();
        let tree = instance.namespace.get(name).expect("listed above");
        let result = instance
            .executor()
            .execute(tree, &value, &mut std::io::sink());

        let outcome = crate::server::handlers::classify(result);
        let commit = outcome.is_success();
        dot.finalize(commit)
            .with_context(|| format!("template initializer '{name}' failed to finalize"))?;
        if !commit {
            anyhow::bail!(
                "template initializer '{}' failed: {}",
                name,
                outcome.describe()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &std::path::Path) -> Config {
        Config {
            template_dir: dir.to_path_buf(),
            watch: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_build_registers_routes_and_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();

        let instance = Instance::build(&config_for(dir.path())).unwrap();
        assert_eq!(instance.stats.template_files, 1);
        assert_eq!(instance.stats.static_files, 1);
        assert_eq!(instance.stats.routes, 2);
        assert!(instance.namespace.contains_key("/index.html"));
        assert!(instance.files.contains_key("/style.css"));
        assert!(instance.routes.lookup("GET", "/").is_some());
        assert!(instance.routes.lookup("GET", "/style.css").is_some());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), "a").unwrap();
        let first = Instance::build(&config_for(dir.path())).unwrap();
        let second = Instance::build(&config_for(dir.path())).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_hidden_template_loaded_not_routed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".partial.html"), "secret").unwrap();

        let instance = Instance::build(&config_for(dir.path())).unwrap();
        assert!(instance.namespace.contains_key("/.partial.html"));
        assert!(instance.routes.lookup("GET", "/.partial.html").is_none());
    }

    #[test]
    fn test_companion_without_identity_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        // valid gzip framing but different content
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut enc, b"other").unwrap();
        std::fs::write(dir.path().join("a.txt.gz"), enc.finish().unwrap()).unwrap();

        assert!(Instance::build(&config_for(dir.path())).is_err());
    }

    #[test]
    fn test_initializer_failure_aborts_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.html"),
            r#"{{define "INIT boom"}}{{failf "nope"}}{{end}}ok"#,
        )
        .unwrap();
        assert!(Instance::build(&config_for(dir.path())).is_err());
    }

    #[test]
    fn test_initializer_runs() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        std::fs::write(
            dir.path().join("a.html"),
            r#"{{define "INIT schema"}}{{.Exec "CREATE TABLE IF NOT EXISTS t (x)"}}{{end}}ok"#,
        )
        .unwrap();
        let mut config = config_for(dir.path());
        config.db = Some(db);

        let instance = Instance::build(&config).unwrap();
        let rows = instance
            .db
            .as_ref()
            .unwrap()
            .query("SELECT name FROM sqlite_master WHERE name = 't'", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
