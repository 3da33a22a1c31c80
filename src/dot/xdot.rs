//! Instance provider (`.X`).
//!
//! Read-only window into the current instance: static file hashes for
//! cache-busting links, the user config map, the function list, and
//! by-name template invocation.

use crate::build::assets::clean_url_path;
use crate::server::instance::Instance;
use crate::tmpl::{ExecError, Map, Object, Value};
use std::sync::Arc;

pub struct XDot {
    instance: Arc<Instance>,
}

impl XDot {
    pub fn new(instance: Arc<Instance>) -> Self {
        XDot { instance }
    }
}

impl Object for XDot {
    fn type_name(&self) -> &'static str {
        "x"
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "Instance" => Some(Value::Int(self.instance.id as i64)),
            "Config" => {
                let mut m = Map::new();
                for (k, v) in &self.instance.config.user {
                    m.insert(k.clone(), Value::str(v.clone()));
                }
                Some(Value::map(m))
            }
            _ => None,
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        match method {
            // SRI hash of a static entry, for integrity attributes and
            // ?hash= cache-busting links
            "StaticFileHash" => Some((|| {
                let path = args
                    .first()
                    .map(|v| v.to_string())
                    .ok_or_else(|| ExecError::Failure("StaticFileHash: missing path".to_string()))?;
                let clean = clean_url_path(&path);
                self.instance
                    .files
                    .get(&clean)
                    .map(|f| Value::str(f.hash.clone()))
                    .ok_or_else(|| {
                        ExecError::Failure(format!("StaticFileHash: no static file at '{clean}'"))
                    })
            })()),

            "Config" => Some((|| {
                let key = args
                    .first()
                    .map(|v| v.to_string())
                    .ok_or_else(|| ExecError::Failure("Config: missing key".to_string()))?;
                Ok(match self.instance.config.user.get(&key) {
                    Some(v) => Value::str(v.clone()),
                    None => Value::Null,
                })
            })()),

            "Funcs" => Some(Ok({
                let mut names: Vec<String> = self.instance.funcs.keys().cloned().collect();
                names.sort();
                Value::list(names.into_iter().map(Value::Str).collect())
            })),

            // invoke another template by name, capturing its output
            "Template" => Some((|| {
                let name = args
                    .first()
                    .map(|v| v.to_string())
                    .ok_or_else(|| ExecError::Failure("Template: missing name".to_string()))?;
                let dot = args.get(1).cloned().unwrap_or(Value::Null);
                self.instance
                    .executor()
                    .execute_to_string(&name, &dot)
                    .map(Value::Str)
            })()),

            _ => None,
        }
    }
}
