//! Template executor.
//!
//! Walks a parse tree against a dot value, writing output to an `io::Write`.
//! Control-flow sentinels ([`ExecError::Return`], [`ExecError::Handler`])
//! propagate out unchanged; only the request handlers interpret them.

use super::ast::{Branch, Command, Node, Pipeline, RangeNode, Term, Tree};
use super::error::{ExecError, ExecResult};
use super::value::Value;
use rustc_hash::FxHashMap;
use std::io::Write;
use std::sync::Arc;

/// Shared template namespace: every named tree parsed during the build.
pub type Namespace = FxHashMap<String, Arc<Tree>>;

/// A template function.
pub type Func = Arc<dyn Fn(&[Value]) -> ExecResult<Value> + Send + Sync>;

/// The effective function map.
pub type Funcs = FxHashMap<String, Func>;

/// Invoking templates recursively deeper than this aborts execution.
const MAX_DEPTH: usize = 100;

/// Template executor borrowing the instance's immutable namespace and funcs.
pub struct Executor<'a> {
    pub namespace: &'a Namespace,
    pub funcs: &'a Funcs,
}

/// Lexical variable scope ($x bindings).
struct Scope {
    vars: Vec<(String, Value)>,
}

impl Scope {
    fn new() -> Self {
        Scope { vars: Vec::new() }
    }

    fn mark(&self) -> usize {
        self.vars.len()
    }

    fn release(&mut self, mark: usize) {
        self.vars.truncate(mark);
    }

    fn declare(&mut self, name: &str, value: Value) {
        self.vars.push((name.to_string(), value));
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }
}

impl<'a> Executor<'a> {
    pub fn new(namespace: &'a Namespace, funcs: &'a Funcs) -> Self {
        Executor { namespace, funcs }
    }

    /// Execute a tree with the given dot, writing output to `out`.
    pub fn execute(&self, tree: &Tree, dot: &Value, out: &mut dyn Write) -> ExecResult<()> {
        let mut scope = Scope::new();
        self.walk(&tree.root, dot, &mut scope, out, &tree.name, 0)
    }

    /// Execute a tree by namespace name, capturing output as a string.
    /// Used by `{{.X.Template "name" value}}`.
    pub fn execute_to_string(&self, name: &str, dot: &Value) -> ExecResult<String> {
        let tree = self
            .namespace
            .get(name)
            .ok_or_else(|| ExecError::Failure(format!("no template named '{name}'")))?;
        let mut buf = Vec::new();
        self.execute(tree, dot, &mut buf)?;
        String::from_utf8(buf).map_err(|e| ExecError::Failure(e.to_string()))
    }

    fn walk(
        &self,
        nodes: &[Node],
        dot: &Value,
        scope: &mut Scope,
        out: &mut dyn Write,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<()> {
        for node in nodes {
            match node {
                Node::Text(t) => out.write_all(t.as_bytes())?,
                Node::Action(pipe) => {
                    let v = self.eval_pipeline(pipe, dot, scope, tmpl, depth)?;
                    // a pipeline that only declares variables emits nothing
                    if pipe.decls.is_empty() && !matches!(v, Value::Null) {
                        out.write_all(v.to_string().as_bytes())?;
                    }
                }
                Node::If(b) => self.walk_if(b, dot, scope, out, tmpl, depth)?,
                Node::With(b) => self.walk_with(b, dot, scope, out, tmpl, depth)?,
                Node::Range(r) => self.walk_range(r, dot, scope, out, tmpl, depth)?,
                Node::Template { name, pipe, line } => {
                    if depth >= MAX_DEPTH {
                        return Err(ExecError::fail(
                            tmpl,
                            *line,
                            format!("exceeded max template depth invoking '{name}'"),
                        ));
                    }
                    let tree = self.namespace.get(name).ok_or_else(|| {
                        ExecError::fail(tmpl, *line, format!("no template named '{name}'"))
                    })?;
                    let next_dot = match pipe {
                        Some(p) => self.eval_pipeline(p, dot, scope, tmpl, depth)?,
                        None => Value::Null,
                    };
                    let mut inner = Scope::new();
                    self.walk(&tree.root, &next_dot, &mut inner, out, name, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn walk_if(
        &self,
        b: &Branch,
        dot: &Value,
        scope: &mut Scope,
        out: &mut dyn Write,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<()> {
        let mark = scope.mark();
        let cond = self.eval_pipeline(&b.pipe, dot, scope, tmpl, depth)?;
        let branch = if cond.truthy() { &b.then } else { &b.else_ };
        let result = self.walk(branch, dot, scope, out, tmpl, depth);
        scope.release(mark);
        result
    }

    fn walk_with(
        &self,
        b: &Branch,
        dot: &Value,
        scope: &mut Scope,
        out: &mut dyn Write,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<()> {
        let mark = scope.mark();
        let v = self.eval_pipeline(&b.pipe, dot, scope, tmpl, depth)?;
        let result = if v.truthy() {
            self.walk(&b.then, &v, scope, out, tmpl, depth)
        } else {
            self.walk(&b.else_, dot, scope, out, tmpl, depth)
        };
        scope.release(mark);
        result
    }

    fn walk_range(
        &self,
        r: &RangeNode,
        dot: &Value,
        scope: &mut Scope,
        out: &mut dyn Write,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<()> {
        let v = self.eval_pipeline(&r.pipe, dot, scope, tmpl, depth)?;

        let items: Vec<(Value, Value)> = match &v {
            Value::List(l) => l
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                .collect(),
            Value::Map(m) => m
                .iter()
                .map(|(k, v)| (Value::str(k.clone()), v.clone()))
                .collect(),
            Value::Int(n) => (0..*n).map(|i| (Value::Int(i), Value::Int(i))).collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(ExecError::fail(
                    tmpl,
                    r.line,
                    format!("range can't iterate over {}", other.type_name()),
                ))
            }
        };

        if items.is_empty() {
            return self.walk(&r.else_, dot, scope, out, tmpl, depth);
        }

        for (key, item) in items {
            let mark = scope.mark();
            match r.decls.len() {
                1 => scope.declare(&r.decls[0], item.clone()),
                2 => {
                    scope.declare(&r.decls[0], key);
                    scope.declare(&r.decls[1], item.clone());
                }
                _ => {}
            }
            let result = self.walk(&r.body, &item, scope, out, tmpl, depth);
            scope.release(mark);
            result?;
        }
        Ok(())
    }

    /// Evaluate a pipeline: commands chained with `|`, the previous result
    /// appended as the final argument of the next command. Declared
    /// variables are bound into the current scope.
    fn eval_pipeline(
        &self,
        pipe: &Pipeline,
        dot: &Value,
        scope: &mut Scope,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<Value> {
        let mut prev: Option<Value> = None;
        for cmd in &pipe.cmds {
            prev = Some(self.eval_command(cmd, prev, dot, scope, tmpl, depth)?);
        }
        let value = prev.unwrap_or(Value::Null);
        for decl in &pipe.decls {
            scope.declare(decl, value.clone());
        }
        Ok(value)
    }

    fn eval_command(
        &self,
        cmd: &Command,
        prev: Option<Value>,
        dot: &Value,
        scope: &mut Scope,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<Value> {
        let line = cmd.line;
        let callee = &cmd.terms[0];

        // evaluate explicit arguments, then append the piped-in value
        let mut args = Vec::with_capacity(cmd.terms.len());
        for term in &cmd.terms[1..] {
            args.push(self.eval_term(term, dot, scope, tmpl, depth)?);
        }
        if let Some(p) = prev {
            args.push(p);
        }

        match callee {
            Term::Func(name) => {
                let func = self.funcs.get(name).ok_or_else(|| {
                    ExecError::fail(tmpl, line, format!("function '{name}' not defined"))
                })?;
                func(&args)
            }
            Term::Field(chain) => resolve_chain(dot.clone(), chain, &args, tmpl, line),
            Term::Var(name, chain) => {
                let base = scope.lookup(name).ok_or_else(|| {
                    ExecError::fail(tmpl, line, format!("undefined variable ${name}"))
                })?;
                resolve_chain(base, chain, &args, tmpl, line)
            }
            Term::Dot => {
                if args.is_empty() {
                    Ok(dot.clone())
                } else {
                    Err(ExecError::fail(tmpl, line, "can't give arguments to ."))
                }
            }
            Term::Paren(inner) => {
                if args.is_empty() {
                    self.eval_pipeline(inner, dot, scope, tmpl, depth)
                } else {
                    Err(ExecError::fail(
                        tmpl,
                        line,
                        "can't give arguments to a parenthesized pipeline",
                    ))
                }
            }
            lit => {
                if args.is_empty() {
                    self.eval_term(lit, dot, scope, tmpl, depth)
                } else {
                    Err(ExecError::fail(tmpl, line, "literal is not a function"))
                }
            }
        }
    }

    fn eval_term(
        &self,
        term: &Term,
        dot: &Value,
        scope: &mut Scope,
        tmpl: &str,
        depth: usize,
    ) -> ExecResult<Value> {
        Ok(match term {
            Term::Dot => dot.clone(),
            Term::Field(chain) => resolve_chain(dot.clone(), chain, &[], tmpl, 0)?,
            Term::Var(name, chain) => {
                let base = scope.lookup(name).ok_or_else(|| {
                    ExecError::fail(tmpl, 0, format!("undefined variable ${name}"))
                })?;
                resolve_chain(base, chain, &[], tmpl, 0)?
            }
            Term::Func(name) => {
                // argument-position function references evaluate with no args
                let func = self.funcs.get(name).ok_or_else(|| {
                    ExecError::fail(tmpl, 0, format!("function '{name}' not defined"))
                })?;
                func(&[])?
            }
            Term::Str(s) => Value::str(s.clone()),
            Term::Int(n) => Value::Int(*n),
            Term::Float(f) => Value::Float(*f),
            Term::Bool(b) => Value::Bool(*b),
            Term::Nil => Value::Null,
            Term::Paren(p) => self.eval_pipeline(p, dot, scope, tmpl, depth)?,
        })
    }
}

/// Resolve a field/method chain rooted at `base`. Only the final element
/// receives the command's arguments.
fn resolve_chain(
    mut base: Value,
    chain: &[String],
    args: &[Value],
    tmpl: &str,
    line: usize,
) -> ExecResult<Value> {
    if chain.is_empty() {
        if args.is_empty() {
            return Ok(base);
        }
        return Err(ExecError::fail(tmpl, line, "can't give arguments here"));
    }
    for (i, name) in chain.iter().enumerate() {
        let last = i + 1 == chain.len();
        let member_args = if last { args } else { &[] };
        base = resolve_member(&base, name, member_args, tmpl, line)?;
    }
    Ok(base)
}

fn resolve_member(
    v: &Value,
    name: &str,
    args: &[Value],
    tmpl: &str,
    line: usize,
) -> ExecResult<Value> {
    match v {
        Value::Map(m) => {
            if args.is_empty() {
                Ok(m.get(name).cloned().unwrap_or(Value::Null))
            } else {
                Err(ExecError::fail(
                    tmpl,
                    line,
                    format!("map entry '{name}' is not a method"),
                ))
            }
        }
        Value::Object(o) => {
            if args.is_empty() {
                if let Some(val) = o.field(name) {
                    return Ok(val);
                }
            }
            if let Some(result) = o.call(name, args) {
                return result;
            }
            Err(ExecError::fail(
                tmpl,
                line,
                format!("{} has no field or method '{name}'", o.type_name()),
            ))
        }
        other => Err(ExecError::fail(
            tmpl,
            line,
            format!("can't evaluate field '{name}' on {}", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpl::parse::parse;
    use crate::tmpl::value::{Map, Object};
    use rustc_hash::FxHashSet;
    use std::cell::Cell;
    use std::rc::Rc;

    fn funcs() -> Funcs {
        crate::tmpl::funcs::builtin_funcs()
    }

    fn func_names() -> FxHashSet<String> {
        funcs().keys().cloned().collect()
    }

    fn render(src: &str, dot: Value) -> Result<String, ExecError> {
        let trees = parse("/t.html", src, "{{", "}}", &func_names()).unwrap();
        let mut namespace = Namespace::default();
        for tree in trees {
            namespace.insert(tree.name.clone(), Arc::new(tree));
        }
        let funcs = funcs();
        let exec = Executor::new(&namespace, &funcs);
        let tree = namespace.get("/t.html").unwrap();
        let mut out = Vec::new();
        exec.execute(tree, &dot, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    fn map_dot(entries: &[(&str, Value)]) -> Value {
        let mut m = Map::new();
        for (k, v) in entries {
            m.insert(k.to_string(), v.clone());
        }
        Value::map(m)
    }

    #[test]
    fn test_text_and_field() {
        let dot = map_dot(&[("Name", Value::str("world"))]);
        assert_eq!(render("hello {{.Name}}", dot).unwrap(), "hello world");
    }

    #[test]
    fn test_if_else() {
        let dot = map_dot(&[("A", Value::Bool(false)), ("B", Value::Bool(true))]);
        assert_eq!(
            render("{{if .A}}a{{else if .B}}b{{else}}c{{end}}", dot).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_range_list() {
        let dot = map_dot(&[(
            "Items",
            Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        assert_eq!(render("{{range .Items}}[{{.}}]{{end}}", dot).unwrap(), "[1][2][3]");
    }

    #[test]
    fn test_range_decls_and_else() {
        let dot = map_dot(&[("Items", Value::list(vec![Value::str("a"), Value::str("b")]))]);
        assert_eq!(
            render("{{range $i, $v := .Items}}{{$i}}={{$v}};{{end}}", dot.clone()).unwrap(),
            "0=a;1=b;"
        );
        let empty = map_dot(&[("Items", Value::list(vec![]))]);
        assert_eq!(
            render("{{range .Items}}x{{else}}none{{end}}", empty).unwrap(),
            "none"
        );
    }

    #[test]
    fn test_with_rebinds_dot() {
        let inner = map_dot(&[("Name", Value::str("in"))]);
        let dot = map_dot(&[("Sub", inner)]);
        assert_eq!(render("{{with .Sub}}{{.Name}}{{end}}", dot).unwrap(), "in");
    }

    #[test]
    fn test_template_invocation() {
        let dot = map_dot(&[("Name", Value::str("x"))]);
        assert_eq!(
            render(
                r#"{{define "part"}}<{{.}}>{{end}}{{template "part" .Name}}"#,
                dot
            )
            .unwrap(),
            "<x>"
        );
    }

    #[test]
    fn test_pipeline_appends_prev() {
        assert_eq!(
            render(r#"{{"hi" | printf "%s!"}}"#, Value::Null).unwrap(),
            "hi!"
        );
    }

    #[test]
    fn test_variables() {
        assert_eq!(
            render("{{$x := 41}}{{printf \"%v\" $x}}", Value::Null).unwrap(),
            "41"
        );
    }

    struct Counter {
        n: Cell<i64>,
    }

    impl Object for Counter {
        fn type_name(&self) -> &'static str {
            "counter"
        }
        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "Value" => Some(Value::Int(self.n.get())),
                _ => None,
            }
        }
        fn call(&self, method: &str, args: &[Value]) -> Option<ExecResult<Value>> {
            match method {
                "Add" => {
                    let delta = args.first().and_then(|v| v.as_int()).unwrap_or(1);
                    self.n.set(self.n.get() + delta);
                    Some(Ok(Value::Null))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn test_object_field_and_method() {
        let counter = Rc::new(Counter { n: Cell::new(0) });
        let dot = Value::Object(counter.clone());
        assert_eq!(
            render("{{.Add 5}}{{.Add 2}}{{.Value}}", dot).unwrap(),
            "7"
        );
        assert_eq!(counter.n.get(), 7);
    }

    #[test]
    fn test_return_sentinel_propagates() {
        let err = render("before{{return}}after", Value::Null).unwrap_err();
        assert!(matches!(err, ExecError::Return));
    }

    #[test]
    fn test_failure_on_unknown_member() {
        let dot = map_dot(&[]);
        // missing map keys resolve to null, so drill into a non-container
        let err = render("{{.Missing.Deep}}", dot).unwrap_err();
        assert!(matches!(err, ExecError::Failure(_)));
    }

    #[test]
    fn test_recursion_limit() {
        let err = render(
            r#"{{define "loop"}}{{template "loop"}}{{end}}{{template "loop"}}"#,
            Value::Null,
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Failure(_)));
    }
}
