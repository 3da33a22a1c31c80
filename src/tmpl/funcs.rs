//! Built-in template functions.
//!
//! Every name here is pre-registered before parsing so templates referencing
//! them resolve at build time; user function maps merge over these at
//! instance construction.

use super::error::{ExecError, ExecResult};
use super::exec::{Func, Funcs};
use super::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Construct the built-in function map.
pub fn builtin_funcs() -> Funcs {
    let mut funcs = Funcs::default();

    register(&mut funcs, "and", |args| {
        let mut last = Value::Bool(true);
        for arg in args {
            if !arg.truthy() {
                return Ok(arg.clone());
            }
            last = arg.clone();
        }
        Ok(last)
    });

    register(&mut funcs, "or", |args| {
        for arg in args {
            if arg.truthy() {
                return Ok(arg.clone());
            }
        }
        Ok(args.last().cloned().unwrap_or(Value::Bool(false)))
    });

    register(&mut funcs, "not", |args| {
        Ok(Value::Bool(!one(args, "not")?.truthy()))
    });

    register(&mut funcs, "len", |args| {
        let v = one(args, "len")?;
        v.len()
            .map(|n| Value::Int(n as i64))
            .ok_or_else(|| ExecError::Failure(format!("len of {}", v.type_name())))
    });

    register(&mut funcs, "index", |args| {
        let (base, keys) = args
            .split_first()
            .ok_or_else(|| ExecError::Failure("index: missing operand".to_string()))?;
        let mut v = base.clone();
        for key in keys {
            v = v.index(key)?;
        }
        Ok(v)
    });

    register(&mut funcs, "print", |args| {
        Ok(Value::Str(join_args(args, "")))
    });

    register(&mut funcs, "println", |args| {
        Ok(Value::Str(join_args(args, " ") + "\n"))
    });

    register(&mut funcs, "printf", |args| {
        let (format, rest) = args
            .split_first()
            .ok_or_else(|| ExecError::Failure("printf: missing format".to_string()))?;
        let Value::Str(format) = format else {
            return Err(ExecError::Failure("printf: format must be a string".to_string()));
        };
        sprintf(format, rest).map(Value::Str)
    });

    register(&mut funcs, "html", |args| {
        Ok(Value::Str(escape_html(&join_args(args, ""))))
    });

    register(&mut funcs, "urlquery", |args| {
        Ok(Value::Str(escape_query(&join_args(args, ""))))
    });

    register(&mut funcs, "upper", |args| {
        Ok(Value::Str(one(args, "upper")?.to_string().to_uppercase()))
    });

    register(&mut funcs, "lower", |args| {
        Ok(Value::Str(one(args, "lower")?.to_string().to_lowercase()))
    });

    register(&mut funcs, "trim", |args| {
        Ok(Value::Str(one(args, "trim")?.to_string().trim().to_string()))
    });

    register(&mut funcs, "default", |args| {
        // default fallback value: {{.Maybe | default "none"}}
        match args {
            [fallback, v] => Ok(if v.truthy() { v.clone() } else { fallback.clone() }),
            _ => Err(ExecError::Failure("default: want 2 arguments".to_string())),
        }
    });

    register_cmp(&mut funcs, "eq", |ord| ord == Ordering::Equal);
    register_cmp(&mut funcs, "ne", |ord| ord != Ordering::Equal);
    register_cmp(&mut funcs, "lt", |ord| ord == Ordering::Less);
    register_cmp(&mut funcs, "le", |ord| ord != Ordering::Greater);
    register_cmp(&mut funcs, "gt", |ord| ord == Ordering::Greater);
    register_cmp(&mut funcs, "ge", |ord| ord != Ordering::Less);

    // control-flow sentinels
    register(&mut funcs, "return", |_args| Err(ExecError::Return));

    register(&mut funcs, "redirect", |args| {
        let (status, location) = match args {
            [Value::Str(loc)] => (303, loc.clone()),
            [status, Value::Str(loc)] => {
                let n = status
                    .as_int()
                    .filter(|n| (300..=399).contains(n))
                    .ok_or_else(|| {
                        ExecError::Failure("redirect: want a 3xx status code".to_string())
                    })?;
                (n as u16, loc.clone())
            }
            _ => {
                return Err(ExecError::Failure(
                    "redirect: want [status] location".to_string(),
                ))
            }
        };
        Err(ExecError::Handler(super::error::HandlerAction::Redirect {
            status,
            location,
        }))
    });

    register(&mut funcs, "failf", |args| {
        let (format, rest) = args
            .split_first()
            .ok_or_else(|| ExecError::Failure("failf: missing format".to_string()))?;
        let Value::Str(format) = format else {
            return Err(ExecError::Failure("failf: format must be a string".to_string()));
        };
        Err(ExecError::Failure(sprintf(format, rest)?))
    });

    // minimum hooks for content helpers; real implementations may be
    // contributed through the user function map
    register(&mut funcs, "markdown", |args| {
        Ok(Value::Str(join_args(args, "")))
    });
    register(&mut funcs, "sanitizeHtml", |args| {
        Ok(Value::Str(escape_html(&join_args(args, ""))))
    });

    funcs
}

fn register(funcs: &mut Funcs, name: &str, f: fn(&[Value]) -> ExecResult<Value>) {
    funcs.insert(name.to_string(), Arc::new(f) as Func);
}

fn register_cmp(funcs: &mut Funcs, name: &'static str, accept: fn(Ordering) -> bool) {
    let f: Func = Arc::new(move |args: &[Value]| {
        let [a, b] = args else {
            return Err(ExecError::Failure(format!("{name}: want 2 arguments")));
        };
        // eq/ne admit any pair; ordering comparisons require comparable types
        if name == "eq" {
            return Ok(Value::Bool(a.equals(b)));
        }
        if name == "ne" {
            return Ok(Value::Bool(!a.equals(b)));
        }
        let ord = a.compare(b).ok_or_else(|| {
            ExecError::Failure(format!(
                "{name}: can't compare {} with {}",
                a.type_name(),
                b.type_name()
            ))
        })?;
        Ok(Value::Bool(accept(ord)))
    });
    funcs.insert(name.to_string(), f);
}

fn one<'v>(args: &'v [Value], name: &str) -> ExecResult<&'v Value> {
    match args {
        [v] => Ok(v),
        _ => Err(ExecError::Failure(format!("{name}: want 1 argument"))),
    }
}

fn join_args(args: &[Value], sep: &str) -> String {
    args.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

/// Minimal printf supporting the verbs templates actually use:
/// %v %s %d %f %q %x and %%.
fn sprintf(format: &str, args: &[Value]) -> ExecResult<String> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut next = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let verb = chars
            .next()
            .ok_or_else(|| ExecError::Failure("printf: trailing %".to_string()))?;
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args
            .get(next)
            .ok_or_else(|| ExecError::Failure(format!("printf: missing argument for %{verb}")))?;
        next += 1;
        match verb {
            'v' | 's' => out.push_str(&arg.to_string()),
            'd' => {
                let n = arg
                    .as_int()
                    .ok_or_else(|| ExecError::Failure(format!("printf: %d on {}", arg.type_name())))?;
                out.push_str(&n.to_string());
            }
            'f' => match arg {
                Value::Float(f) => out.push_str(&format!("{f:.6}")),
                Value::Int(n) => out.push_str(&format!("{:.6}", *n as f64)),
                other => {
                    return Err(ExecError::Failure(format!(
                        "printf: %f on {}",
                        other.type_name()
                    )))
                }
            },
            'q' => out.push_str(&format!("{:?}", arg.to_string())),
            'x' => {
                let n = arg
                    .as_int()
                    .ok_or_else(|| ExecError::Failure(format!("printf: %x on {}", arg.type_name())))?;
                out.push_str(&format!("{n:x}"));
            }
            other => {
                return Err(ExecError::Failure(format!("printf: unknown verb %{other}")));
            }
        }
    }
    Ok(out)
}

/// Escape HTML metacharacters.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode a query component.
fn escape_query(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> ExecResult<Value> {
        let funcs = builtin_funcs();
        funcs.get(name).unwrap()(args)
    }

    #[test]
    fn test_and_or_not() {
        assert!(call("and", &[Value::Bool(true), Value::Int(1)]).unwrap().truthy());
        assert!(!call("and", &[Value::Bool(true), Value::Int(0)]).unwrap().truthy());
        assert!(call("or", &[Value::Bool(false), Value::str("x")]).unwrap().truthy());
        assert!(!call("not", &[Value::Int(1)]).unwrap().truthy());
    }

    #[test]
    fn test_comparisons() {
        assert!(call("eq", &[Value::Int(2), Value::Float(2.0)]).unwrap().truthy());
        assert!(call("ne", &[Value::str("a"), Value::str("b")]).unwrap().truthy());
        assert!(call("lt", &[Value::Int(1), Value::Int(2)]).unwrap().truthy());
        assert!(call("ge", &[Value::Int(2), Value::Int(2)]).unwrap().truthy());
        assert!(call("lt", &[Value::str("a"), Value::Int(2)]).is_err());
    }

    #[test]
    fn test_len_and_index() {
        let list = Value::list(vec![Value::str("a"), Value::str("b")]);
        assert!(call("len", &[list.clone()])
            .unwrap()
            .equals(&Value::Int(2)));
        assert!(call("index", &[list, Value::Int(1)])
            .unwrap()
            .equals(&Value::str("b")));
    }

    #[test]
    fn test_printf() {
        assert_eq!(
            call("printf", &[Value::str("%s=%d"), Value::str("n"), Value::Int(7)])
                .unwrap()
                .to_string(),
            "n=7"
        );
        assert_eq!(
            call("printf", &[Value::str("100%%")]).unwrap().to_string(),
            "100%"
        );
        assert!(call("printf", &[Value::str("%d"), Value::str("abc")]).is_err());
    }

    #[test]
    fn test_escapes() {
        assert_eq!(escape_html("<a href=\"x\">"), "&lt;a href=&#34;x&#34;&gt;");
        assert_eq!(escape_query("a b&c"), "a+b%26c");
    }

    #[test]
    fn test_return_raises_sentinel() {
        assert!(matches!(call("return", &[]), Err(ExecError::Return)));
    }

    #[test]
    fn test_redirect_raises_handler() {
        use crate::tmpl::error::HandlerAction;
        match call("redirect", &[Value::str("/next")]) {
            Err(ExecError::Handler(HandlerAction::Redirect { status, location })) => {
                assert_eq!(status, 303);
                assert_eq!(location, "/next");
            }
            other => panic!("expected handler, got {other:?}"),
        }
        assert!(call("redirect", &[Value::Int(200), Value::str("/x")]).is_err());
    }

    #[test]
    fn test_failf() {
        match call("failf", &[Value::str("bad %s"), Value::str("thing")]) {
            Err(ExecError::Failure(msg)) => assert_eq!(msg, "bad thing"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_default() {
        assert!(call("default", &[Value::str("fallback"), Value::Null])
            .unwrap()
            .equals(&Value::str("fallback")));
        assert!(call("default", &[Value::str("fallback"), Value::str("real")])
            .unwrap()
            .equals(&Value::str("real")));
    }
}
