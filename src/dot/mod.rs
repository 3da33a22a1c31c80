//! The per-request root value ("dot").
//!
//! A [`Dot`] composes the configured providers: `X` (instance), `Req`,
//! `Resp` (buffered) or `Flush` (streaming), plus the optional context
//! filesystem and SQL providers. Providers are reachable two ways: as named
//! fields (`.Req.Method`, `.Resp.SetStatus`) and through ordered method
//! fallthrough, so `{{.QueryVal ...}}` resolves without naming its
//! provider.
//!
//! Each dot carries one finalize step that commits or rolls back the
//! pending SQL transaction exactly once; the executors call it on every
//! exit path.

pub mod flush;
pub mod fsdot;
pub mod req;
pub mod resp;
pub mod sql;
pub mod xdot;

use crate::server::instance::Instance;
use crate::server::request::{CancelPair, RequestCx};
use crate::tmpl::{ExecError, Object, Value};
use anyhow::Result;
use flush::{FlushDot, FlushSink};
use fsdot::FsDot;
use req::ReqDot;
use resp::RespDot;
use sql::SqlDot;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use xdot::XDot;

/// The composite per-request root value.
pub struct Dot {
    x: Rc<XDot>,
    req: Option<Rc<ReqDot>>,
    resp: Option<Rc<RespDot>>,
    flush: Option<Rc<FlushDot>>,
    fs: Option<Rc<FsDot>>,
    db: Option<Rc<SqlDot>>,
}

impl Dot {
    /// Dot for the buffered executor: `X`, `Req`, `Resp`, plus optional
    /// providers.
    pub fn buffered(instance: &Arc<Instance>, req: Rc<RequestCx>) -> Dot {
        Dot {
            x: Rc::new(XDot::new(instance.clone())),
            req: Some(Rc::new(ReqDot::new(req))),
            resp: Some(Rc::new(RespDot::default())),
            flush: None,
            fs: fs_provider(instance),
            db: db_provider(instance),
        }
    }

    /// Dot for the streaming executor: `Flush` replaces `Resp`.
    pub fn streaming(
        instance: &Arc<Instance>,
        req: Rc<RequestCx>,
        sink: Rc<RefCell<dyn FlushSink>>,
        cancel: CancelPair,
    ) -> Dot {
        Dot {
            x: Rc::new(XDot::new(instance.clone())),
            req: Some(Rc::new(ReqDot::new(req))),
            resp: None,
            flush: Some(Rc::new(FlushDot::new(sink, cancel))),
            fs: fs_provider(instance),
            db: db_provider(instance),
        }
    }

    /// Minimal dot for `INIT ` templates: no request, no response.
    pub fn init(instance: &Arc<Instance>) -> Dot {
        Dot {
            x: Rc::new(XDot::new(instance.clone())),
            req: None,
            resp: None,
            flush: None,
            fs: fs_provider(instance),
            db: db_provider(instance),
        }
    }

    /// The dot as a template value.
    pub fn value(self: &Rc<Self>) -> Value {
        let object: Rc<dyn Object> = self.clone();
        Value::Object(object)
    }

    /// Response control accumulated by the template, buffered dots only.
    pub fn response(&self) -> Option<(u16, Vec<(String, String)>)> {
        self.resp.as_ref().map(|r| r.take())
    }

    /// Finalize per-request side effects exactly once. `commit` reflects
    /// the execution outcome: normal completion, clean return, and handler
    /// hand-off commit; failures roll back.
    pub fn finalize(&self, commit: bool) -> Result<()> {
        match &self.db {
            Some(db) => db.finalize(commit),
            None => Ok(()),
        }
    }
}

fn fs_provider(instance: &Arc<Instance>) -> Option<Rc<FsDot>> {
    instance
        .config
        .context_dir
        .as_ref()
        .map(|root| Rc::new(FsDot::new(root.clone())))
}

fn db_provider(instance: &Arc<Instance>) -> Option<Rc<SqlDot>> {
    instance.db.as_ref().map(|h| Rc::new(SqlDot::new(h.clone())))
}

impl Object for Dot {
    fn type_name(&self) -> &'static str {
        "dot"
    }

    fn field(&self, name: &str) -> Option<Value> {
        fn provider<T: Object + 'static>(p: &Option<Rc<T>>) -> Option<Value> {
            p.clone().map(|p| {
                let object: Rc<dyn Object> = p;
                Value::Object(object)
            })
        }
        match name {
            "X" => Some(Value::Object(self.x.clone())),
            "Req" => provider(&self.req),
            "Resp" => provider(&self.resp),
            "DB" => provider(&self.db),
            "FS" => provider(&self.fs),
            _ => None,
        }
    }

    /// Unknown top-level names fall through to the providers in order.
    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        if let Some(resp) = &self.resp {
            if let Some(result) = resp.call(method, args) {
                return Some(result);
            }
        }
        if let Some(flush) = &self.flush {
            if let Some(result) = flush.call(method, args) {
                return Some(result);
            }
        }
        if let Some(fs) = &self.fs {
            if let Some(result) = fs.call(method, args) {
                return Some(result);
            }
        }
        if let Some(db) = &self.db {
            if let Some(result) = db.call(method, args) {
                return Some(result);
            }
        }
        None
    }
}
