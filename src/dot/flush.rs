//! Streaming provider (`.Flush`, cancellation helpers).
//!
//! The streaming executor and this provider share one sink: the executor
//! writes template output into it, and `{{.Flush}}` forces what has
//! accumulated onto the wire. The provider also observes the joined
//! cancellation signal so event loops can exit when the client disconnects
//! or the instance is retired.

use crate::server::request::CancelPair;
use crate::tmpl::{ExecError, Object, Value};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

/// A writer that can push buffered output to the client on demand.
pub trait FlushSink: Write {
    fn flush_chunk(&mut self) -> std::io::Result<()>;
}

/// `io::Write` adapter handed to the executor; shares the sink with the
/// flush provider.
pub struct SharedSink(pub Rc<RefCell<dyn FlushSink>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

pub struct FlushDot {
    sink: Rc<RefCell<dyn FlushSink>>,
    cancel: CancelPair,
}

impl FlushDot {
    pub fn new(sink: Rc<RefCell<dyn FlushSink>>, cancel: CancelPair) -> Self {
        FlushDot { sink, cancel }
    }
}

impl Object for FlushDot {
    fn type_name(&self) -> &'static str {
        "flush"
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "Cancelled" => Some(Value::Bool(self.cancel.cancelled())),
            _ => None,
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        match method {
            "Flush" => Some(
                self.sink
                    .borrow_mut()
                    .flush_chunk()
                    .map(|_| Value::Null)
                    .map_err(ExecError::Io),
            ),
            // sleep in short slices, waking early on cancellation; returns
            // false when cancelled so loops can exit
            "Sleep" => {
                let ms = args.first().and_then(|v| v.as_int()).unwrap_or(0).max(0) as u64;
                let mut remaining = ms;
                while remaining > 0 {
                    if self.cancel.cancelled() {
                        return Some(Ok(Value::Bool(false)));
                    }
                    let slice = remaining.min(50);
                    std::thread::sleep(Duration::from_millis(slice));
                    remaining -= slice;
                }
                Some(Ok(Value::Bool(!self.cancel.cancelled())))
            }
            _ => None,
        }
    }
}
