//! Response-control provider (`.Resp`).
//!
//! Buffered executions only: status and headers accumulate here while the
//! template runs and are applied to the response after it completes, so a
//! `SetStatus` anywhere in the template takes effect.

use crate::tmpl::{ExecError, Object, Value};
use std::cell::{Cell, RefCell};

pub struct RespDot {
    status: Cell<u16>,
    headers: RefCell<Vec<(String, String)>>,
}

impl Default for RespDot {
    fn default() -> Self {
        RespDot {
            status: Cell::new(200),
            headers: RefCell::new(Vec::new()),
        }
    }
}

impl RespDot {
    /// Snapshot the accumulated response control for the handler.
    pub fn take(&self) -> (u16, Vec<(String, String)>) {
        (self.status.get(), self.headers.borrow().clone())
    }

    fn arg_str(args: &[Value], i: usize, method: &str) -> Result<String, ExecError> {
        args.get(i)
            .map(|v| v.to_string())
            .ok_or_else(|| ExecError::Failure(format!("{method}: missing argument {i}")))
    }

    fn arg_status(args: &[Value], method: &str) -> Result<u16, ExecError> {
        let n = args
            .first()
            .and_then(|v| v.as_int())
            .ok_or_else(|| ExecError::Failure(format!("{method}: want a status code")))?;
        if !(100..=599).contains(&n) {
            return Err(ExecError::Failure(format!("{method}: bad status code {n}")));
        }
        Ok(n as u16)
    }
}

impl Object for RespDot {
    fn type_name(&self) -> &'static str {
        "resp"
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        match method {
            "SetStatus" => Some(Self::arg_status(args, method).map(|s| {
                self.status.set(s);
                Value::Null
            })),
            "AddHeader" => Some((|| {
                let k = Self::arg_str(args, 0, method)?;
                let v = Self::arg_str(args, 1, method)?;
                self.headers.borrow_mut().push((k, v));
                Ok(Value::Null)
            })()),
            "SetHeader" => Some((|| {
                let k = Self::arg_str(args, 0, method)?;
                let v = Self::arg_str(args, 1, method)?;
                let mut headers = self.headers.borrow_mut();
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case(&k));
                headers.push((k, v));
                Ok(Value::Null)
            })()),
            "DelHeader" => Some((|| {
                let k = Self::arg_str(args, 0, method)?;
                self.headers
                    .borrow_mut()
                    .retain(|(name, _)| !name.eq_ignore_ascii_case(&k));
                Ok(Value::Null)
            })()),
            // set the status, then short-circuit cleanly
            "ReturnStatus" => Some(Self::arg_status(args, method).and_then(|s| {
                self.status.set(s);
                Err(ExecError::Return)
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(resp: &RespDot, method: &str, args: &[Value]) -> Result<Value, ExecError> {
        resp.call(method, args).expect("method exists")
    }

    #[test]
    fn test_status_default_and_set() {
        let resp = RespDot::default();
        assert_eq!(resp.take().0, 200);
        call(&resp, "SetStatus", &[Value::Int(204)]).unwrap();
        assert_eq!(resp.take().0, 204);
    }

    #[test]
    fn test_bad_status_rejected() {
        let resp = RespDot::default();
        assert!(call(&resp, "SetStatus", &[Value::Int(42)]).is_err());
        assert!(call(&resp, "SetStatus", &[Value::str("no")]).is_err());
    }

    #[test]
    fn test_header_mutation() {
        let resp = RespDot::default();
        call(&resp, "AddHeader", &[Value::str("X-A"), Value::str("1")]).unwrap();
        call(&resp, "AddHeader", &[Value::str("X-A"), Value::str("2")]).unwrap();
        assert_eq!(resp.take().1.len(), 2);

        call(&resp, "SetHeader", &[Value::str("x-a"), Value::str("3")]).unwrap();
        let (_, headers) = resp.take();
        assert_eq!(headers, vec![("x-a".to_string(), "3".to_string())]);

        call(&resp, "DelHeader", &[Value::str("X-A")]).unwrap();
        assert!(resp.take().1.is_empty());
    }

    #[test]
    fn test_return_status_short_circuits() {
        let resp = RespDot::default();
        let err = call(&resp, "ReturnStatus", &[Value::Int(403)]).unwrap_err();
        assert!(matches!(err, ExecError::Return));
        assert_eq!(resp.take().0, 403);
    }

    #[test]
    fn test_unknown_method_falls_through() {
        let resp = RespDot::default();
        assert!(resp.call("Bogus", &[]).is_none());
    }
}
