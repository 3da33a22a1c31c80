//! Request provider (`.Req`).

use crate::server::request::RequestCx;
use crate::tmpl::{Object, Value};
use std::rc::Rc;

pub struct ReqDot {
    req: Rc<RequestCx>,
}

impl ReqDot {
    pub fn new(req: Rc<RequestCx>) -> Self {
        ReqDot { req }
    }
}

impl Object for ReqDot {
    fn type_name(&self) -> &'static str {
        "req"
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "Method" => Some(Value::str(self.req.method.clone())),
            "Path" => Some(Value::str(self.req.path.clone())),
            "RawQuery" => Some(Value::str(self.req.query.clone())),
            "Host" => Some(Value::str(self.req.host().to_string())),
            "RemoteAddr" => Some(Value::str(
                self.req
                    .remote_addr
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            )),
            "Body" => Some(match &self.req.body {
                Some(body) => Value::str(String::from_utf8_lossy(body).into_owned()),
                None => Value::Null,
            }),
            _ => None,
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, crate::tmpl::ExecError>> {
        let arg = || args.first().map(|v| v.to_string()).unwrap_or_default();
        match method {
            "Header" => Some(Ok(match self.req.header(&arg()) {
                Some(v) => Value::str(v.to_string()),
                None => Value::Null,
            })),
            "Cookie" => Some(Ok(match self.req.cookie(&arg()) {
                Some(v) => Value::str(v),
                None => Value::Null,
            })),
            "Query" => Some(Ok(match self.req.query_value(&arg()) {
                Some(v) => Value::str(v),
                None => Value::Null,
            })),
            "PathValue" => Some(Ok(match self.req.path_value(&arg()) {
                Some(v) => Value::str(v.to_string()),
                None => Value::Null,
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_dot() -> ReqDot {
        let mut req = RequestCx::new("DELETE", "/x/42?confirm=yes");
        req.headers
            .push(("Host".to_string(), "example.test".to_string()));
        req.path_values
            .push(("id".to_string(), "42".to_string()));
        ReqDot::new(Rc::new(req))
    }

    #[test]
    fn test_fields() {
        let dot = req_dot();
        assert_eq!(dot.field("Method").unwrap().to_string(), "DELETE");
        assert_eq!(dot.field("Path").unwrap().to_string(), "/x/42");
        assert_eq!(dot.field("Host").unwrap().to_string(), "example.test");
        assert!(dot.field("Nope").is_none());
    }

    #[test]
    fn test_methods() {
        let dot = req_dot();
        let v = dot
            .call("PathValue", &[Value::str("id")])
            .unwrap()
            .unwrap();
        assert_eq!(v.to_string(), "42");
        let v = dot.call("Query", &[Value::str("confirm")]).unwrap().unwrap();
        assert_eq!(v.to_string(), "yes");
        let v = dot.call("Query", &[Value::str("gone")]).unwrap().unwrap();
        assert!(matches!(v, Value::Null));
    }
}
