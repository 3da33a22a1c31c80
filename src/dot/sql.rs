//! SQL provider (`.Query`, `.Exec`, ...) and the opaque database handle.
//!
//! The engine never manages connections beyond this: a [`SqlHandle`] wraps
//! one SQLite connection behind a mutex, and each request's [`SqlDot`]
//! lazily opens a transaction on first data access by taking the owned
//! lock. The executor finalizes the transaction exactly once per request —
//! commit on success, rollback on failure — on every exit path.

use crate::tmpl::{ExecError, Map, Object, Value};
use anyhow::{Context, Result};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use sqlite::{ConnectionThreadSafe, State};
use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

/// Opaque database handle shared by all requests of an instance.
#[derive(Clone)]
pub struct SqlHandle {
    conn: Arc<Mutex<ConnectionThreadSafe>>,
}

impl SqlHandle {
    /// Open (or create) a SQLite database.
    pub fn open(path: &Path) -> Result<SqlHandle> {
        let conn = sqlite::Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Ok(SqlHandle {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ArcMutexGuard<RawMutex, ConnectionThreadSafe> {
        self.conn.lock_arc()
    }

    /// Run a query outside any request transaction. Used by build-time
    /// callers and tests.
    pub fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Map>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql).context("prepare failed")?;
        bind_args(&mut stmt, args).context("bind failed")?;
        let mut rows = Vec::new();
        while let State::Row = stmt.next().context("step failed")? {
            rows.push(row_to_map(&stmt).context("read failed")?);
        }
        Ok(rows)
    }
}

/// Transaction state of one request dot.
enum TxState {
    /// No data access yet; no transaction, no lock.
    Idle,
    /// Transaction open; the owned guard keeps other requests out until
    /// finalize.
    Open(ArcMutexGuard<RawMutex, ConnectionThreadSafe>),
    /// Finalized; further access is a template error.
    Finished,
}

/// Per-request SQL provider with a lazy transaction.
pub struct SqlDot {
    handle: SqlHandle,
    state: RefCell<TxState>,
}

impl SqlDot {
    pub fn new(handle: SqlHandle) -> Self {
        SqlDot {
            handle,
            state: RefCell::new(TxState::Idle),
        }
    }

    /// Run `f` against the open transaction, opening it on first use.
    fn with_tx<T>(
        &self,
        f: impl FnOnce(&ConnectionThreadSafe) -> Result<T, ExecError>,
    ) -> Result<T, ExecError> {
        let mut state = self.state.borrow_mut();
        if let TxState::Idle = &*state {
            let guard = self.handle.lock();
            guard
                .execute("BEGIN")
                .map_err(|e| ExecError::Failure(format!("begin transaction: {e}")))?;
            *state = TxState::Open(guard);
        }
        match &*state {
            TxState::Open(guard) => f(guard),
            TxState::Finished => Err(ExecError::Failure(
                "database access after transaction finalized".to_string(),
            )),
            TxState::Idle => unreachable!("opened above"),
        }
    }

    /// Commit or roll back the pending transaction. Safe to call when no
    /// transaction was opened; never runs twice.
    pub fn finalize(&self, commit: bool) -> Result<()> {
        let state = std::mem::replace(&mut *self.state.borrow_mut(), TxState::Finished);
        match state {
            TxState::Open(guard) => {
                let sql = if commit { "COMMIT" } else { "ROLLBACK" };
                guard
                    .execute(sql)
                    .with_context(|| format!("transaction {} failed", sql.to_lowercase()))
            }
            TxState::Idle | TxState::Finished => Ok(()),
        }
    }

    fn split_sql<'a>(args: &'a [Value], method: &str) -> Result<(String, &'a [Value]), ExecError> {
        match args.split_first() {
            Some((Value::Str(sql), rest)) => Ok((sql.clone(), rest)),
            _ => Err(ExecError::Failure(format!(
                "{method}: first argument must be a SQL string"
            ))),
        }
    }
}

impl Object for SqlDot {
    fn type_name(&self) -> &'static str {
        "sql"
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        match method {
            "Exec" => Some((|| {
                let (sql, params) = Self::split_sql(args, method)?;
                self.with_tx(|conn| {
                    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                    bind_args(&mut stmt, params).map_err(sql_err)?;
                    while let State::Row = stmt.next().map_err(sql_err)? {}
                    Ok(Value::Int(conn.change_count() as i64))
                })
            })()),

            "Query" => Some((|| {
                let (sql, params) = Self::split_sql(args, method)?;
                self.with_tx(|conn| {
                    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                    bind_args(&mut stmt, params).map_err(sql_err)?;
                    let mut rows = Vec::new();
                    while let State::Row = stmt.next().map_err(sql_err)? {
                        rows.push(Value::map(row_to_map(&stmt).map_err(sql_err)?));
                    }
                    Ok(Value::list(rows))
                })
            })()),

            "QueryRow" => Some((|| {
                let (sql, params) = Self::split_sql(args, method)?;
                self.with_tx(|conn| {
                    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                    bind_args(&mut stmt, params).map_err(sql_err)?;
                    match stmt.next().map_err(sql_err)? {
                        State::Row => Ok(Value::map(row_to_map(&stmt).map_err(sql_err)?)),
                        State::Done => Ok(Value::Null),
                    }
                })
            })()),

            "QueryVal" => Some((|| {
                let (sql, params) = Self::split_sql(args, method)?;
                self.with_tx(|conn| {
                    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
                    bind_args(&mut stmt, params).map_err(sql_err)?;
                    match stmt.next().map_err(sql_err)? {
                        State::Row => {
                            let v: sqlite::Value = stmt.read(0).map_err(sql_err)?;
                            Ok(to_value(v))
                        }
                        State::Done => Ok(Value::Null),
                    }
                })
            })()),

            // open the lazy transaction eagerly; useful before a sequence
            // of statements that must see each other's writes
            "Tx" => Some(self.with_tx(|_| Ok(Value::Null))),

            _ => None,
        }
    }
}

fn sql_err(e: sqlite::Error) -> ExecError {
    ExecError::Failure(format!("sql: {e}"))
}

fn bind_args(stmt: &mut sqlite::Statement, args: &[Value]) -> sqlite::Result<()> {
    for (i, arg) in args.iter().enumerate() {
        let idx = i + 1;
        match arg {
            Value::Null => stmt.bind((idx, ()))?,
            Value::Bool(b) => stmt.bind((idx, *b as i64))?,
            Value::Int(n) => stmt.bind((idx, *n))?,
            Value::Float(f) => stmt.bind((idx, *f))?,
            other => stmt.bind((idx, other.to_string().as_str()))?,
        }
    }
    Ok(())
}

fn row_to_map(stmt: &sqlite::Statement) -> sqlite::Result<Map> {
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut map = Map::new();
    for (i, name) in names.into_iter().enumerate() {
        let v: sqlite::Value = stmt.read(i)?;
        map.insert(name, to_value(v));
    }
    Ok(map)
}

fn to_value(v: sqlite::Value) -> Value {
    match v {
        sqlite::Value::Null => Value::Null,
        sqlite::Value::Integer(n) => Value::Int(n),
        sqlite::Value::Float(f) => Value::Float(f),
        sqlite::Value::String(s) => Value::Str(s),
        sqlite::Value::Binary(b) => Value::Str(String::from_utf8_lossy(&b).into_owned()),
    }
}
