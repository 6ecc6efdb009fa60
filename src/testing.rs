//! In-memory transport for exercising the connection, pipeline and pool
//! without a server.
//!
//! Sessions answer by message text:
//!
//! - `SLEEP <ms>`: wait, then complete with `SELECT 0`
//! - `FAIL`: a server error (SQLSTATE 42601)
//! - `DISCONNECT`: the session drops and reports `Bad`
//! - the catalog query: the entries given to [`MockTransport::with_catalog`]
//! - anything else: one int4 row holding the session id, then `SELECT 1`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{PgError, PgResult};
use crate::message::{Format, Message};
use crate::transport::{
    FieldDescription, RawRow, ResultEvent, RowBatch, Session, SessionStatus, Transport,
};
use crate::types::{CatalogEntry, Oid};

pub(crate) enum Step {
    Delay(Duration),
    Rows(RowBatch),
    Done(String),
    Fail(PgError),
    Disconnect,
}

pub(crate) fn column(name: &str, type_oid: Oid) -> FieldDescription {
    FieldDescription {
        name: name.to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid,
        type_size: -1,
        type_modifier: -1,
        format: Format::Binary,
    }
}

pub(crate) fn batch(columns: Vec<FieldDescription>, rows: Vec<Vec<Option<Bytes>>>) -> RowBatch {
    RowBatch {
        columns: Arc::new(columns),
        rows: rows.into_iter().map(RawRow::from_vec).collect(),
    }
}

fn int4(value: i32) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(&value.to_be_bytes()))
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    connect_delay: Mutex<Duration>,
    connect_error: Mutex<Option<String>>,
    catalog: Mutex<Vec<CatalogEntry>>,
    health: Mutex<Vec<Arc<AtomicBool>>>,
    log: Mutex<Vec<(usize, String)>>,
}

/// Transport whose sessions follow a tiny command language.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_connect_delay(self, delay: Duration) -> Self {
        *self.state.connect_delay.lock() = delay;
        self
    }

    pub(crate) fn with_catalog(self, entries: Vec<CatalogEntry>) -> Self {
        *self.state.catalog.lock() = entries;
        self
    }

    pub(crate) fn fail_connects(&self, message: Option<&str>) {
        *self.state.connect_error.lock() = message.map(str::to_string);
    }

    /// Sessions opened so far.
    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Flip the native health flag of session `id` (1-based).
    pub(crate) fn break_session(&self, id: usize) {
        if let Some(flag) = self.state.health.lock().get(id - 1) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// `(session id, text)` of every message sent.
    pub(crate) fn log(&self) -> Vec<(usize, String)> {
        self.state.log.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Session = MockSession;

    async fn connect(&self) -> PgResult<MockSession> {
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let connect_error = self.state.connect_error.lock().clone();
        if let Some(message) = connect_error {
            return Err(PgError::ConnectionFailure(message));
        }

        let healthy = Arc::new(AtomicBool::new(true));
        self.state.health.lock().push(Arc::clone(&healthy));
        Ok(MockSession {
            id,
            state: Arc::clone(&self.state),
            script: VecDeque::new(),
            healthy,
            last_error: None,
        })
    }
}

pub(crate) struct MockSession {
    id: usize,
    state: Arc<MockState>,
    script: VecDeque<Step>,
    healthy: Arc<AtomicBool>,
    last_error: Option<String>,
}

impl MockSession {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn respond(&self, message: &Message) -> Vec<Step> {
        let text = message.text();
        if let Some(ms) = text.strip_prefix("SLEEP ") {
            let ms = ms.trim().parse().unwrap_or(0);
            return vec![
                Step::Delay(Duration::from_millis(ms)),
                Step::Done("SELECT 0".to_string()),
            ];
        }
        match text {
            "FAIL" => vec![Step::Fail(PgError::Server {
                severity: "ERROR".to_string(),
                code: "42601".to_string(),
                message: "syntax error at or near \"FAIL\"".to_string(),
                detail: None,
                hint: None,
            })],
            "DISCONNECT" => vec![Step::Disconnect],
            _ if text.starts_with("SELECT typname") => {
                let catalog = self.state.catalog.lock();
                let rows = catalog
                    .iter()
                    .map(|e| {
                        vec![
                            Some(Bytes::copy_from_slice(e.name.as_bytes())),
                            Some(Bytes::copy_from_slice(&e.oid.0.to_be_bytes())),
                            Some(Bytes::copy_from_slice(&e.array_oid.0.to_be_bytes())),
                        ]
                    })
                    .collect();
                let columns = vec![
                    column("typname", Oid::NAME),
                    column("oid", Oid::OID),
                    column("typarray", Oid::OID),
                ];
                vec![
                    Step::Rows(batch(columns, rows)),
                    Step::Done(format!("SELECT {}", catalog.len())),
                ]
            }
            _ => vec![
                Step::Rows(batch(
                    vec![column("session", Oid::INT4)],
                    vec![vec![int4(self.id as i32)]],
                )),
                Step::Done("SELECT 1".to_string()),
            ],
        }
    }

    fn go_bad(&mut self, err: &PgError) {
        self.healthy.store(false, Ordering::SeqCst);
        self.last_error = Some(err.to_string());
        self.script.clear();
    }
}

#[async_trait]
impl Session for MockSession {
    async fn send(&mut self, message: &Message) -> PgResult<()> {
        if self.status() == SessionStatus::Bad {
            return Err(PgError::ConnectionClosed);
        }
        self.state.log.lock().push((self.id, message.text().to_string()));
        self.script = self.respond(message).into();
        Ok(())
    }

    async fn poll_result(&mut self) -> PgResult<ResultEvent> {
        loop {
            match self.script.pop_front() {
                Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Rows(batch)) => return Ok(ResultEvent::Rows(batch)),
                Some(Step::Done(command_tag)) => return Ok(ResultEvent::Done { command_tag }),
                Some(Step::Fail(err)) => {
                    self.last_error = Some(err.to_string());
                    return Err(err);
                }
                Some(Step::Disconnect) => {
                    let err = PgError::ConnectionClosed;
                    self.go_bad(&err);
                    return Err(err);
                }
                None => return Err(PgError::Protocol("no request in flight".to_string())),
            }
        }
    }

    fn status(&self) -> SessionStatus {
        if self.healthy.load(Ordering::SeqCst) {
            SessionStatus::Good
        } else {
            SessionStatus::Bad
        }
    }

    async fn close(&mut self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
