use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{Metadata, Role};
use crate::sandbox::governor::CancelToken;
use crate::sandbox::suggest::suggest_code;
use crate::sandbox::Engine;

use super::session::Session;

/// One line of input.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Opaque, echoed back in the response
    #[serde(default)]
    pub request_id: Option<Json>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Append {
        session_id: String,
        role: Role,
        content: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Execute {
        session_id: String,
        code: String,
        #[serde(default)]
        description: String,
    },
    Context {
        session_id: String,
    },
    Stats {
        session_id: String,
    },
    Cancel {
        session_id: String,
    },
    Close {
        session_id: String,
    },
    Suggest {
        query: String,
    },
    /// Screens code without running it
    Validate {
        code: String,
    },
    Capabilities,
}

impl Request {
    fn session_id(&self) -> Option<&str> {
        match self {
            Request::Append { session_id, .. }
            | Request::Execute { session_id, .. }
            | Request::Context { session_id }
            | Request::Stats { session_id }
            | Request::Cancel { session_id }
            | Request::Close { session_id } => Some(session_id),
            Request::Suggest { .. } | Request::Validate { .. } | Request::Capabilities => None,
        }
    }
}

/// The runtime's side of a live session task.
struct SessionHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

/// Host loop for the JSON-lines protocol.
///
/// Reads one request per line, routes it to the owning session's task
/// (created on first use) and writes one response line per request.
/// Sessions run concurrently; each handles its own requests in order.
pub struct SandboxRuntime {
    engine: Arc<Engine>,
    config: Config,
    sessions: HashMap<String, SessionHandle>,
}

impl SandboxRuntime {
    pub fn new(config: Config, engine: Arc<Engine>) -> Self {
        Self {
            engine,
            config,
            sessions: HashMap::new(),
        }
    }

    /// Main loop: runs until the input is exhausted and every session
    /// has answered what it was sent.
    pub async fn run<R, W>(&mut self, reader: R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(
            "Sandbox runtime started ({} capabilities) — waiting for requests...",
            self.engine.registry().len()
        );

        // Unbounded like the session queues: neither side ever waits on
        // the other
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let mut lines = reader.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(response) = self.dispatch(&line, &out_tx) {
                        write_line(writer, &response).await?;
                    }
                }
                Some(response) = out_rx.recv() => {
                    write_line(writer, &response).await?;
                }
            }
        }

        // Input closed: let every session drain its queue
        drop(out_tx);
        let tasks: Vec<JoinHandle<()>> = self.sessions.drain().map(|(_, h)| h.task).collect();
        let drain = async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Session task failed: {e}");
                }
            }
        };
        tokio::pin!(drain);
        loop {
            tokio::select! {
                _ = &mut drain => break,
                Some(response) = out_rx.recv() => write_line(writer, &response).await?,
            }
        }
        while let Some(response) = out_rx.recv().await {
            write_line(writer, &response).await?;
        }

        info!("Input closed, sandbox runtime stopped");
        Ok(())
    }

    /// Handles one input line. Returns the response when it can be
    /// given right away; session-bound requests answer through `out`.
    ///
    /// Never waits: a session with a long backlog must not hold up the
    /// reader, other sessions or `cancel`.
    fn dispatch(&mut self, line: &str, out: &mpsc::UnboundedSender<String>) -> Option<String> {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed request: {e}");
                return Some(respond(None, Err(anyhow!("malformed request: {e}"))));
            }
        };
        let request_id = envelope.request_id.clone();

        let session_id = match &envelope.request {
            Request::Suggest { query } => {
                let code = suggest_code(query);
                return Some(respond(request_id, Ok(json!({ "code": code }))));
            }
            Request::Validate { code } => {
                let verdict = match self.engine.validate(code) {
                    Ok(()) => json!({ "valid": true }),
                    Err(e) => json!({
                        "valid": false,
                        "status": e.status(),
                        "error": e.to_string(),
                    }),
                };
                return Some(respond(request_id, Ok(verdict)));
            }
            Request::Capabilities => {
                let registry = self.engine.registry();
                let listing = json!({
                    "version": registry.version(),
                    "capabilities": registry.list(),
                });
                return Some(respond(request_id, Ok(listing)));
            }
            Request::Cancel { session_id } => {
                return Some(respond(request_id, self.cancel(session_id)));
            }
            other => other.session_id()?.to_string(),
        };

        if matches!(envelope.request, Request::Close { .. }) {
            let Some(handle) = self.sessions.remove(&session_id) else {
                return Some(respond(
                    request_id,
                    Err(anyhow!("unknown session '{session_id}'")),
                ));
            };
            // Queued behind pending requests; the task exits after it
            if handle.tx.send(envelope).is_err() {
                error!("Session {session_id} task is gone, closing without it");
                return Some(respond(
                    request_id,
                    Err(anyhow!("session '{session_id}' is unavailable")),
                ));
            }
            return None;
        }

        let handle = self.session(&session_id, out);
        if handle.tx.send(envelope).is_err() {
            error!("Session {session_id} task is gone");
            self.sessions.remove(&session_id);
            return Some(respond(
                request_id,
                Err(anyhow!("session '{session_id}' is unavailable")),
            ));
        }
        None
    }

    /// Bypasses the session queue: the running execution sees it at its
    /// next governor check.
    fn cancel(&self, session_id: &str) -> Result<Json> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?;
        handle.cancel.cancel();
        info!("Cancellation requested for session {session_id}");
        Ok(json!({ "cancelled": true }))
    }

    fn session(&mut self, session_id: &str, out: &mpsc::UnboundedSender<String>) -> &SessionHandle {
        let engine = &self.engine;
        let context = &self.config.context;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let session = Session::new(session_id, Arc::clone(engine), context.clone());
                let cancel = session.cancel_token();
                let (tx, rx) = mpsc::unbounded_channel();
                info!("Session {session_id} opened");
                let task = tokio::spawn(serve(session, rx, out.clone()));
                SessionHandle { tx, cancel, task }
            })
    }
}

/// Session task: handles requests strictly in arrival order.
async fn serve(
    mut session: Session,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    out: mpsc::UnboundedSender<String>,
) {
    while let Some(Envelope {
        request_id,
        request,
    }) = rx.recv().await
    {
        let closing = matches!(request, Request::Close { .. });
        let outcome = match request {
            Request::Append {
                role,
                content,
                metadata,
                ..
            } => {
                let id = session.append(role, content, metadata);
                Ok(json!({ "message_id": id }))
            }
            Request::Execute {
                code, description, ..
            } => {
                // Evaluation is CPU-bound; keep it off the async workers
                let joined = tokio::task::spawn_blocking(move || {
                    let record = session.execute(&code, &description);
                    (session, record)
                })
                .await;
                match joined {
                    Ok((returned, record)) => {
                        session = returned;
                        serde_json::to_value(record.to_response()).map_err(Into::into)
                    }
                    Err(e) => {
                        error!("Execution task failed, dropping session: {e}");
                        let _ = out.send(respond(request_id, Err(anyhow!("execution task failed"))));
                        return;
                    }
                }
            }
            Request::Context { .. } => {
                serde_json::to_value(session.context_dump()).map_err(Into::into)
            }
            Request::Stats { .. } => serde_json::to_value(session.stats()).map_err(Into::into),
            Request::Close { .. } => Ok(json!({ "closed": true })),
            other => Err(anyhow!("request not handled by sessions: {other:?}")),
        };

        if out.send(respond(request_id, outcome)).is_err() {
            debug!("Output closed, session {} stopping", session.id());
            return;
        }
        if closing {
            break;
        }
    }
    info!(
        "Session {} closed after {} executions",
        session.id(),
        session.stats().executions
    );
}

fn respond(request_id: Option<Json>, outcome: Result<Json>) -> String {
    let body = match outcome {
        Ok(data) => json!({ "request_id": request_id, "ok": true, "data": data }),
        Err(e) => json!({ "request_id": request_id, "ok": false, "error": format!("{e:#}") }),
    };
    body.to_string()
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
