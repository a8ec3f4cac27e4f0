//! Newline-delimited JSON traffic intake over TCP.
//!
//! Each line is one [`TrafficEvent`]. Lines that fail to parse are counted
//! and skipped; a line longer than `max_event_bytes` closes its connection.
//! While the rule store is halted, events are rejected here instead of
//! being queued behind a pipeline that cannot evaluate them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::config::PipelineConfig;
use flowgate_core::event::TrafficEvent;
use flowgate_core::metrics as m;
use flowgate_engine::RuleStore;

/// Connections silent for this long are closed.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// TCP intake listener feeding the event pipeline.
pub struct IntakeServer {
    listener: TcpListener,
    tx: mpsc::Sender<TrafficEvent>,
    store: Arc<RuleStore>,
    cancel: CancellationToken,
    max_connections: usize,
    max_event_bytes: usize,
}

impl IntakeServer {
    /// Bind the listener on `config.intake_bind`.
    pub async fn bind(
        config: &PipelineConfig,
        tx: mpsc::Sender<TrafficEvent>,
        store: Arc<RuleStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.intake_bind)
            .await
            .with_context(|| format!("failed to bind intake on {}", config.intake_bind))?;

        Ok(Self {
            listener,
            tx,
            store,
            cancel,
            max_connections: config.max_connections,
            max_event_bytes: config.max_event_bytes,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read intake listener address")
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections until cancelled.
    pub async fn run(self) {
        let addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        info!(listen_addr = %addr, "traffic intake listening");

        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "intake accept failed");
                            continue;
                        }
                    };

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                peer = %peer,
                                max_connections = self.max_connections,
                                "max intake connections reached, rejecting connection"
                            );
                            continue;
                        }
                    };

                    debug!(peer = %peer, "intake connection accepted");
                    let connection = Connection {
                        peer,
                        tx: self.tx.clone(),
                        store: Arc::clone(&self.store),
                        cancel: self.cancel.clone(),
                        max_event_bytes: self.max_event_bytes,
                    };
                    tokio::spawn(async move {
                        connection.serve(stream).await;
                        drop(permit);
                    });
                }
                _ = self.cancel.cancelled() => {
                    info!("traffic intake shutting down");
                    break;
                }
            }
        }
    }
}

/// What to do after reading one line.
enum LineOutcome {
    Continue,
    Close,
}

struct Connection {
    peer: SocketAddr,
    tx: mpsc::Sender<TrafficEvent>,
    store: Arc<RuleStore>,
    cancel: CancellationToken,
    max_event_bytes: usize,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::with_capacity(1024);
        // One extra byte for the newline itself.
        let limit = self.max_event_bytes as u64 + 1;

        loop {
            line.clear();
            let mut bounded = (&mut reader).take(limit);

            tokio::select! {
                result = timeout(CONNECTION_IDLE_TIMEOUT, bounded.read_until(b'\n', &mut line)) => {
                    match result {
                        Ok(Ok(0)) => {
                            debug!(peer = %self.peer, "intake connection closed by peer");
                            break;
                        }
                        Ok(Ok(n)) => {
                            if n as u64 == limit && line.last() != Some(&b'\n') {
                                metrics::counter!(m::PIPELINE_INTAKE_REJECTED_TOTAL, m::LABEL_REASON => "oversize").increment(1);
                                warn!(
                                    peer = %self.peer,
                                    max_event_bytes = self.max_event_bytes,
                                    "event line exceeds maximum size, closing connection"
                                );
                                break;
                            }
                            if let LineOutcome::Close = self.handle_line(&line).await {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(peer = %self.peer, error = %e, "intake read error");
                            break;
                        }
                        Err(_) => {
                            debug!(peer = %self.peer, "intake connection idle, closing");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!(peer = %self.peer, "closing intake connection for shutdown");
                    break;
                }
            }
        }
    }

    async fn handle_line(&self, line: &[u8]) -> LineOutcome {
        if line.iter().all(u8::is_ascii_whitespace) {
            return LineOutcome::Continue;
        }

        let event: TrafficEvent = match serde_json::from_slice(line) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!(m::PIPELINE_INTAKE_REJECTED_TOTAL, m::LABEL_REASON => "invalid_json").increment(1);
                warn!(peer = %self.peer, error = %e, "rejecting unparseable event line");
                return LineOutcome::Continue;
            }
        };

        if let Some(reason) = self.store.halted_reason() {
            metrics::counter!(m::PIPELINE_INTAKE_REJECTED_TOTAL, m::LABEL_REASON => "intake_halted").increment(1);
            debug!(event_id = %event.id, reason = %reason, "intake halted, event rejected");
            return LineOutcome::Continue;
        }

        if self.tx.send(event).await.is_err() {
            error!(peer = %self.peer, "pipeline intake channel closed");
            return LineOutcome::Close;
        }
        LineOutcome::Continue
    }
}
