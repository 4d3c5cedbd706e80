//! Server assembly and the per-connection dispatcher.
//!
//! Each accepted connection gets its own task running a single read loop:
//! decode a frame, resolve the command and subcommand, authorize, then
//! execute locally or hand the command to the replication coupler. The same
//! loop multiplexes the connection's pub/sub delivery queue, so subscription
//! confirmations and published messages interleave with replies without a
//! second writer on the socket.
//!
//! Every non-fatal error becomes a protocol error line and the connection
//! stays open; only EOF, I/O failure, or shutdown end the loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acl::Acl;
use crate::cluster::{self, Applier, ApplyRecord, ApplyResponse, Replicator, Role};
use crate::command::{self, CommandRegistry, HandlerContext};
use crate::config::SharedConfig;
use crate::connection::ConnInfo;
use crate::error::{MurexError, MurexResult};
use crate::keyspace::{now_millis, Keyspace};
use crate::pubsub::{self, PubSub, SharedPubSub};
use crate::resp;
use crate::script::ScriptCommand;

const READ_BUFFER: usize = 4096;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server {
    config: SharedConfig,
    keyspace: Arc<Keyspace>,
    registry: Arc<CommandRegistry>,
    acl: Arc<Acl>,
    pubsub: SharedPubSub,
    replicator: Option<Arc<Replicator>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Construct the server: load ACL users, register built-in and scripted
    /// command modules, and (when clustered) start the consensus node.
    pub fn new(config: SharedConfig) -> MurexResult<Arc<Server>> {
        let users = if config.acl_file.is_empty() {
            Vec::new()
        } else {
            Acl::load_users(&config.acl_file)?
        };
        let acl = Arc::new(Acl::with_users(users));

        let mut registry = CommandRegistry::new();
        command::register_builtins(&mut registry);
        for path in &config.modules {
            let module = ScriptCommand::load(path)?;
            info!(command = %module.name, path = %path, "loaded script module");
            registry.register(module);
        }
        let registry = Arc::new(registry);

        let keyspace = Arc::new(Keyspace::new());
        let pubsub: SharedPubSub = Arc::new(RwLock::new(PubSub::new()));
        let shutdown = CancellationToken::new();

        let replicator = if config.in_cluster() {
            let role = if config.bootstrap_cluster {
                Role::Leader
            } else {
                Role::Follower
            };
            if role == Role::Follower {
                info!(
                    join_addr = %config.join_addr,
                    "starting as follower; mutating commands will redirect to the leader"
                );
            }
            let applier = make_applier(
                Arc::clone(&keyspace),
                Arc::clone(&registry),
                Arc::clone(&acl),
                Arc::clone(&pubsub),
                Arc::clone(&config),
                shutdown.clone(),
            );
            let raft = cluster::spawn_node(config.server_id.clone(), role, applier);
            Some(Arc::new(Replicator::new(raft, config.server_id.clone())))
        } else {
            None
        };

        Ok(Arc::new(Server {
            config,
            keyspace,
            registry,
            acl,
            pubsub,
            replicator,
            shutdown,
        }))
    }

    pub fn replicator(&self) -> Option<&Arc<Replicator>> {
        self.replicator.as_ref()
    }

    /// Run until SIGINT/SIGTERM. In HTTP mode only the liveness endpoint is
    /// served; otherwise this is the data-protocol accept loop.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        if self.config.http {
            return self.run_http().await;
        }

        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr).await?;

        let tls_acceptor = if self.config.tls {
            let acceptor = build_tls_acceptor(&self.config).map_err(|e| {
                error!(error = %e, "TLS initialization failed");
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
            })?;
            info!(%addr, "TLS server listening");
            Some(acceptor)
        } else {
            info!(%addr, "server listening");
            None
        };

        self.spawn_expiry_sweeper();

        let shutdown_wait = shutdown_signal();
        tokio::pin!(shutdown_wait);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    let server = Arc::clone(&self);
                    match tls_acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls) => server.handle_connection(tls, peer.to_string()).await,
                                    Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                                }
                            });
                        }
                        None => {
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer.to_string()).await;
                            });
                        }
                    }
                }
                _ = &mut shutdown_wait => {
                    info!("shutting down");
                    if let Some(replicator) = &self.replicator {
                        replicator.shutdown().await;
                    }
                    self.shutdown.cancel();
                    return Ok(());
                }
            }
        }
    }

    /// The liveness surface: every request gets the same hello.
    async fn run_http(self: Arc<Self>) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "HTTP server listening");

        let shutdown_wait = shutdown_signal();
        tokio::pin!(shutdown_wait);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (mut stream, _) = result?;
                    tokio::spawn(async move {
                        let mut head = [0u8; 1024];
                        let _ = stream.read(&mut head).await;
                        let body = "Hello from murex!";
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
                _ = &mut shutdown_wait => {
                    info!("shutting down");
                    self.shutdown.cancel();
                    return Ok(());
                }
            }
        }
    }

    fn spawn_expiry_sweeper(&self) {
        let keyspace = Arc::clone(&self.keyspace);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut cursor = None;
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let (next, _) = keyspace.sweep_step(cursor, now_millis());
                        cursor = next;
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (pubsub_tx, mut pubsub_rx) = pubsub::subscriber_queue();
        let conn = ConnInfo::next(&self.config.server_id, Some(pubsub_tx));
        self.acl.register_connection(conn.id);
        let cancel = self.shutdown.child_token();

        let mut stream = stream;
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        debug!(conn = %conn.name, %peer, "connection opened");

        'outer: loop {
            // Drain every complete frame before waiting for more input, so a
            // pipelined burst is answered in submission order.
            loop {
                match resp::decode_command(&mut buf) {
                    Ok(Some(raw)) if raw.is_empty() => continue,
                    Ok(Some(raw)) => {
                        let result = self.execute_command(&conn, &cancel, raw).await;
                        let write = match result {
                            // Commands like SUBSCRIBE answer through the
                            // delivery queue instead.
                            Ok(bytes) if bytes.is_empty() => Ok(()),
                            Ok(bytes) => stream.write_all(&bytes).await,
                            Err(e) => write_error_line(&mut stream, &e).await,
                        };
                        if write.is_err() {
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let err = MurexError::Protocol(e.to_string());
                        if write_error_line(&mut stream, &err).await.is_err() {
                            break 'outer;
                        }
                        // Drop whatever is buffered and resync at the next
                        // read.
                        buf.clear();
                        break;
                    }
                }
            }

            tokio::select! {
                result = stream.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(conn = %conn.name, error = %e, "read failed");
                            break;
                        }
                    }
                }
                Some(msg) = pubsub_rx.recv() => {
                    if stream.write_all(&msg.to_wire()).await.is_err() {
                        break;
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        cancel.cancel();
        self.pubsub.write().await.remove_connection(conn.id);
        self.acl.forget_connection(conn.id);
        debug!(conn = %conn.name, "connection closed");
    }

    /// One dispatch: lookup, subcommand resolution (which pins the effective
    /// replication flag), authorization, then local or replicated execution.
    async fn execute_command(
        &self,
        conn: &ConnInfo,
        cancel: &CancellationToken,
        raw: Vec<String>,
    ) -> MurexResult<Vec<u8>> {
        let command = self.registry.lookup(&raw[0])?;
        let subcommand = command.resolve_subcommand(&raw);
        let sync = subcommand.map_or(command.sync, |s| s.sync);
        let keys = command.extract_keys(&raw)?;
        self.acl
            .authorize(conn.id, &raw, &command, subcommand, &keys)?;

        let now_ms = now_millis();
        match (&self.replicator, sync) {
            (Some(replicator), true) => replicator.execute(&conn.name, &raw, now_ms).await,
            _ => {
                let ctx = HandlerContext {
                    keyspace: Arc::clone(&self.keyspace),
                    pubsub: Arc::clone(&self.pubsub),
                    acl: Arc::clone(&self.acl),
                    config: Arc::clone(&self.config),
                    conn: conn.clone(),
                    cancel: cancel.clone(),
                    now_ms,
                };
                command.handle(ctx, raw).await
            }
        }
    }
}

/// Execute one decoded log record against local state. Runs on every node,
/// leader included; determinism comes from the record's own clock.
fn make_applier(
    keyspace: Arc<Keyspace>,
    registry: Arc<CommandRegistry>,
    acl: Arc<Acl>,
    pubsub: SharedPubSub,
    config: SharedConfig,
    cancel: CancellationToken,
) -> Applier {
    Arc::new(move |record: ApplyRecord| {
        let keyspace = Arc::clone(&keyspace);
        let registry = Arc::clone(&registry);
        let acl = Arc::clone(&acl);
        let pubsub = Arc::clone(&pubsub);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        Box::pin(async move {
            let result = apply_record(keyspace, registry, acl, pubsub, config, cancel, record).await;
            match result {
                Ok(response) => ApplyResponse {
                    response,
                    error: None,
                },
                Err(e) => ApplyResponse {
                    response: Vec::new(),
                    error: Some(e.to_string()),
                },
            }
        })
    })
}

#[allow(clippy::too_many_arguments)]
async fn apply_record(
    keyspace: Arc<Keyspace>,
    registry: Arc<CommandRegistry>,
    acl: Arc<Acl>,
    pubsub: SharedPubSub,
    config: SharedConfig,
    cancel: CancellationToken,
    record: ApplyRecord,
) -> MurexResult<Vec<u8>> {
    if record.cmd.is_empty() {
        return Err(MurexError::generic("empty command in log entry"));
    }
    let command = registry.lookup(&record.cmd[0])?;
    let ctx = HandlerContext {
        keyspace,
        pubsub,
        acl,
        config,
        conn: ConnInfo::replayed(&record.connection_id),
        cancel,
        now_ms: record.timestamp_ms,
    };
    command.handle(ctx, record.cmd).await
}

async fn write_error_line<S>(stream: &mut S, err: &MurexError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Error lines carry an extra newline after the CRLF; existing clients
    // depend on it.
    stream.write_all(format!("-{err}\r\n\n").as_bytes()).await
}

fn build_tls_acceptor(config: &crate::config::Config) -> MurexResult<tokio_native_tls::TlsAcceptor> {
    let cert = std::fs::read(&config.cert)?;
    let key = std::fs::read(&config.key)?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| MurexError::generic(format!("could not load TLS identity: {e}")))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|e| MurexError::generic(format!("could not build TLS acceptor: {e}")))?;
    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
