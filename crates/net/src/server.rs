//! Remote consumer: a TCP server handing raw items to connected workers
//! and feeding their results back to the broker.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use optforge_broker::{Broker, BrokerError, Consumer};
use optforge_core::{Evaluate, TcpServerConfig, WorkItem};

use crate::protocol::{Handshake, Message, ProtocolError, read_message, write_message};

/// TCP server consumer. Owns its own I/O runtime, sized by the configured
/// thread count; each accepted connection gets one session task that is the
/// only owner of that session's state.
pub struct TcpServerConsumer<E> {
    cfg: TcpServerConfig,
    bound: Arc<OnceLock<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    runtime: Option<tokio::runtime::Runtime>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Evaluate> TcpServerConsumer<E> {
    pub fn new(cfg: TcpServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            bound: Arc::new(OnceLock::new()),
            shutdown,
            runtime: None,
            _marker: PhantomData,
        }
    }

    /// Shared cell that receives the bound address once the listener is up.
    /// Useful when the configured port is 0.
    pub fn bound_addr(&self) -> Arc<OnceLock<SocketAddr>> {
        Arc::clone(&self.bound)
    }
}

impl<E: Evaluate> Consumer<E> for TcpServerConsumer<E> {
    fn name(&self) -> &str {
        "tcp-server"
    }

    fn parallelism_hint(&self) -> usize {
        self.cfg.threads
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn start(&mut self, broker: Broker<E>) -> Result<(), BrokerError> {
        let bind = format!("{}:{}", self.cfg.bind_addr, self.cfg.port);
        // Bind synchronously so configuration errors surface here, before
        // any task is running.
        let listener = std::net::TcpListener::bind(&bind)
            .map_err(|err| BrokerError::ConsumerStart(format!("bind {bind}: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| BrokerError::ConsumerStart(format!("set_nonblocking: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| BrokerError::ConsumerStart(format!("local_addr: {err}")))?;
        let _ = self.bound.set(local_addr);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.cfg.threads)
            .thread_name("tcp-consumer")
            .enable_all()
            .build()
            .map_err(|err| BrokerError::ConsumerStart(format!("runtime: {err}")))?;

        let cfg = self.cfg.clone();
        let shutdown_rx = self.shutdown.subscribe();
        runtime.spawn(accept_loop(listener, cfg, broker, shutdown_rx));
        self.runtime = Some(runtime);
        info!(addr = %local_addr, format = %self.cfg.format, "tcp consumer listening");
        Ok(())
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(2));
        }
        info!("tcp consumer stopped");
    }
}

impl<E> Drop for TcpServerConsumer<E> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop<E: Evaluate>(
    listener: std::net::TcpListener,
    cfg: TcpServerConfig,
    broker: Broker<E>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "cannot adopt listener into the runtime");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "session connected");
                    tokio::spawn(run_session(
                        stream,
                        peer,
                        cfg.clone(),
                        broker.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
        }
    }
    debug!("accept loop exiting");
}

/// One connected worker. All session state lives on this task; nothing
/// else touches it.
async fn run_session<E: Evaluate>(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: TcpServerConfig,
    broker: Broker<E>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, %err, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        let message = tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = tokio::time::timeout(cfg.session_timeout(), read_message(&mut reader)) => {
                match read {
                    Err(_) => {
                        debug!(%peer, "session idle past timeout; closing");
                        break;
                    }
                    Ok(Err(ProtocolError::Closed)) => {
                        debug!(%peer, "worker disconnected");
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(%peer, %err, "protocol fault; tearing session down");
                        break;
                    }
                    Ok(Ok(message)) => message,
                }
            }
        };

        let reply = match message {
            Message::Compute(payload) => match Handshake::from_bytes(&payload) {
                Ok(asked) => {
                    debug!(%peer, asked = %asked.format, "handshake");
                    match Handshake::new(cfg.format).to_bytes() {
                        Ok(bytes) => Message::Compute(bytes),
                        Err(err) => {
                            error!(%peer, %err, "cannot encode handshake");
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(%peer, %err, "unreadable handshake; tearing session down");
                    break;
                }
            },
            Message::Ping => Message::Pong,
            Message::GetData => serve_get_data(&broker, &cfg, peer).await,
            Message::Result(blob) => accept_result(&broker, &cfg, peer, &blob).await,
            other => {
                warn!(%peer, command = other.command(), "unexpected command; tearing session down");
                break;
            }
        };

        if let Err(err) = write_message(&mut writer, &reply).await {
            debug!(%peer, %err, "write failed; closing session");
            break;
        }
    }
}

/// Pull one raw item within the configured wait budget. An item that
/// cannot be serialized is returned to nobody; the producer's timeout is
/// the recovery path, exactly as for a lost remote copy.
async fn serve_get_data<E: Evaluate>(
    broker: &Broker<E>,
    cfg: &TcpServerConfig,
    peer: SocketAddr,
) -> Message {
    let wait = cfg.request_wait();
    let pull = {
        let broker = broker.clone();
        tokio::task::spawn_blocking(move || broker.get_raw(wait)).await
    };
    match pull {
        Ok(Some(item)) => match item.to_wire(cfg.format) {
            Ok(blob) => Message::Result(blob),
            Err(err) => {
                error!(%peer, %err, "cannot serialize outgoing item; dropping it");
                Message::NoData
            }
        },
        Ok(None) => Message::NoData,
        Err(err) => {
            error!(%peer, %err, "dispatch task failed");
            Message::NoData
        }
    }
}

/// Validate and enqueue a returned item. Undecodable payloads get `NACK`
/// and the session lives on; the item times out at the producer.
async fn accept_result<E: Evaluate>(
    broker: &Broker<E>,
    cfg: &TcpServerConfig,
    peer: SocketAddr,
    blob: &[u8],
) -> Message {
    let item = match WorkItem::<E>::from_wire(cfg.format, blob) {
        Ok(item) => item,
        Err(err) => {
            warn!(%peer, %err, "undecodable result payload");
            return Message::Nack;
        }
    };
    let Some(id) = item.id() else {
        warn!(%peer, "returned item carries no identity");
        return Message::Nack;
    };
    debug!(%peer, item = %id, "result received");
    let push = {
        let broker = broker.clone();
        tokio::task::spawn_blocking(move || broker.put_processed(item)).await
    };
    match push {
        Ok(()) => Message::Ack,
        Err(err) => {
            error!(%peer, %err, "return task failed");
            Message::Nack
        }
    }
}
