//! The long-running worker process: connects to a server, pulls items,
//! evaluates them and sends the results back, with its own retry and
//! backoff discipline.

use std::marker::PhantomData;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use optforge_core::{CodecError, Evaluate, TcpClientConfig, WireFormat, WorkItem};

use crate::protocol::{
    Handshake, Message, PROTOCOL_VERSION, ProtocolError, read_message, write_message,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach {addr} after {attempts} attempts")]
    ReconnectExhausted { addr: String, attempts: u32 },
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("cannot encode result: {0}")]
    Codec(#[from] CodecError),
}

/// Why a client run ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ShutdownSignal,
    StallCap,
    MaxItems,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub items_processed: u64,
    pub stop: StopReason,
}

enum SessionEnd {
    Finished(StopReason),
    ConnectionLost,
}

/// A remote evaluation worker. `run` blocks until a clean stop condition,
/// the reconnect budget is exhausted, or the server violates the protocol.
pub struct WorkerClient<E> {
    cfg: TcpClientConfig,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Evaluate> WorkerClient<E> {
    pub fn new(cfg: TcpClientConfig) -> Self {
        Self {
            cfg,
            _marker: PhantomData,
        }
    }

    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ClientReport, ClientError> {
        let mut attempts = 0u32;
        let mut backoff = self.cfg.backoff_base();
        let mut processed_total = 0u64;

        loop {
            if *shutdown.borrow() {
                return Ok(report(processed_total, StopReason::ShutdownSignal));
            }
            match TcpStream::connect(&self.cfg.server_addr).await {
                Err(err) => {
                    attempts += 1;
                    warn!(
                        addr = %self.cfg.server_addr,
                        attempt = attempts,
                        %err,
                        "connect failed"
                    );
                    if self.cfg.reconnect_max > 0 && attempts >= self.cfg.reconnect_max {
                        return Err(ClientError::ReconnectExhausted {
                            addr: self.cfg.server_addr.clone(),
                            attempts,
                        });
                    }
                    if wait_or_shutdown(&mut shutdown, backoff).await {
                        return Ok(report(processed_total, StopReason::ShutdownSignal));
                    }
                    backoff = next_backoff(backoff, self.cfg.backoff_cap());
                }
                Ok(stream) => {
                    info!(addr = %self.cfg.server_addr, "connected");
                    match self
                        .serve(stream, &mut processed_total, &mut shutdown)
                        .await?
                    {
                        SessionEnd::Finished(reason) => {
                            return Ok(report(processed_total, reason));
                        }
                        SessionEnd::ConnectionLost => {
                            attempts += 1;
                            warn!(attempt = attempts, "connection lost");
                            if self.cfg.reconnect_max > 0 && attempts >= self.cfg.reconnect_max {
                                return Err(ClientError::ReconnectExhausted {
                                    addr: self.cfg.server_addr.clone(),
                                    attempts,
                                });
                            }
                            if wait_or_shutdown(&mut shutdown, backoff).await {
                                return Ok(report(processed_total, StopReason::ShutdownSignal));
                            }
                            backoff = next_backoff(backoff, self.cfg.backoff_cap());
                        }
                    }
                }
            }
        }
    }

    async fn serve(
        &self,
        stream: TcpStream,
        processed_total: &mut u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError> {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        // Announce our preference; whatever the server answers is what the
        // session speaks.
        let hello = Message::Compute(Handshake::new(self.cfg.format).to_bytes()?);
        if write_message(&mut writer, &hello).await.is_err() {
            return Ok(SessionEnd::ConnectionLost);
        }
        let negotiated = match read_reply(&mut reader, HANDSHAKE_TIMEOUT).await? {
            Reply::Lost => return Ok(SessionEnd::ConnectionLost),
            Reply::Message(Message::Compute(bytes)) => {
                let offered = Handshake::from_bytes(&bytes)?;
                if offered.version != PROTOCOL_VERSION {
                    return Err(ProtocolError::BadHandshake(format!(
                        "server speaks protocol version {}",
                        offered.version
                    ))
                    .into());
                }
                offered.format
            }
            Reply::Message(_) => {
                return Err(ProtocolError::Unexpected("handshake reply").into());
            }
        };
        info!(format = %negotiated, "handshake complete");

        let mut idle = self.cfg.backoff_base();
        let mut stalls = 0u32;
        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Finished(StopReason::ShutdownSignal));
            }
            if write_message(&mut writer, &Message::GetData).await.is_err() {
                return Ok(SessionEnd::ConnectionLost);
            }
            let message = match read_reply(&mut reader, REPLY_TIMEOUT).await? {
                Reply::Lost => return Ok(SessionEnd::ConnectionLost),
                Reply::Message(message) => message,
            };
            match message {
                Message::NoData => {
                    stalls += 1;
                    if self.cfg.stall_cap > 0 && stalls >= self.cfg.stall_cap {
                        info!(stalls, "stall cap reached; exiting");
                        return Ok(SessionEnd::Finished(StopReason::StallCap));
                    }
                    if wait_or_shutdown(shutdown, idle).await {
                        return Ok(SessionEnd::Finished(StopReason::ShutdownSignal));
                    }
                    idle = next_backoff(idle, self.cfg.backoff_cap());
                }
                Message::Result(blob) => {
                    stalls = 0;
                    idle = self.cfg.backoff_base();
                    match self
                        .process_and_return(&mut reader, &mut writer, negotiated, blob)
                        .await?
                    {
                        Some(end) => return Ok(end),
                        None => {
                            *processed_total += 1;
                            if self.cfg.max_items > 0 && *processed_total >= self.cfg.max_items {
                                info!(items = *processed_total, "item budget spent; exiting");
                                return Ok(SessionEnd::Finished(StopReason::MaxItems));
                            }
                        }
                    }
                }
                other => {
                    return Err(ProtocolError::Unexpected(other.command()).into());
                }
            }
        }
    }

    /// Evaluate one incoming item and send it back. Returns `Some(end)` if
    /// the session cannot continue, `None` after a completed round trip.
    async fn process_and_return(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
        format: WireFormat,
        blob: Vec<u8>,
    ) -> Result<Option<SessionEnd>, ClientError> {
        let mut item = match WorkItem::<E>::from_wire(format, &blob) {
            Ok(item) => item,
            Err(err) => {
                // The server sent something we cannot read; drop the link
                // and let the producer's timeout reclaim the item.
                warn!(%err, "undecodable work item");
                return Ok(Some(SessionEnd::ConnectionLost));
            }
        };
        debug!(item = ?item.id().map(|id| id.to_string()), "processing");

        let item = match tokio::task::spawn_blocking(move || {
            item.process();
            item
        })
        .await
        {
            Ok(item) => item,
            Err(err) => {
                error!(%err, "evaluation task failed; item is lost");
                return Ok(None);
            }
        };

        let payload = item.to_wire(format)?;
        if write_message(writer, &Message::Result(payload)).await.is_err() {
            return Ok(Some(SessionEnd::ConnectionLost));
        }
        match read_reply(reader, REPLY_TIMEOUT).await? {
            Reply::Lost => Ok(Some(SessionEnd::ConnectionLost)),
            Reply::Message(Message::Ack) => Ok(None),
            Reply::Message(Message::Nack) => {
                warn!("server refused the result; the producer will time it out");
                Ok(None)
            }
            Reply::Message(other) => Err(ProtocolError::Unexpected(other.command()).into()),
        }
    }
}

enum Reply {
    Message(Message),
    Lost,
}

/// Read one frame, folding timeouts and connection-level failures into
/// `Lost` and passing real protocol violations through as errors.
async fn read_reply(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    limit: Duration,
) -> Result<Reply, ProtocolError> {
    match tokio::time::timeout(limit, read_message(reader)).await {
        Err(_) => Ok(Reply::Lost),
        Ok(Err(ProtocolError::Closed)) => Ok(Reply::Lost),
        Ok(Err(ProtocolError::Io(_))) => Ok(Reply::Lost),
        Ok(Err(err)) => Err(err),
        Ok(Ok(message)) => Ok(Reply::Message(message)),
    }
}

fn report(items_processed: u64, stop: StopReason) -> ClientReport {
    ClientReport {
        items_processed,
        stop,
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

/// Sleep for `delay`, waking early on the shutdown signal. Returns true if
/// shutdown was signalled (or the signal source is gone).
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
