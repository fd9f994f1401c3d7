use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::Framed;

use crate::cmd::{cmd, Cmd};
use crate::errors::{closed_connection_error, Error, ErrorKind, RimcuResult};
use crate::parser::ValueCodec;
use crate::slot::SLOT_COUNT;
use crate::types::{PushKind, Value};

/// Decoded payload of a tracking invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Invalidation {
    /// Individual keys were mutated.
    Keys(Vec<String>),
    /// Every key in a slot was invalidated.
    Slot(u16),
    /// The server flushed; nothing local can be trusted.
    All,
}

/// Receives invalidations demultiplexed from a connection's push frames.
pub(crate) trait InvalidationSink: Send + Sync + 'static {
    fn invalidate(&self, invalidation: Invalidation);
}

/// Setup commands run right after the socket is established.
#[derive(Clone)]
pub(crate) enum Handshake {
    /// No setup; used by the subscriber and the topology explorer.
    None,
    /// `HELLO 3` and `CLIENT TRACKING ON`; invalidations arrive as push
    /// frames on this connection.
    Resp3Tracking,
    /// `CLIENT ID`, plus a tracking redirect to the process-wide
    /// subscriber when its id is already known.
    Resp2 {
        redirect: Option<watch::Receiver<Option<i64>>>,
    },
}

/// A single connection to the server.
///
/// Not safe for concurrent use: one caller writes at a time and waits
/// for the reply; concurrency comes from the pool. A private reader
/// task classifies incoming frames as replies or push frames.
pub(crate) struct Conn {
    sink: SplitSink<Framed<TcpStream, ValueCodec>, Vec<u8>>,
    replies: mpsc::Receiver<RimcuResult<Value>>,
    reader: JoinHandle<()>,
    id: i64,
    response_timeout: Duration,
    poisoned: bool,
    in_flight: bool,
}

impl Conn {
    /// Dials `addr` and runs the handshake for the requested mode.
    pub(crate) async fn connect(
        addr: &str,
        handshake: Handshake,
        invalidations: Option<Arc<dyn InvalidationSink>>,
        response_timeout: Duration,
    ) -> RimcuResult<Conn> {
        let stream = time::timeout(response_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::from((ErrorKind::Timeout, "dial timed out")))??;
        stream.set_nodelay(true)?;

        let (sink, mut frames) = Framed::new(stream, ValueCodec).split();
        let (tx, replies) = mpsc::channel(1);
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Ok(Value::Push { kind, data })) => match kind {
                        PushKind::Invalidate => match (&invalidations, parse_invalidation(data)) {
                            (Some(sink), Some(invalidation)) => sink.invalidate(invalidation),
                            (None, _) => debug!("dropping invalidate push: no sink registered"),
                            (_, None) => warn!("dropping malformed invalidate push"),
                        },
                        other => debug!("dropping push frame {other:?}"),
                    },
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });

        let mut conn = Conn {
            sink,
            replies,
            reader,
            id: 0,
            response_timeout,
            poisoned: false,
            in_flight: false,
        };

        match handshake {
            Handshake::None => {}
            Handshake::Resp3Tracking => {
                let hello = conn.do_cmd(&cmd("HELLO").arg(3u64)).await?;
                if let Some(id) = hello.map_lookup("id") {
                    conn.id = id.clone().into_i64().unwrap_or(0);
                }
                conn.do_cmd(&cmd("CLIENT").arg("TRACKING").arg("ON"))
                    .await?
                    .into_status()?;
            }
            Handshake::Resp2 { redirect } => {
                conn.id = conn.do_cmd(&cmd("CLIENT").arg("ID")).await?.into_i64()?;
                let target = redirect.as_ref().and_then(|rx| *rx.borrow());
                if let Some(target) = target {
                    conn.do_cmd(
                        &cmd("CLIENT")
                            .arg("TRACKING")
                            .arg("on")
                            .arg("REDIRECT")
                            .arg(target),
                    )
                    .await?
                    .into_status()?;
                }
            }
        }
        Ok(conn)
    }

    /// The server-assigned client id, or 0 when the handshake did not
    /// learn one.
    pub(crate) fn client_id(&self) -> i64 {
        self.id
    }

    /// Sends one command and waits for its reply.
    ///
    /// On a transport failure or a missed deadline the connection is
    /// poisoned: the reply slot has no consumer anymore, so the pool
    /// destroys it instead of reusing it.
    pub(crate) async fn do_cmd(&mut self, command: &Cmd) -> RimcuResult<Value> {
        if self.poisoned {
            return Err(closed_connection_error());
        }
        self.in_flight = true;
        if let Err(err) = self.sink.send(command.get_packed_command()).await {
            self.poisoned = true;
            return Err(err);
        }
        match time::timeout(self.response_timeout, self.replies.recv()).await {
            Err(_) => {
                self.poisoned = true;
                Err(Error::from((
                    ErrorKind::Timeout,
                    "no reply before the response deadline",
                )))
            }
            Ok(None) => {
                self.poisoned = true;
                Err(closed_connection_error())
            }
            Ok(Some(reply)) => {
                self.in_flight = false;
                if let Err(err) = &reply {
                    if err.is_transport_error() {
                        self.poisoned = true;
                    }
                }
                reply
            }
        }
    }

    /// Waits for a server-initiated frame; used after `SUBSCRIBE`.
    pub(crate) async fn recv(&mut self) -> RimcuResult<Value> {
        match self.replies.recv().await {
            Some(item) => item,
            None => Err(closed_connection_error()),
        }
    }

    /// True when the connection can still be handed out.
    pub(crate) fn is_open(&self) -> bool {
        !self.poisoned && !self.reader.is_finished()
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.is_open() && !self.in_flight
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn parse_invalidation(data: Vec<Value>) -> Option<Invalidation> {
    match data.into_iter().next() {
        Some(Value::Array(items)) => {
            let keys = items
                .into_iter()
                .map(|item| item.into_string().ok())
                .collect::<Option<Vec<_>>>()?;
            Some(Invalidation::Keys(keys))
        }
        Some(Value::BulkString(key)) => {
            Some(Invalidation::Keys(vec![String::from_utf8(key).ok()?]))
        }
        Some(Value::Int(slot)) if (0..i64::from(SLOT_COUNT)).contains(&slot) => {
            Some(Invalidation::Slot(slot as u16))
        }
        Some(Value::Nil) => Some(Invalidation::All),
        _ => None,
    }
}
