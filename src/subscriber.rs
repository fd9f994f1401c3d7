use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use log::{debug, error, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::cmd::cmd;
use crate::connection::{Conn, Handshake};
use crate::errors::{Error, ErrorKind, RimcuResult};
use crate::types::Value;

/// The channel the server publishes tracking invalidations on.
pub(crate) const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

/// The strings and list notification channels.
pub(crate) const STRINGS_CHANNEL: &str = "rimcu:strings";
pub(crate) const LIST_CHANNEL: &str = "rimcu:list";

pub(crate) struct SubscriberConfig {
    pub(crate) server_addr: String,
    pub(crate) password: Option<String>,
    pub(crate) channels: Vec<String>,
    /// Also subscribe to the tracking channel for redirected
    /// server-side invalidations.
    pub(crate) track_invalidations: bool,
    /// Issue `CLIENT TRACKING on REDIRECT <self> BCAST`; used against a
    /// cluster master, which cannot redirect other connections to us.
    pub(crate) bcast_tracking: bool,
    pub(crate) response_timeout: Duration,
}

/// Receives decoded notifications from the subscriber.
pub(crate) trait NotifHandler: Send + Sync + 'static {
    /// An application-published record arrived on `channel`.
    fn on_message(&self, channel: &str, payload: &[u8]);
    /// Raw keys arrived on the tracking channel.
    fn on_invalidate(&self, keys: Vec<String>);
    /// A (re)subscription just succeeded. Between the previous loss and
    /// this point invalidations may have been missed, so the handler
    /// purges its local cache here.
    fn on_subscribed(&self);
}

/// The long-lived subscription to one upstream shard.
///
/// Owns a background task that keeps a dedicated connection subscribed,
/// reconnecting with backoff after any receive error.
pub(crate) struct NotifSubscriber {
    task: JoinHandle<()>,
    client_id: watch::Receiver<Option<i64>>,
}

impl NotifSubscriber {
    pub(crate) fn start(cfg: SubscriberConfig, handler: Arc<dyn NotifHandler>) -> NotifSubscriber {
        let (ready, client_id) = watch::channel(None);
        let task = tokio::spawn(run(cfg, handler, ready));
        NotifSubscriber { task, client_id }
    }

    /// The subscriber connection's server-assigned client id; `None`
    /// until the first successful subscription, refreshed on reconnect.
    pub(crate) fn client_id(&self) -> watch::Receiver<Option<i64>> {
        self.client_id.clone()
    }

    /// Ends the subscription for good.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }

    /// Waits for the first successful subscription.
    pub(crate) async fn wait_ready(&self, deadline: Duration) -> RimcuResult<i64> {
        let mut rx = self.client_id.clone();
        time::timeout(deadline, async move {
            loop {
                if let Some(id) = *rx.borrow() {
                    return Ok(id);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::from((
                        ErrorKind::ConnectionClosed,
                        "subscriber task ended",
                    )));
                }
            }
        })
        .await
        .map_err(|_| {
            Error::from((
                ErrorKind::Timeout,
                "subscriber did not become ready before the deadline",
            ))
        })?
    }
}

impl Drop for NotifSubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reconnect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .without_max_times()
        .build()
}

async fn run(
    cfg: SubscriberConfig,
    handler: Arc<dyn NotifHandler>,
    ready: watch::Sender<Option<i64>>,
) {
    let mut backoff = reconnect_backoff();
    loop {
        match session(&cfg, &handler, &ready).await {
            Ok(()) => {
                // The stream was up and then went away; retry promptly.
                backoff = reconnect_backoff();
            }
            Err(err) => {
                error!("subscriber on {}: {err}", cfg.server_addr);
            }
        }
        let delay = backoff.next().unwrap_or(Duration::from_secs(2));
        time::sleep(delay).await;
    }
}

/// One subscription session: setup, purge, then receive until the
/// stream breaks. `Err` means setup never completed.
async fn session(
    cfg: &SubscriberConfig,
    handler: &Arc<dyn NotifHandler>,
    ready: &watch::Sender<Option<i64>>,
) -> RimcuResult<()> {
    let mut conn = Conn::connect(
        &cfg.server_addr,
        Handshake::None,
        None,
        cfg.response_timeout,
    )
    .await?;
    if let Some(password) = &cfg.password {
        conn.do_cmd(&cmd("AUTH").arg(password)).await?;
    }
    let id = conn.do_cmd(&cmd("CLIENT").arg("ID")).await?.into_i64()?;
    if cfg.bcast_tracking {
        conn.do_cmd(
            &cmd("CLIENT")
                .arg("TRACKING")
                .arg("on")
                .arg("REDIRECT")
                .arg(id)
                .arg("BCAST"),
        )
        .await?;
    }
    for channel in cfg.channels.iter().map(String::as_str).chain(
        cfg.track_invalidations
            .then_some(INVALIDATION_CHANNEL),
    ) {
        conn.do_cmd(&cmd("SUBSCRIBE").arg(channel)).await?;
    }

    // Coverage (re)starts here; everything cached before is suspect.
    handler.on_subscribed();
    let _ = ready.send(Some(id));
    debug!(
        "subscribed to {:?} on {} as client {id}",
        cfg.channels, cfg.server_addr
    );

    loop {
        match conn.recv().await {
            Ok(frame) => dispatch(frame, handler),
            Err(err) => {
                warn!("subscriber stream on {} ended: {err}", cfg.server_addr);
                return Ok(());
            }
        }
    }
}

fn dispatch(frame: Value, handler: &Arc<dyn NotifHandler>) {
    let items = match frame {
        Value::Array(items) => items,
        Value::Push { data, .. } => data,
        other => {
            debug!("subscriber: ignoring frame {other:?}");
            return;
        }
    };
    let mut items = items.into_iter();
    let kind = match items.next() {
        Some(Value::BulkString(name)) => name,
        Some(Value::SimpleString(name)) => name.into_bytes(),
        other => {
            warn!("subscriber: frame without a kind: {other:?}");
            return;
        }
    };
    match kind.as_slice() {
        b"message" => {
            let Some(channel) = items.next().and_then(|v| v.into_string().ok()) else {
                warn!("subscriber: message frame without a channel");
                return;
            };
            let Some(payload) = items.next() else {
                warn!("subscriber: message frame without a payload");
                return;
            };
            if channel == INVALIDATION_CHANNEL {
                match invalidated_keys(payload) {
                    Some(keys) if !keys.is_empty() => handler.on_invalidate(keys),
                    Some(_) => {}
                    None => warn!("subscriber: malformed invalidation payload"),
                }
            } else {
                match payload {
                    Value::BulkString(data) => handler.on_message(&channel, &data),
                    other => warn!("subscriber: non-binary payload on {channel}: {other:?}"),
                }
            }
        }
        // Confirmations can race the reply rendezvous on resubscribe.
        b"subscribe" | b"unsubscribe" => {}
        other => debug!(
            "subscriber: ignoring {} frame",
            String::from_utf8_lossy(other)
        ),
    }
}

fn invalidated_keys(payload: Value) -> Option<Vec<String>> {
    match payload {
        Value::Array(items) => items
            .into_iter()
            .map(|item| item.into_string().ok())
            .collect(),
        Value::BulkString(key) => Some(vec![String::from_utf8(key).ok()?]),
        Value::Nil => Some(Vec::new()),
        _ => None,
    }
}
