//! WebSocket endpoint and per-connection worker loops.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router as WsRouter,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{Cache, SaveOutcome};
use crate::config::Settings;
use crate::event::{Event, Verdict};
use crate::filter::{Filter, MatcherSet};
use crate::limiter::RateLimiter;
use crate::message::{parse_client_msg, ClientMsg, MsgError, ServerMsg};
use crate::router::Router;

/// Outbound channel depth per connection.
const SENDER_LEN: usize = 3;
/// Grace period for draining the sender after the receiver ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared relay state handed to every connection.
pub struct RelayState {
    pub settings: Settings,
    pub cache: Cache,
    pub router: Router,
}

impl RelayState {
    pub fn new(settings: Settings) -> Self {
        Self {
            cache: Cache::new(settings.cache_capacity),
            router: Router::new(),
            settings,
        }
    }
}

/// Start the relay WebSocket server.
pub async fn serve_ws(
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = WsRouter::new().route("/", get(handler)).with_state(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection worker.
async fn handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| process(socket, state))
}

/// Run one connection: a receiver task and a sender task sharing a bounded
/// channel. When either side ends, the other is shut down and the router
/// entry is removed.
async fn process(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = hex::encode(rand::thread_rng().gen::<[u8; 8]>());
    info!(%conn_id, "connection open");

    let (ws_tx, ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(SENDER_LEN);
    state.router.register(&conn_id, tx.clone());

    let mut recv_task = tokio::spawn(receiver_loop(ws_rx, tx, state.clone(), conn_id.clone()));
    let mut send_task = tokio::spawn(sender_loop(ws_tx, rx, conn_id.clone()));

    let (recv_res, send_res) = tokio::select! {
        r = &mut recv_task => {
            // removing the router entry drops the last sender clone, which
            // lets the sender task drain and emit a close frame
            state.router.delete(&conn_id);
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, &mut send_task).await;
            if drained.is_err() {
                send_task.abort();
            }
            (Some(r), drained.ok())
        }
        r = &mut send_task => {
            recv_task.abort();
            state.router.delete(&conn_id);
            (None, Some(r))
        }
    };

    for res in [recv_res, send_res].into_iter().flatten() {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%conn_id, %err, "connection error"),
            // the task was aborted during teardown
            Err(_) => {}
        }
    }
    info!(%conn_id, "connection closed");
}

async fn receiver_loop(
    mut ws_rx: SplitStream<WebSocket>,
    tx: mpsc::Sender<ServerMsg>,
    state: Arc<RelayState>,
    conn_id: String,
) -> Result<()> {
    let mut limiter = RateLimiter::new(state.settings.rate, state.settings.burst);
    loop {
        if !limiter.acquire().await {
            return Ok(());
        }
        let frame = match ws_rx.next().await {
            None => return Ok(()),
            Some(Err(err)) => {
                // abrupt disconnects are a normal way for clients to leave
                debug!(%conn_id, %err, "receive ended");
                return Ok(());
            }
            Some(Ok(frame)) => frame,
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(%conn_id, "payload is not utf8");
                    continue;
                }
            },
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if text.len() > state.settings.max_message_len {
            bail!("client message is too long: len={}", text.len());
        }
        debug!(%conn_id, msg = %text, "recv");
        match parse_client_msg(&text) {
            Ok(msg) => handle_msg(msg, &tx, &state, &conn_id).await?,
            Err(MsgError::InvalidEvent {
                id: Some(id),
                source,
            }) => {
                warn!(%conn_id, %source, "received invalid event");
                send(&tx, ServerMsg::ok_invalid(id, source.to_string())).await?;
            }
            Err(err) => {
                warn!(%conn_id, %err, "received invalid msg");
            }
        }
    }
}

async fn handle_msg(
    msg: ClientMsg,
    tx: &mpsc::Sender<ServerMsg>,
    state: &RelayState,
    conn_id: &str,
) -> Result<()> {
    match msg {
        ClientMsg::Event(event) => handle_event(event, tx, state).await,
        ClientMsg::Req {
            subscription_id,
            filters,
        } => handle_req(subscription_id, filters, tx, state, conn_id).await,
        ClientMsg::Close { subscription_id } => {
            if let Err(err) = state.router.unsubscribe(conn_id, &subscription_id) {
                debug!(conn_id, %err, "close without subscription");
            }
            Ok(())
        }
        ClientMsg::Count {
            subscription_id,
            filters,
        } => {
            let count = state.cache.count(&filters);
            send(
                tx,
                ServerMsg::Count {
                    subscription_id,
                    count,
                    approximate: None,
                },
            )
            .await
        }
        ClientMsg::Auth { .. } => {
            debug!(conn_id, "auth response ignored");
            Ok(())
        }
        ClientMsg::Unknown { label, .. } => {
            debug!(conn_id, %label, "unknown message label");
            Ok(())
        }
    }
}

async fn handle_event(
    event: Event,
    tx: &mpsc::Sender<ServerMsg>,
    state: &RelayState,
) -> Result<()> {
    let event = Arc::new(event);
    match event.verify() {
        Err(err) => {
            return send(tx, ServerMsg::ok_invalid(&event.id, err.to_string())).await;
        }
        Ok(Verdict::BadId) => {
            return send(tx, ServerMsg::ok_invalid(&event.id, "event id does not match")).await;
        }
        Ok(Verdict::BadSig) => {
            return send(tx, ServerMsg::ok_invalid(&event.id, "bad signature")).await;
        }
        Ok(Verdict::Ok) => {}
    }
    if !event.is_fresh(unix_now()?) {
        return send(
            tx,
            ServerMsg::ok_invalid(&event.id, "created_at is out of the acceptable window"),
        )
        .await;
    }
    // saved before publishing so live deliveries stay queryable historically
    if state.cache.save(event.clone()) == SaveOutcome::Duplicate {
        return send(tx, ServerMsg::ok_duplicate(&event.id)).await;
    }
    state.router.publish(&event);
    send(tx, ServerMsg::ok_accepted(&event.id)).await
}

async fn handle_req(
    subscription_id: String,
    filters: Vec<Filter>,
    tx: &mpsc::Sender<ServerMsg>,
    state: &RelayState,
    conn_id: &str,
) -> Result<()> {
    if filters.len() > state.settings.max_filters + 2 {
        warn!(conn_id, count = filters.len(), "too many filters");
        let notice = format!("too many filters: {}", filters.len());
        return send(tx, ServerMsg::notice(notice)).await;
    }
    let mut valid = Vec::with_capacity(filters.len());
    let mut rejected = Vec::new();
    for filter in filters {
        match filter.check_min_prefix(state.settings.min_prefix) {
            Ok(()) => valid.push(filter),
            Err(err) => rejected.push(err.to_string()),
        }
    }
    if !rejected.is_empty() {
        send(tx, ServerMsg::notice(rejected.join("; "))).await?;
    }
    // the matcher set counts replayed events, so limits consumed here
    // carry over into live delivery
    let mut matchers = MatcherSet::new(valid);
    for event in state.cache.find_all(&mut matchers) {
        send(tx, ServerMsg::event(subscription_id.clone(), event)).await?;
    }
    send(tx, ServerMsg::eose(subscription_id.clone())).await?;
    if matchers.done() {
        // every filter hit its limit during replay
        if state.router.unsubscribe(conn_id, &subscription_id).is_ok() {
            debug!(conn_id, %subscription_id, "replaced subscription removed");
        }
        debug!(conn_id, %subscription_id, "subscription completed during replay");
        return Ok(());
    }
    match state.router.subscribe(conn_id, &subscription_id, matchers) {
        Ok(outcome) => debug!(conn_id, %subscription_id, ?outcome, "subscribed"),
        Err(err) => warn!(conn_id, %err, "subscribe failed"),
    }
    Ok(())
}

async fn sender_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMsg>,
    conn_id: String,
) -> Result<()> {
    while let Some(msg) = rx.recv().await {
        let json = serde_json::to_string(&msg)?;
        if let Err(err) = ws_tx.send(Message::Text(json.clone())).await {
            // writes against a closed peer are a normal termination
            debug!(%conn_id, %err, "send ended");
            return Ok(());
        }
        debug!(%conn_id, msg = %json, "send");
    }
    // every sender clone is gone: the connection is shutting down
    let _ = ws_tx.send(Message::Close(None)).await;
    Ok(())
}

async fn send(tx: &mpsc::Sender<ServerMsg>, msg: ServerMsg) -> Result<()> {
    tx.send(msg)
        .await
        .map_err(|_| anyhow::anyhow!("send channel closed"))
}

fn unix_now() -> Result<i64> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(now.as_secs() as i64)
}
