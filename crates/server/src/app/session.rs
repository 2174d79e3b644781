use super::auth::AuthContext;
use super::uploads::{parse_file_handle, upload_attachment};
use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use chrono::Utc;
use courier_broker::BrokerError;
use courier_proto::{DeliveryStatus, DirectMessage, DirectMessageInput, ErrorFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A full queue suspends the socket reader, pushing backpressure onto the
/// client.
const INGRESS_QUEUE_CAPACITY: usize = 100;
/// Interchangeable workers draining the ingress queue. More than one worker
/// trades per-sender ordering for throughput; set to 1 for strict FIFO.
const MAX_WORKERS: usize = 10;
const OUTBOUND_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    receiver_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SessionQuery>,
    Extension(auth): Extension<AuthContext>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth, query.receiver_id))
}

/// Runs one session to completion: takeover, presence publish, history
/// flush, steady-state pumps, teardown.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    auth: AuthContext,
    receiver_id: Option<String>,
) {
    let (mut sink, stream) = socket.split();
    let user_id = auth.identity.uid.clone();

    let Some(receiver_id) = receiver_id.filter(|peer| !peer.is_empty()) else {
        send_error(&mut sink, "Receiver ID is required").await;
        return;
    };

    // Takeover: a prior session for this user still owns a consumer under
    // this tag until we displace it.
    match state.storage.is_present(&user_id).await {
        Ok(true) => {
            state.metrics.mark_takeover();
            if let Err(err) = state.broker.cancel(&user_id).await {
                warn!(user = %user_id, "prior consumer cancel failed: {}", err);
            }
        }
        Ok(false) => {}
        Err(err) => warn!(user = %user_id, "presence probe failed: {}", err),
    }

    match state.storage.mark_presence(&user_id).await {
        Ok(marker) => debug!(user = %user_id, session = %marker, "presence mark written"),
        Err(err) => {
            error!(user = %user_id, "presence publish failed: {}", err);
            send_error(&mut sink, "Failed to register session").await;
            return;
        }
    }

    state.metrics.incr_sessions();
    info!(user = %user_id, peer = %receiver_id, "session opened");

    let token = CancellationToken::new();
    run_session(&state, sink, stream, &auth, &user_id, &receiver_id, &token).await;
    token.cancel();

    // Idempotent, best-effort teardown: both calls are safe to repeat and
    // safe to race with a takeover from a newer session.
    if let Err(err) = state.broker.cancel(&user_id).await {
        debug!(user = %user_id, "consumer cancel during teardown: {}", err);
    }
    if let Err(err) = state.storage.clear_presence(&user_id).await {
        warn!(user = %user_id, "presence cleanup failed: {}", err);
    }
    state.metrics.decr_sessions();
    info!(user = %user_id, "session closed");
}

async fn run_session(
    state: &Arc<AppState>,
    mut sink: SplitSink<WebSocket, Message>,
    mut stream: SplitStream<WebSocket>,
    auth: &AuthContext,
    user_id: &str,
    receiver_id: &str,
    token: &CancellationToken,
) {
    // History flush precedes any steady-state egress write on this socket.
    let history = match state.storage.history(user_id, receiver_id).await {
        Ok(history) => history,
        Err(err) => {
            error!(user = %user_id, "history query failed: {}", err);
            send_error(&mut sink, "Failed to retrieve message history").await;
            return;
        }
    };
    for message in history.iter() {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(user = %user_id, "history encode failed: {}", err);
                send_error(&mut sink, "Failed to send message history").await;
                return;
            }
        };
        if let Err(err) = sink.send(Message::Text(frame.into())).await {
            warn!(user = %user_id, "history send failed: {}", err);
            return;
        }
    }

    // Single writer task owns the sink from here on.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let writer_token = token.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                writer_token.cancel();
                break;
            }
        }
    });

    // Bounded ingress queue drained by interchangeable workers.
    let (job_tx, job_rx) = mpsc::channel::<DirectMessageInput>(INGRESS_QUEUE_CAPACITY);
    let job_rx = Arc::new(Mutex::new(job_rx));
    for _ in 0..MAX_WORKERS {
        let state = Arc::clone(state);
        let jobs = Arc::clone(&job_rx);
        let worker_token = token.clone();
        let sender = user_id.to_string();
        let receiver = receiver_id.to_string();
        let bearer = auth.bearer.clone();
        tokio::spawn(async move {
            loop {
                let job = select! {
                    _ = worker_token.cancelled() => None,
                    job = async { jobs.lock().await.recv().await } => job,
                };
                let Some(input) = job else { break };
                process_input(&state, input, &sender, &receiver, &bearer).await;
            }
        });
    }

    // Egress: consume the shared queue under this user's tag. The queue is
    // bound with a wildcard, so every delivery must be filtered by receiver
    // before it reaches the socket.
    let egress_tx = outbound_tx.clone();
    let egress_user = user_id.to_string();
    let egress_metrics = Arc::clone(&state.metrics);
    let mut pump = match state
        .broker
        .consume(user_id, move |payload| {
            let egress_tx = egress_tx.clone();
            let egress_user = egress_user.clone();
            let egress_metrics = Arc::clone(&egress_metrics);
            async move {
                let message: DirectMessage = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("unreadable broker delivery dropped: {}", err);
                        return Ok(());
                    }
                };
                if !should_forward(&message, &egress_user) {
                    return Ok(());
                }
                let frame =
                    String::from_utf8(payload).map_err(|_| BrokerError::Consume)?;
                egress_tx
                    .send(frame)
                    .await
                    .map_err(|_| BrokerError::Consume)?;
                egress_metrics.mark_egress();
                Ok(())
            }
        })
        .await
    {
        Ok(pump) => pump,
        Err(err) => {
            error!(user = %user_id, "broker subscribe failed: {}", err);
            return;
        }
    };

    // Ingress pump. Consume-pump exit (takeover, channel fault) counts as a
    // disconnect.
    loop {
        select! {
            _ = token.cancelled() => break,
            _ = &mut pump => {
                debug!(user = %user_id, "egress pump ended");
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !enqueue_input(state, &job_tx, user_id, text.as_bytes()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !enqueue_input(state, &job_tx, user_id, &data).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(user = %user_id, "socket read failed: {}", err);
                        break;
                    }
                }
            }
        }
    }

    token.cancel();
    pump.abort();
    drop(job_tx);
    // Workers finish their current job on their own; queued leftovers are
    // discarded here.
    {
        let mut jobs = job_rx.lock().await;
        while jobs.try_recv().is_ok() {}
    }
}

/// Parses one client frame and enqueues it, suspending when the queue is
/// full. Returns false when the session must terminate.
async fn enqueue_input(
    state: &Arc<AppState>,
    job_tx: &mpsc::Sender<DirectMessageInput>,
    user_id: &str,
    bytes: &[u8],
) -> bool {
    let input: DirectMessageInput = match serde_json::from_slice(bytes) {
        Ok(input) => input,
        Err(err) => {
            warn!(user = %user_id, "malformed client frame: {}", err);
            return false;
        }
    };
    state.metrics.mark_ingress();
    job_tx.send(input).await.is_ok()
}

/// Ingress pipeline for one client-authored message: optional attachment
/// upload, presence-dependent status, persistence, publish. Every failure
/// drops the message; there are no retries on this path.
async fn process_input(
    state: &Arc<AppState>,
    input: DirectMessageInput,
    sender_id: &str,
    receiver_id: &str,
    bearer: &str,
) {
    let mut content = input.content;
    let mut file_path = String::new();
    if input.content_type.is_files() {
        match upload_attachment(&state.http, &state.config.files_service_url, bearer, &content)
            .await
        {
            Ok((200, body)) => match parse_file_handle(&body) {
                Some(handle) => {
                    content = handle.clone();
                    file_path = handle;
                }
                None => {
                    warn!(sender = %sender_id, "file response decode failed; message dropped");
                    state.metrics.mark_upload_failed();
                    return;
                }
            },
            Ok((status, _)) => {
                warn!(sender = %sender_id, status, "file upload rejected; message dropped");
                state.metrics.mark_upload_failed();
                return;
            }
            Err(err) => {
                warn!(sender = %sender_id, "file upload failed: {}; message dropped", err);
                state.metrics.mark_upload_failed();
                return;
            }
        }
    }

    let present = match state.storage.is_present(receiver_id).await {
        Ok(present) => present,
        Err(err) => {
            warn!(receiver = %receiver_id, "presence probe failed: {}", err);
            false
        }
    };

    let message = DirectMessage {
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        content,
        content_type: input.content_type,
        file_path,
        status: DeliveryStatus::for_presence(present),
        created_at: Utc::now().timestamp(),
    };

    if let Err(err) = state.storage.insert_message(&message).await {
        error!(sender = %sender_id, "message persist failed: {}", err);
        state.metrics.mark_dropped();
        return;
    }
    state.metrics.mark_persisted();

    let payload = match serde_json::to_vec(&message) {
        Ok(payload) => payload,
        Err(err) => {
            error!(sender = %sender_id, "message encode failed: {}", err);
            state.metrics.mark_dropped();
            return;
        }
    };
    if let Err(err) = state.broker.publish(receiver_id, &payload).await {
        error!(receiver = %receiver_id, "message publish failed: {}", err);
        state.metrics.mark_dropped();
        return;
    }
    state.metrics.mark_published();
}

/// The shared queue sees all traffic; only frames addressed to this session's
/// user may reach its socket.
fn should_forward(message: &DirectMessage, user_id: &str) -> bool {
    message.receiver_id == user_id
}

async fn send_error(sink: &mut SplitSink<WebSocket, Message>, message: &str) {
    let frame = ErrorFrame::new(message).to_json();
    if let Err(err) = sink.send(Message::Text(frame.into())).await {
        debug!("error frame send failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_proto::ContentKind;

    fn message_for(receiver: &str) -> DirectMessage {
        DirectMessage {
            sender_id: "a".to_string(),
            receiver_id: receiver.to_string(),
            content: "yo".to_string(),
            content_type: ContentKind::Text,
            file_path: String::new(),
            status: DeliveryStatus::DeliveredOnline,
            created_at: 0,
        }
    }

    #[test]
    fn egress_forwards_only_to_addressee() {
        assert!(should_forward(&message_for("b"), "b"));
        assert!(!should_forward(&message_for("b"), "a"));
        assert!(!should_forward(&message_for("b"), ""));
    }

    #[test]
    fn session_query_tolerates_missing_receiver() {
        let query: SessionQuery = serde_json::from_str("{}").unwrap();
        assert!(query.receiver_id.is_none());
        let query: SessionQuery =
            serde_json::from_str("{\"receiver_id\":\"peer\"}").unwrap();
        assert_eq!(query.receiver_id.as_deref(), Some("peer"));
    }

    #[test]
    fn worker_pool_bounds() {
        assert_eq!(INGRESS_QUEUE_CAPACITY, 100);
        assert_eq!(MAX_WORKERS, 10);
    }
}
