//! # Progress Channel Client
//!
//! Maintains the server-push WebSocket stream that carries progress events
//! for one session. The backend routes events by session id, so the stream is
//! addressed as `{ws_base_url}/ws/{session_id}`.
//!
//! ## Lifecycle:
//! Each channel moves through `Connecting → Open → Closed`. A reader task
//! owns the socket once connected; it decodes every text frame into a
//! [`ProgressEvent`] and forwards it over an mpsc channel to whoever opened
//! the stream. The task closes the channel on its own after a terminal stage
//! (`completed` gets a short display-settling delay first, `error` closes
//! immediately), and the owner can close it at any time through the handle.
//!
//! ## Failure policy:
//! - Connection failure is reported as `ChannelUnavailable` and is the
//!   caller's problem to absorb (the orchestrator degrades instead of dying).
//! - A frame that does not decode is logged and dropped; it never tears the
//!   channel down and never reaches the caller.

use crate::error::AnalysisError;
use crate::progress::{ProgressEvent, StageTag};
use crate::session::SessionId;

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Buffered events between the reader task and the consumer. The backend
/// emits at most a handful of frames per second, so a small buffer is plenty.
const EVENT_BUFFER: usize = 32;

/// Where a channel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Owner-side handle for one progress channel.
///
/// `close()` is idempotent: it only signals the reader task, so calling it
/// repeatedly, or after the task already shut itself down, is harmless.
pub struct ChannelHandle {
    close_tx: watch::Sender<bool>,
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelHandle {
    pub(crate) fn new(close_tx: watch::Sender<bool>, state: Arc<Mutex<ChannelState>>) -> Self {
        Self { close_tx, state }
    }

    /// Signal the reader task to shut down and mark the channel closed.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
        *self.state.lock().unwrap() = ChannelState::Closed;
    }

    /// Current lifecycle state of the channel.
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    #[cfg(test)]
    pub(crate) fn state_ref(&self) -> Arc<Mutex<ChannelState>> {
        Arc::clone(&self.state)
    }
}

/// Decode one wire frame into a progress event.
///
/// Returns `None` for malformed frames; the caller drops them. Decoding
/// failure must never propagate — a bad frame costs one log line, not the
/// channel.
fn decode_frame(text: &str) -> Option<ProgressEvent> {
    match serde_json::from_str::<ProgressEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!("Dropping malformed progress frame: {}", err);
            None
        }
    }
}

/// Open the progress channel for one session.
///
/// On success returns the owner handle plus the stream of decoded events.
/// The event stream ends when the channel closes for any reason; zero events
/// before the end is a valid (degenerate) run.
pub async fn connect(
    ws_base_url: &str,
    session_id: &SessionId,
    connect_timeout: Duration,
    settle_delay: Duration,
) -> Result<(ChannelHandle, mpsc::Receiver<ProgressEvent>), AnalysisError> {
    let url = format!("{}/ws/{}", ws_base_url.trim_end_matches('/'), session_id);

    let state = Arc::new(Mutex::new(ChannelState::Connecting));

    let stream = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            *state.lock().unwrap() = ChannelState::Closed;
            return Err(AnalysisError::ChannelUnavailable(err.to_string()));
        }
        Err(_) => {
            *state.lock().unwrap() = ChannelState::Closed;
            return Err(AnalysisError::ChannelUnavailable(format!(
                "connect timed out after {:?}",
                connect_timeout
            )));
        }
    };

    info!("Progress channel connected: {}", url);
    *state.lock().unwrap() = ChannelState::Open;

    let (close_tx, close_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let handle = ChannelHandle::new(close_tx, Arc::clone(&state));
    tokio::spawn(run_reader(stream, event_tx, close_rx, state, settle_delay));

    Ok((handle, event_rx))
}

/// Reader task: pump frames until the owner closes the handle, the server
/// closes the socket, or a terminal stage is observed.
async fn run_reader(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: mpsc::Sender<ProgressEvent>,
    mut close_rx: watch::Receiver<bool>,
    state: Arc<Mutex<ChannelState>>,
    settle_delay: Duration,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                debug!("Progress channel closed by owner");
                break;
            }
            frame = read.next() => {
                match frame {
                    None => {
                        debug!("Progress channel closed by server");
                        break;
                    }
                    Some(Err(err)) => {
                        // Mid-cycle drop is non-fatal to the cycle; the
                        // terminal request remains the source of truth.
                        warn!("Progress channel transport error: {}", err);
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let Some(event) = decode_frame(&text) else {
                            continue;
                        };

                        let terminal_success = event.stage == StageTag::Completed
                            && event.progress.clamp(0, 100) == 100;
                        let terminal_error = event.stage == StageTag::Error;

                        if event_tx.send(event).await.is_err() {
                            // Consumer is gone; nothing left to report to.
                            break;
                        }

                        if terminal_success {
                            // Grace period so the final frame can render
                            // before teardown; an owner close cuts it short.
                            tokio::select! {
                                _ = tokio::time::sleep(settle_delay) => {}
                                _ = close_rx.changed() => {}
                            }
                            break;
                        }

                        if terminal_error {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Progress channel received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong/binary frames carry no progress data.
                    }
                }
            }
        }
    }

    *state.lock().unwrap() = ChannelState::Closed;
    let _ = write.send(Message::Close(None)).await;
}
