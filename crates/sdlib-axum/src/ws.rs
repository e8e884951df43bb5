//! WebSocket event stream with topic subscriptions.
//!
//! One bidirectional connection per client. The server pushes
//! `AppEvent` JSON frames; the client narrows or widens its topics with
//! control frames:
//!
//! ```json
//! { "subscribe": ["queue", "downloads"] }
//! { "unsubscribe": ["downloads"] }
//! ```
//!
//! New connections start subscribed to every topic.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use sdlib_core::Topic;

use crate::state::AppState;

/// All topics, the initial subscription of a fresh connection.
const ALL_TOPICS: [Topic; 4] = [
    Topic::Queue,
    Topic::Generations,
    Topic::Models,
    Topic::Downloads,
];

/// Topic control frame sent by clients.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ControlFrame {
    #[serde(default)]
    subscribe: Vec<Topic>,
    #[serde(default)]
    unsubscribe: Vec<Topic>,
}

/// Apply a control frame to the current topic set.
pub(crate) fn apply_control_frame(topics: &mut HashSet<Topic>, frame: &ControlFrame) {
    for topic in &frame.subscribe {
        topics.insert(*topic);
    }
    for topic in &frame.unsubscribe {
        topics.remove(topic);
    }
}

/// Upgrade handler for `GET /api/events`.
pub async fn events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let mut topics: HashSet<Topic> = ALL_TOPICS.into_iter().collect();
    let mut subscription = state.bus.subscribe(topics.iter().copied());
    let subscriber_id = subscription.id();
    debug!(subscriber = subscriber_id, "event stream connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(control) => {
                                apply_control_frame(&mut topics, &control);
                                state.bus.set_topics(subscriber_id, topics.iter().copied());
                            }
                            Err(e) => {
                                debug!(subscriber = subscriber_id, error = %e, "bad control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber = subscriber_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    state.bus.unsubscribe(subscriber_id);
    debug!(subscriber = subscriber_id, "event stream disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_adjust_the_topic_set() {
        let mut topics: HashSet<Topic> = ALL_TOPICS.into_iter().collect();

        let frame: ControlFrame =
            serde_json::from_str(r#"{"unsubscribe": ["downloads", "models"]}"#).unwrap();
        apply_control_frame(&mut topics, &frame);
        assert!(!topics.contains(&Topic::Downloads));
        assert!(!topics.contains(&Topic::Models));
        assert!(topics.contains(&Topic::Queue));

        let frame: ControlFrame = serde_json::from_str(r#"{"subscribe": ["models"]}"#).unwrap();
        apply_control_frame(&mut topics, &frame);
        assert!(topics.contains(&Topic::Models));
    }

    #[test]
    fn unknown_topics_fail_to_parse() {
        let result = serde_json::from_str::<ControlFrame>(r#"{"subscribe": ["nonsense"]}"#);
        assert!(result.is_err());
    }
}
