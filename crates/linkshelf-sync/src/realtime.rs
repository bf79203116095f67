//! Realtime change feed over the store's Phoenix-channel websocket.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::feed::{ChangeFeed, ChangeKind, FeedError, FeedSubscription, FeedTopic, RawChange};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const HEARTBEAT_TOPIC: &str = "phoenix";
const JOIN_REF: &str = "1";

/// Decoded realtime protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeFrame {
    Change { topic: String, change: RawChange },
    Reply {
        topic: String,
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    ChannelClosed { topic: String },
    ChannelError { topic: String },
    Other,
}

/// Channel topic for a feed topic name.
#[must_use]
pub fn channel_topic(topic: &FeedTopic) -> String {
    format!("realtime:{}", topic.name)
}

#[must_use]
pub fn join_message(topic: &FeedTopic, access_token: &str) -> Value {
    json!({
        "topic": channel_topic(topic),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": topic.schema,
                    "table": topic.table,
                }],
            },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

#[must_use]
pub fn heartbeat_message(reference: u64) -> Value {
    json!({
        "topic": HEARTBEAT_TOPIC,
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

#[must_use]
pub fn leave_message(topic: &FeedTopic, reference: u64) -> Value {
    json!({
        "topic": channel_topic(topic),
        "event": "phx_leave",
        "payload": {},
        "ref": reference.to_string(),
        "join_ref": JOIN_REF,
    })
}

/// Parses one text frame.
pub fn parse_frame(text: &str) -> Result<RealtimeFrame, FeedError> {
    let value: Value = serde_json::from_str(text)?;
    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Protocol("frame is missing topic".to_string()))?
        .to_string();
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Protocol("frame is missing event".to_string()))?;
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "postgres_changes" => {
            let data = payload
                .get("data")
                .ok_or_else(|| FeedError::Protocol("change frame is missing data".to_string()))?;
            let label = data
                .get("type")
                .or_else(|| data.get("eventType"))
                .and_then(Value::as_str)
                .ok_or_else(|| FeedError::Protocol("change frame is missing type".to_string()))?;
            let kind = ChangeKind::parse(label)
                .ok_or_else(|| FeedError::Protocol(format!("unsupported change type: {label}")))?;
            Ok(RealtimeFrame::Change {
                topic,
                change: RawChange {
                    kind,
                    new: non_empty_row(data.get("record")),
                    old: non_empty_row(data.get("old_record")),
                },
            })
        }
        "phx_reply" => Ok(RealtimeFrame::Reply {
            topic,
            reference: value.get("ref").and_then(Value::as_str).map(str::to_string),
            ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        }),
        "phx_close" => Ok(RealtimeFrame::ChannelClosed { topic }),
        "phx_error" => Ok(RealtimeFrame::ChannelError { topic }),
        _ => Ok(RealtimeFrame::Other),
    }
}

fn non_empty_row(row: Option<&Value>) -> Option<Value> {
    row.filter(|value| value.as_object().is_some_and(|object| !object.is_empty()))
        .cloned()
}

/// Websocket change feed client.
#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    url: String,
    access_token: String,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    buffer: usize,
}

impl RealtimeFeed {
    pub fn new(config: &StoreConfig) -> Result<Self, FeedError> {
        let url = config
            .realtime_url()
            .map_err(|error| FeedError::InvalidUrl(error.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(FeedError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url: url.into(),
            access_token: config.access_token.clone(),
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            buffer: config.feed_buffer.max(1),
        })
    }

    async fn await_join(&self, reader: &mut WsReader, channel: &str) -> Result<(), FeedError> {
        let join = async {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => return Err(FeedError::Closed),
                    Ok(_) => continue,
                    Err(error) => return Err(FeedError::WebSocket(error.to_string())),
                };
                match parse_frame(text.as_str()) {
                    Ok(RealtimeFrame::Reply {
                        topic,
                        reference,
                        ok,
                        response,
                    }) if topic == channel && reference.as_deref() == Some(JOIN_REF) => {
                        return if ok {
                            Ok(())
                        } else {
                            Err(FeedError::Rejected(response.to_string()))
                        };
                    }
                    Ok(_) => {}
                    Err(error) => debug!(%error, "skipping frame while joining"),
                }
            }
            Err(FeedError::Closed)
        };
        timeout(self.connect_timeout, join).await.map_err(|_| {
            FeedError::Timeout(format!("join timeout after {:?}", self.connect_timeout))
        })?
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, topic: &FeedTopic) -> Result<FeedSubscription, FeedError> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                FeedError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| FeedError::Connection(error.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        send_json(&mut writer, &join_message(topic, self.access_token.as_str())).await?;
        let channel = channel_topic(topic);
        self.await_join(&mut reader, channel.as_str()).await?;
        info!(%channel, "joined realtime channel");

        let (events, receiver) = mpsc::channel(self.buffer);
        let (shutdown, shutdown_rx) = oneshot::channel();
        tokio::spawn(run_channel(
            topic.clone(),
            writer,
            reader,
            events,
            shutdown_rx,
            self.heartbeat_interval,
        ));
        Ok(FeedSubscription::new(topic.clone(), receiver, Some(shutdown)))
    }
}

async fn run_channel(
    topic: FeedTopic,
    mut writer: WsWriter,
    mut reader: WsReader,
    events: mpsc::Sender<RawChange>,
    mut shutdown: oneshot::Receiver<()>,
    heartbeat_interval: Duration,
) {
    let channel = channel_topic(&topic);
    let mut next_ref: u64 = 2;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                if let Err(error) = send_json(&mut writer, &leave_message(&topic, next_ref)).await {
                    debug!(%channel, %error, "leave failed");
                }
                let _ = writer.send(Message::Close(None)).await;
                break;
            }
            _ = heartbeat.tick() => {
                if let Err(error) = send_json(&mut writer, &heartbeat_message(next_ref)).await {
                    warn!(%channel, %error, "heartbeat failed");
                    break;
                }
                next_ref += 1;
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                    Ok(RealtimeFrame::Change { topic: frame_topic, change }) if frame_topic == channel => {
                        if events.send(change).await.is_err() {
                            break;
                        }
                    }
                    Ok(RealtimeFrame::ChannelClosed { topic: frame_topic })
                    | Ok(RealtimeFrame::ChannelError { topic: frame_topic }) if frame_topic == channel => {
                        warn!(%channel, "channel closed by store");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%channel, %error, "realtime frame parse error"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%channel, %error, "websocket read error");
                    break;
                }
            },
        }
    }
    debug!(%channel, "realtime channel task stopped");
}

async fn send_json(writer: &mut WsWriter, value: &Value) -> Result<(), FeedError> {
    let text = serde_json::to_string(value)?;
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|error| FeedError::WebSocket(error.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        RealtimeFrame, channel_topic, heartbeat_message, join_message, leave_message, parse_frame,
    };
    use crate::feed::{Change, ChangeKind, FeedTopic, decode_change};
    use crate::record::RecordId;

    #[test]
    fn join_requests_all_changes_for_the_table() {
        let topic = FeedTopic::default();
        let message = join_message(&topic, "token-1");
        assert_eq!(message["topic"], json!("realtime:realtime bookmarks"));
        assert_eq!(message["event"], json!("phx_join"));
        assert_eq!(
            message["payload"]["config"]["postgres_changes"],
            json!([{"event": "*", "schema": "public", "table": "bookmarks"}])
        );
        assert_eq!(message["payload"]["access_token"], json!("token-1"));
    }

    #[test]
    fn heartbeat_and_leave_carry_refs() {
        assert_eq!(heartbeat_message(7)["topic"], json!("phoenix"));
        assert_eq!(heartbeat_message(7)["ref"], json!("7"));
        let leave = leave_message(&FeedTopic::default(), 8);
        assert_eq!(leave["event"], json!("phx_leave"));
        assert_eq!(leave["topic"], json!(channel_topic(&FeedTopic::default())));
    }

    #[test]
    fn insert_frame_maps_to_raw_change() {
        let frame = json!({
            "topic": "realtime:realtime bookmarks",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "INSERT",
                    "schema": "public",
                    "table": "bookmarks",
                    "record": {"id": 1, "title": "Docs", "url": "https://x", "user_id": "user-a"},
                    "old_record": {}
                },
                "ids": [41]
            },
            "ref": null
        });
        let parsed = parse_frame(&frame.to_string()).expect("frame should parse");
        let RealtimeFrame::Change { topic, change } = parsed else {
            panic!("expected change frame");
        };
        assert_eq!(topic, "realtime:realtime bookmarks");
        assert_eq!(change.kind, ChangeKind::Insert);
        assert!(change.old.is_none());
        let decoded = decode_change(change).expect("change should decode");
        assert!(matches!(decoded, Change::Insert(ref record) if record.id == RecordId(1)));
    }

    #[test]
    fn delete_frame_keeps_old_identity() {
        let frame = json!({
            "topic": "realtime:realtime bookmarks",
            "event": "postgres_changes",
            "payload": {"data": {"type": "DELETE", "old_record": {"id": 4}}}
        });
        let RealtimeFrame::Change { change, .. } =
            parse_frame(&frame.to_string()).expect("frame should parse")
        else {
            panic!("expected change frame");
        };
        assert_eq!(
            decode_change(change).expect("delete should decode"),
            Change::Delete(RecordId(4))
        );
    }

    #[test]
    fn join_reply_reports_status() {
        let frame = json!({
            "topic": "realtime:realtime bookmarks",
            "event": "phx_reply",
            "payload": {"status": "error", "response": {"reason": "unauthorized"}},
            "ref": "1"
        });
        let parsed = parse_frame(&frame.to_string()).expect("frame should parse");
        assert!(matches!(
            parsed,
            RealtimeFrame::Reply { ok: false, ref reference, .. } if reference.as_deref() == Some("1")
        ));
    }

    #[test]
    fn unknown_and_broken_frames() {
        let presence = json!({"topic": "realtime:x", "event": "presence_state", "payload": {}});
        assert_eq!(
            parse_frame(&presence.to_string()).expect("frame should parse"),
            RealtimeFrame::Other
        );
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"event":"phx_reply"}"#).is_err());
        let unknown_type = json!({
            "topic": "realtime:x",
            "event": "postgres_changes",
            "payload": {"data": {"type": "TRUNCATE"}}
        });
        assert!(parse_frame(&unknown_type.to_string()).is_err());
    }
}
