//! Relay wire codec.
//!
//! Frames are JSON arrays: `["REQ", id, filter...]`, `["CLOSE", id]` and
//! `["EVENT", event]` go out; `["EVENT", id, event]`, `["EOSE", id]`,
//! `["OK", id, accepted, message]`, `["NOTICE", message]` and
//! `["CLOSED", id, message]` come back.

use nostr::{Event, Filter};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame is not a JSON array")]
    NotAnArray,
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Missing or malformed field: {0}")]
    MissingField(&'static str),
    #[error("Invalid event payload: {0}")]
    InvalidEvent(String),
    #[error("Event {id} failed verification: {reason}")]
    Unverified { id: String, reason: String },
}

/// Messages sent from the client to a relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Event(Box<Event>),
}

impl ClientMessage {
    pub fn req<S: Into<String>>(subscription_id: S, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close<S: Into<String>>(subscription_id: S) -> Self {
        Self::Close(subscription_id.into())
    }

    pub fn event(event: Event) -> Self {
        Self::Event(Box::new(event))
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Req {
                subscription_id, ..
            } => Some(subscription_id),
            Self::Close(subscription_id) => Some(subscription_id),
            Self::Event(_) => None,
        }
    }

    pub fn is_req(&self) -> bool {
        matches!(self, Self::Req { .. })
    }

    pub fn as_json(&self) -> String {
        let frame = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                frame.extend(filters.iter().filter_map(|f| serde_json::to_value(f).ok()));
                Value::Array(frame)
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            Self::Event(event) => {
                json!(["EVENT", serde_json::to_value(event.as_ref()).unwrap_or(Value::Null)])
            }
        };
        frame.to_string()
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = parse_frame(json)?;
        let kind = frame_type(&frame)?;
        match kind {
            "REQ" => {
                let subscription_id = string_at(&frame, 1, "subscription_id")?;
                let filters = frame[2..]
                    .iter()
                    .map(|f| serde_json::from_value::<Filter>(f.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(Self::Close(string_at(&frame, 1, "subscription_id")?)),
            "EVENT" => Ok(Self::Event(Box::new(event_at(&frame, 1)?))),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Messages received from a relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn event<S: Into<String>>(subscription_id: S, event: Event) -> Self {
        Self::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn eose<S: Into<String>>(subscription_id: S) -> Self {
        Self::EndOfStoredEvents(subscription_id.into())
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Event {
                subscription_id, ..
            }
            | Self::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            Self::EndOfStoredEvents(subscription_id) => Some(subscription_id),
            Self::Ok { .. } | Self::Notice(_) => None,
        }
    }

    pub fn as_json(&self) -> String {
        let frame = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!([
                "EVENT",
                subscription_id,
                serde_json::to_value(event.as_ref()).unwrap_or(Value::Null)
            ]),
            Self::EndOfStoredEvents(subscription_id) => json!(["EOSE", subscription_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
        };
        frame.to_string()
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let frame = parse_frame(json)?;
        match frame_type(&frame)? {
            "EVENT" => Ok(Self::Event {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
                event: Box::new(event_at(&frame, 2)?),
            }),
            "EOSE" => Ok(Self::EndOfStoredEvents(string_at(
                &frame,
                1,
                "subscription_id",
            )?)),
            "OK" => Ok(Self::Ok {
                event_id: string_at(&frame, 1, "event_id")?,
                accepted: frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::MissingField("accepted"))?,
                message: frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(Self::Notice(string_at(&frame, 1, "message")?)),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&frame, 1, "subscription_id")?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn parse_frame(json: &str) -> Result<Vec<Value>, MessageError> {
    match serde_json::from_str::<Value>(json)? {
        Value::Array(frame) => Ok(frame),
        _ => Err(MessageError::NotAnArray),
    }
}

fn frame_type(frame: &[Value]) -> Result<&str, MessageError> {
    frame
        .first()
        .and_then(Value::as_str)
        .ok_or(MessageError::MissingField("type"))
}

fn string_at(frame: &[Value], index: usize, field: &'static str) -> Result<String, MessageError> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(MessageError::MissingField(field))
}

fn event_at(frame: &[Value], index: usize) -> Result<Event, MessageError> {
    let value = frame
        .get(index)
        .cloned()
        .ok_or(MessageError::MissingField("event"))?;
    let event = serde_json::from_value::<Event>(value)
        .map_err(|e| MessageError::InvalidEvent(e.to_string()))?;
    // Relays are untrusted: id and signature must match the payload
    event.verify().map_err(|e| MessageError::Unverified {
        id: event.id.to_hex(),
        reason: e.to_string(),
    })?;
    Ok(event)
}
