//! Wire codec for the JSON array-tagged client and server messages.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::ser::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::event::{is_hex, Event};
use crate::filter::{Filter, FilterError};

pub const OK_PREFIX_POW: &str = "pow: ";
pub const OK_PREFIX_DUPLICATE: &str = "duplicate: ";
pub const OK_PREFIX_BLOCKED: &str = "blocked: ";
pub const OK_PREFIX_RATE_LIMITED: &str = "rate-limited: ";
pub const OK_PREFIX_INVALID: &str = "invalid: ";
pub const OK_PREFIX_ERROR: &str = "error: ";

/// Cheap label sniff run before the strict typed decode.
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\[\s*"(\w*)""#).expect("label regex"));

/// One parsed client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Event(Event),
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Recognized as a tagged array but not one of the known labels.
    Unknown {
        label: String,
        rest: Vec<Value>,
    },
}

#[derive(Debug, Error)]
pub enum MsgError {
    #[error("not a client message")]
    UnrecognizedShape,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message array is too short: len={0}")]
    TooShort(usize),
    #[error("message element must be a string")]
    ExpectedString,
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    /// An EVENT frame whose payload failed to decode. The id is salvaged
    /// from the raw JSON when possible so an OK rejection can name it.
    #[error("invalid event message: {source}")]
    InvalidEvent {
        id: Option<String>,
        source: serde_json::Error,
    },
}

/// Parse one client frame: sniff the label, then decode strictly.
pub fn parse_client_msg(text: &str) -> Result<ClientMsg, MsgError> {
    let label = LABEL_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
        .ok_or(MsgError::UnrecognizedShape)?;
    match label.as_str() {
        "EVENT" => parse_event_msg(text),
        "REQ" => parse_req_msg(text),
        "CLOSE" => {
            let (_, subscription_id) = parse_string_pair(text)?;
            Ok(ClientMsg::Close { subscription_id })
        }
        "AUTH" => {
            let (_, challenge) = parse_string_pair(text)?;
            Ok(ClientMsg::Auth { challenge })
        }
        "COUNT" => {
            let (subscription_id, filters) = parse_sub_and_filters(text)?;
            Ok(ClientMsg::Count {
                subscription_id,
                filters,
            })
        }
        _ => parse_unknown_msg(text),
    }
}

fn parse_event_msg(text: &str) -> Result<ClientMsg, MsgError> {
    match serde_json::from_str::<(String, Event)>(text) {
        Ok((_, event)) => Ok(ClientMsg::Event(event)),
        Err(source) => Err(MsgError::InvalidEvent {
            id: salvage_event_id(text),
            source,
        }),
    }
}

fn parse_req_msg(text: &str) -> Result<ClientMsg, MsgError> {
    let (subscription_id, filters) = parse_sub_and_filters(text)?;
    Ok(ClientMsg::Req {
        subscription_id,
        filters,
    })
}

/// Shared shape of REQ and COUNT: label, subscription id, one or more filters.
fn parse_sub_and_filters(text: &str) -> Result<(String, Vec<Filter>), MsgError> {
    let arr: Vec<Value> = serde_json::from_str(text)?;
    if arr.len() < 3 {
        return Err(MsgError::TooShort(arr.len()));
    }
    let subscription_id = arr[1]
        .as_str()
        .ok_or(MsgError::ExpectedString)?
        .to_string();
    let mut filters = Vec::with_capacity(arr.len() - 2);
    for v in &arr[2..] {
        filters.push(Filter::from_value(v)?);
    }
    Ok((subscription_id, filters))
}

fn parse_string_pair(text: &str) -> Result<(String, String), MsgError> {
    Ok(serde_json::from_str::<(String, String)>(text)?)
}

fn parse_unknown_msg(text: &str) -> Result<ClientMsg, MsgError> {
    let mut arr: Vec<Value> = serde_json::from_str(text)?;
    if arr.is_empty() {
        return Err(MsgError::TooShort(0));
    }
    let label = arr[0]
        .as_str()
        .ok_or(MsgError::ExpectedString)?
        .to_string();
    let rest = arr.split_off(1);
    Ok(ClientMsg::Unknown { label, rest })
}

/// Pull a plausible event id out of an undecodable EVENT frame.
fn salvage_event_id(text: &str) -> Option<String> {
    let arr: Vec<Value> = serde_json::from_str(text).ok()?;
    let id = arr.get(1)?.get("id")?.as_str()?;
    (id.len() == 64 && is_hex(id)).then(|| id.to_string())
}

/// One outbound server frame.
#[derive(Debug, Clone)]
pub enum ServerMsg {
    Event {
        subscription_id: String,
        event: Arc<Event>,
    },
    Eose {
        subscription_id: String,
    },
    Notice {
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Auth {
        event: Arc<Event>,
    },
    Count {
        subscription_id: String,
        count: u64,
        approximate: Option<bool>,
    },
}

impl ServerMsg {
    pub fn event(subscription_id: impl Into<String>, event: Arc<Event>) -> Self {
        ServerMsg::Event {
            subscription_id: subscription_id.into(),
            event,
        }
    }

    pub fn eose(subscription_id: impl Into<String>) -> Self {
        ServerMsg::Eose {
            subscription_id: subscription_id.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ServerMsg::Notice {
            message: message.into(),
        }
    }

    pub fn ok_accepted(event_id: impl Into<String>) -> Self {
        ServerMsg::Ok {
            event_id: event_id.into(),
            accepted: true,
            message: String::new(),
        }
    }

    pub fn ok_duplicate(event_id: impl Into<String>) -> Self {
        ServerMsg::Ok {
            event_id: event_id.into(),
            accepted: true,
            message: format!("{OK_PREFIX_DUPLICATE}already have this event"),
        }
    }

    pub fn ok_invalid(event_id: impl Into<String>, reason: impl AsRef<str>) -> Self {
        ServerMsg::Ok {
            event_id: event_id.into(),
            accepted: false,
            message: format!("{OK_PREFIX_INVALID}{}", reason.as_ref()),
        }
    }
}

#[derive(serde::Serialize)]
struct CountPayload {
    count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    approximate: Option<bool>,
}

impl Serialize for ServerMsg {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServerMsg::Event {
                subscription_id,
                event,
            } => ("EVENT", subscription_id, event).serialize(serializer),
            ServerMsg::Eose { subscription_id } => ("EOSE", subscription_id).serialize(serializer),
            ServerMsg::Notice { message } => ("NOTICE", message).serialize(serializer),
            ServerMsg::Ok {
                event_id,
                accepted,
                message,
            } => ("OK", event_id, accepted, message).serialize(serializer),
            ServerMsg::Auth { event } => ("AUTH", event).serialize(serializer),
            ServerMsg::Count {
                subscription_id,
                count,
                approximate,
            } => (
                "COUNT",
                subscription_id,
                CountPayload {
                    count: *count,
                    approximate: *approximate,
                },
            )
                .serialize(serializer),
        }
    }
}
