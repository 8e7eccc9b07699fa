use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::TargetUrl;
use crate::error::Result;
use crate::utils::encode_chunk;

/// Wire representation of HTTP headers: name to list of values.
pub type Headers = HashMap<String, Vec<String>>;

/// One multiplexed message on the tunnel wire.
///
/// Every frame carries the correlation `id` of the exchange it belongs to
/// plus exactly one of the three payload keys. Which payload key is present
/// decides whether the frame belongs to an HTTP request, an HTTP response,
/// or a proxied WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id, unique within one tunnel connection's lifetime
    pub id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestFrame>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseFrame>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<SocketFrame>,
}

/// The three states of a `body` field.
///
/// The wire encodes the state of a body stream in how the key is spelled:
/// an absent key opens the exchange (the frame carries head fields instead),
/// a string is one base64 chunk, and an explicit `null` ends the stream.
/// No frame for the same direction is legal after the `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState<'a> {
    /// `body` key absent: open frame carrying head fields
    Open,
    /// `body` is a string: one base64-encoded chunk
    Chunk(&'a str),
    /// `body` is `null`: end of stream
    End,
}

fn body_state(body: &Option<Option<String>>) -> BodyState<'_> {
    match body {
        None => BodyState::Open,
        Some(Some(chunk)) => BodyState::Chunk(chunk),
        Some(None) => BodyState::End,
    }
}

/// Distinguishes an absent `body` key from `"body": null`.
///
/// Plain `Option` collapses both to `None`; wrapping the parsed value in an
/// outer `Some` preserves the distinction (the field's `#[serde(default)]`
/// supplies the outer `None` when the key is missing).
fn nullable_body<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Payload of a frame on the request side of an HTTP exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Public URL the client hit, split into its components (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<TargetUrl>,

    /// HTTP method (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Request headers, multi-valued (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    /// Request body, following the three-state contract
    #[serde(
        default,
        deserialize_with = "nullable_body",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Option<String>>,
}

impl RequestFrame {
    /// State of this frame's body field.
    pub fn body_state(&self) -> BodyState<'_> {
        body_state(&self.body)
    }

    /// True for the frame that opens a request (method and URL present).
    pub fn is_open(&self) -> bool {
        self.method.is_some() && self.url.is_some()
    }
}

/// Payload of a frame on the response side of an HTTP exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// HTTP status code (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// HTTP reason phrase (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Response headers, multi-valued (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    /// Response body, following the three-state contract
    #[serde(
        default,
        deserialize_with = "nullable_body",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Option<String>>,
}

impl ResponseFrame {
    /// State of this frame's body field.
    pub fn body_state(&self) -> BodyState<'_> {
        body_state(&self.body)
    }
}

/// Payload of a frame belonging to a proxied WebSocket
///
/// Socket data frames carry no chunk/end distinction: the WebSocket's own
/// message boundaries are preserved one-to-one, and close is signaled by the
/// transport rather than on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    /// Dial target for the responder (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<TargetUrl>,

    /// Headers of the original upgrade request (open frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    /// One base64-encoded WebSocket message (data frames only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SocketFrame {
    /// True for the frame that opens a proxied WebSocket (dial target present).
    pub fn is_open(&self) -> bool {
        self.url.is_some()
    }
}

impl Frame {
    /// Open frame for a forwarded HTTP request
    pub fn request_open(id: Uuid, url: TargetUrl, method: String, headers: Headers) -> Self {
        Self {
            id,
            request: Some(RequestFrame {
                url: Some(url),
                method: Some(method),
                headers: Some(headers),
                body: None,
            }),
            response: None,
            socket: None,
        }
    }

    /// One chunk of forwarded request body
    pub fn request_chunk(id: Uuid, data: &[u8]) -> Self {
        Self {
            id,
            request: Some(RequestFrame {
                body: Some(Some(encode_chunk(data))),
                ..Default::default()
            }),
            response: None,
            socket: None,
        }
    }

    /// End of the forwarded request body
    pub fn request_end(id: Uuid) -> Self {
        Self {
            id,
            request: Some(RequestFrame {
                body: Some(None),
                ..Default::default()
            }),
            response: None,
            socket: None,
        }
    }

    /// Open frame for a response: status line and headers
    pub fn response_open(
        id: Uuid,
        status_code: u16,
        status_message: impl Into<String>,
        headers: Headers,
    ) -> Self {
        Self {
            id,
            request: None,
            response: Some(ResponseFrame {
                status_code: Some(status_code),
                status_message: Some(status_message.into()),
                headers: Some(headers),
                body: None,
            }),
            socket: None,
        }
    }

    /// One chunk of response body
    pub fn response_chunk(id: Uuid, data: &[u8]) -> Self {
        Self {
            id,
            request: None,
            response: Some(ResponseFrame {
                body: Some(Some(encode_chunk(data))),
                ..Default::default()
            }),
            socket: None,
        }
    }

    /// End of the response body
    pub fn response_end(id: Uuid) -> Self {
        Self {
            id,
            request: None,
            response: Some(ResponseFrame {
                body: Some(None),
                ..Default::default()
            }),
            socket: None,
        }
    }

    /// Open frame for a proxied WebSocket: dial target and upgrade headers
    pub fn socket_open(id: Uuid, url: TargetUrl, headers: Headers) -> Self {
        Self {
            id,
            request: None,
            response: None,
            socket: Some(SocketFrame {
                url: Some(url),
                headers: Some(headers),
                message: None,
            }),
        }
    }

    /// One proxied WebSocket message
    pub fn socket_message(id: Uuid, data: &[u8]) -> Self {
        Self {
            id,
            request: None,
            response: None,
            socket: Some(SocketFrame {
                message: Some(encode_chunk(data)),
                ..Default::default()
            }),
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame off the wire.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
