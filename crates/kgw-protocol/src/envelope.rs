use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::content::{
    DisplayDataContent, ErrorContent, ExecuteResultContent, OutputPayload, StreamContent,
};

/// Metadata key carrying the originating cell on an `execute_request`.
pub const CELL_ID_METADATA_KEY: &str = "cell_id";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("malformed {msg_type} content: {source}")]
    Content {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Message header. Every field defaults so an empty `parent_header` (`{}`)
/// parses cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub header: Header,
    #[serde(default)]
    pub parent_header: Header,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub buffers: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ExecuteRequest,
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
    ExecuteReply,
    Other,
}

impl MessageKind {
    pub fn from_msg_type(msg_type: &str) -> Self {
        match msg_type {
            "execute_request" => MessageKind::ExecuteRequest,
            "stream" => MessageKind::Stream,
            "display_data" => MessageKind::DisplayData,
            "execute_result" => MessageKind::ExecuteResult,
            "error" => MessageKind::Error,
            "execute_reply" => MessageKind::ExecuteReply,
            _ => MessageKind::Other,
        }
    }

    /// Kinds that produce a stored cell output.
    pub fn is_output(self) -> bool {
        matches!(
            self,
            MessageKind::Stream
                | MessageKind::DisplayData
                | MessageKind::ExecuteResult
                | MessageKind::Error
        )
    }
}

/// A classified message with its content decoded for the kinds the proxy
/// cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    ExecuteRequest { cell: Option<Uuid> },
    Output(OutputPayload),
    ExecuteReply,
    Other(String),
}

impl Envelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Malformed)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Malformed)
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        let id = self.parent_header.msg_id.as_str();
        (!id.is_empty()).then_some(id)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_msg_type(&self.header.msg_type)
    }

    /// Cell that issued an `execute_request`. Missing or unparseable
    /// references yield `None`, as does any other message kind.
    pub fn cell_reference(&self) -> Option<Uuid> {
        if self.kind() != MessageKind::ExecuteRequest {
            return None;
        }
        self.metadata
            .get(CELL_ID_METADATA_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    }

    pub fn decode(&self) -> Result<KernelMessage, CodecError> {
        let message = match self.kind() {
            MessageKind::ExecuteRequest => KernelMessage::ExecuteRequest {
                cell: self.cell_reference(),
            },
            MessageKind::Stream => {
                KernelMessage::Output(OutputPayload::Stream(self.content_as::<StreamContent>()?))
            }
            MessageKind::DisplayData => KernelMessage::Output(OutputPayload::DisplayData(
                self.content_as::<DisplayDataContent>()?,
            )),
            MessageKind::ExecuteResult => KernelMessage::Output(OutputPayload::ExecuteResult(
                self.content_as::<ExecuteResultContent>()?,
            )),
            MessageKind::Error => {
                KernelMessage::Output(OutputPayload::Error(self.content_as::<ErrorContent>()?))
            }
            MessageKind::ExecuteReply => KernelMessage::ExecuteReply,
            MessageKind::Other => KernelMessage::Other(self.header.msg_type.clone()),
        };
        Ok(message)
    }

    fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.content).map_err(|source| CodecError::Content {
            msg_type: self.header.msg_type.clone(),
            source,
        })
    }

    /// Builds a reply-side message whose parent is `parent`.
    pub fn reply_to(
        parent: &Header,
        msg_id: impl Into<String>,
        msg_type: &str,
        content: Value,
    ) -> Self {
        Envelope {
            header: Header {
                msg_id: msg_id.into(),
                msg_type: msg_type.to_string(),
                username: parent.username.clone(),
                session: parent.session.clone(),
                date: None,
                version: parent.version.clone(),
            },
            parent_header: parent.clone(),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }
}
