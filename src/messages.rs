//! # Wire Protocol Messages
//!
//! One message per datagram: a fixed-layout header followed by a body whose
//! shape is selected by `header.message_type`.
//!
//! | Field | Encoding |
//! |-------|----------|
//! | `version` | `u8`, currently [`VERSION`] |
//! | `message_type` | `u32` variant tag of [`MessageType`] |
//! | `sender_id` | 20 raw bytes |
//! | `request_id` | 20 raw bytes |
//!
//! Bodies and headers are bincode with fixed-width integers. Every decode goes
//! through [`bincode_options`], which bounds allocations to
//! [`MAX_DATAGRAM_SIZE`]. The header is decoded on its own so the remaining
//! bytes can be handed, undecoded, to whoever owns the request.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::WireError;
use crate::identity::{Contact, Identifier};

pub const VERSION: u8 = 1;

/// Most peers accepted in a single FIND_NODE response.
pub const MAX_PEERS_PER_RESPONSE: usize = 64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    PingRequest,
    PingResponse,
    StoreRequest,
    StoreResponse,
    FindNodeRequest,
    FindNodeResponse,
    FindValueRequest,
    FindValueResponse,
}

impl MessageType {
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::PingRequest
                | MessageType::StoreRequest
                | MessageType::FindNodeRequest
                | MessageType::FindValueRequest
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    pub sender_id: Identifier,
    pub request_id: Identifier,
}

impl Header {
    pub fn new(message_type: MessageType, sender_id: Identifier, request_id: Identifier) -> Self {
        Self {
            version: VERSION,
            message_type,
            sender_id,
            request_id,
        }
    }
}

/// Split a datagram into its header and the undecoded body region.
pub fn decode_header(datagram: &[u8]) -> Result<(Header, &[u8]), WireError> {
    let mut body = datagram;
    let header: Header = bincode_options().deserialize_from(&mut body)?;
    if header.version != VERSION {
        return Err(WireError::UnsupportedVersion(header.version));
    }
    Ok((header, body))
}

fn encode_parts<B: Serialize>(header: &Header, body: &B) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    bincode_options().serialize_into(&mut out, header)?;
    bincode_options().serialize_into(&mut out, body)?;
    Ok(out)
}

fn decode_body<B: DeserializeOwned>(body: &[u8]) -> Result<B, WireError> {
    Ok(bincode_options().deserialize(body)?)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Ping,
    Store { key: Identifier, data: Vec<u8> },
    FindNode { target: Identifier },
    FindValue { key: Identifier },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Ping => MessageType::PingRequest,
            Request::Store { .. } => MessageType::StoreRequest,
            Request::FindNode { .. } => MessageType::FindNodeRequest,
            Request::FindValue { .. } => MessageType::FindValueRequest,
        }
    }

    pub fn encode(&self, sender_id: Identifier, request_id: Identifier) -> Result<Vec<u8>, WireError> {
        let header = Header::new(self.message_type(), sender_id, request_id);
        match self {
            Request::Ping => encode_parts(&header, &()),
            Request::Store { key, data } => encode_parts(&header, &(key, data)),
            Request::FindNode { target } => encode_parts(&header, target),
            Request::FindValue { key } => encode_parts(&header, key),
        }
    }

    pub fn decode(message_type: MessageType, body: &[u8]) -> Result<Self, WireError> {
        match message_type {
            MessageType::PingRequest => Ok(Request::Ping),
            MessageType::StoreRequest => {
                let (key, data): (Identifier, Vec<u8>) = decode_body(body)?;
                Ok(Request::Store { key, data })
            }
            MessageType::FindNodeRequest => Ok(Request::FindNode {
                target: decode_body(body)?,
            }),
            MessageType::FindValueRequest => Ok(Request::FindValue {
                key: decode_body(body)?,
            }),
            other => Err(WireError::UnexpectedBody(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ping,
    Store,
    FindNode { peers: Vec<Contact> },
    FindValue { data: Vec<u8> },
}

impl Response {
    pub fn message_type(&self) -> MessageType {
        match self {
            Response::Ping => MessageType::PingResponse,
            Response::Store => MessageType::StoreResponse,
            Response::FindNode { .. } => MessageType::FindNodeResponse,
            Response::FindValue { .. } => MessageType::FindValueResponse,
        }
    }

    pub fn encode(&self, sender_id: Identifier, request_id: Identifier) -> Result<Vec<u8>, WireError> {
        let header = Header::new(self.message_type(), sender_id, request_id);
        match self {
            Response::Ping | Response::Store => encode_parts(&header, &()),
            Response::FindNode { peers } => encode_parts(&header, peers),
            Response::FindValue { data } => encode_parts(&header, data),
        }
    }

    pub fn decode(message_type: MessageType, body: &[u8]) -> Result<Self, WireError> {
        match message_type {
            MessageType::PingResponse => Ok(Response::Ping),
            MessageType::StoreResponse => Ok(Response::Store),
            MessageType::FindNodeResponse => {
                let peers: Vec<Contact> = decode_body(body)?;
                if peers.len() > MAX_PEERS_PER_RESPONSE {
                    return Err(WireError::TooManyPeers(peers.len()));
                }
                Ok(Response::FindNode { peers })
            }
            MessageType::FindValueResponse => Ok(Response::FindValue {
                data: decode_body(body)?,
            }),
            other => Err(WireError::UnexpectedBody(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn id(b: u8) -> Identifier {
        Identifier::from_bytes([b; 20])
    }

    #[test]
    fn header_has_fixed_width() {
        let bytes = Request::Ping.encode(id(1), id(2)).unwrap();
        // u8 version + u32 tag + two 20-byte identifiers, empty ping body.
        assert_eq!(bytes.len(), 1 + 4 + 20 + 20);
    }

    #[test]
    fn header_decodes_independently_of_body() {
        let request = Request::Store {
            key: id(7),
            data: b"payload".to_vec(),
        };
        let bytes = request.encode(id(1), id(2)).unwrap();
        let (header, body) = decode_header(&bytes).unwrap();
        assert_eq!(header, Header::new(MessageType::StoreRequest, id(1), id(2)));
        assert_eq!(Request::decode(header.message_type, body).unwrap(), request);
    }

    #[test]
    fn find_node_response_carries_peers() {
        let peers = vec![
            Contact::new(id(3), "127.0.0.1:4000".parse::<SocketAddr>().unwrap()),
            Contact::new(id(4), "[::1]:4001".parse::<SocketAddr>().unwrap()),
        ];
        let bytes = Response::FindNode { peers: peers.clone() }.encode(id(1), id(9)).unwrap();
        let (header, body) = decode_header(&bytes).unwrap();
        assert!(!header.message_type.is_request());
        assert_eq!(
            Response::decode(header.message_type, body).unwrap(),
            Response::FindNode { peers }
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let bytes = Request::Ping.encode(id(1), id(2)).unwrap();
        for len in [0, 1, 5, 30, bytes.len() - 1] {
            assert!(decode_header(&bytes[..len]).is_err(), "len {len} decoded");
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = Request::Ping.encode(id(1), id(2)).unwrap();
        bytes[0] = VERSION + 1;
        assert!(matches!(
            decode_header(&bytes),
            Err(WireError::UnsupportedVersion(v)) if v == VERSION + 1
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = Request::Ping.encode(id(1), id(2)).unwrap();
        bytes[1] = 0xee;
        assert!(decode_header(&bytes).is_err());
    }

    #[test]
    fn request_type_is_not_a_response_body() {
        assert!(matches!(
            Response::decode(MessageType::FindNodeRequest, &[]),
            Err(WireError::UnexpectedBody(MessageType::FindNodeRequest))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = Response::FindValue { data: vec![1; 32] }.encode(id(1), id(2)).unwrap();
        let (header, body) = decode_header(&bytes).unwrap();
        assert!(Response::decode(header.message_type, &body[..body.len() - 1]).is_err());
    }

    #[test]
    fn oversized_peer_list_is_rejected() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let peers = vec![Contact::new(id(5), addr); MAX_PEERS_PER_RESPONSE + 1];
        let bytes = Response::FindNode { peers }.encode(id(1), id(2)).unwrap();
        let (header, body) = decode_header(&bytes).unwrap();
        assert!(matches!(
            Response::decode(header.message_type, body),
            Err(WireError::TooManyPeers(n)) if n == MAX_PEERS_PER_RESPONSE + 1
        ));
    }
}
