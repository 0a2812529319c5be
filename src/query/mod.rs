//! Query Channel
//!
//! Public UDP interface answering "who is the leader". A request is the JSON
//! document `{"name": "get_leader", "payload": {}}`; the answer is the
//! leader identifier, `0` while no leader is known.

mod client;
mod responder;

pub use client::QueryClient;
pub use responder::QueryResponder;

use serde::{Deserialize, Serialize};

use crate::config::LeaderEncoding;
use crate::error::{Error, Result};
use crate::state::NodeId;

/// Request name for the leader query
pub const GET_LEADER: &str = "get_leader";

/// Identifier sent while no leader is resolved
pub const UNKNOWN_LEADER: NodeId = 0;

/// A query datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(alias = "title")]
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueryRequest {
    pub fn get_leader() -> Self {
        Self {
            name: GET_LEADER.to_string(),
            payload: serde_json::json!({}),
        }
    }

    /// Parse a datagram
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_get_leader(&self) -> bool {
        self.name == GET_LEADER
    }
}

/// Encode the answer to a leader query
pub fn encode_leader(leader: Option<NodeId>, encoding: LeaderEncoding) -> Vec<u8> {
    let id = leader.unwrap_or(UNKNOWN_LEADER);
    match encoding {
        LeaderEncoding::Ascii => id.to_string().into_bytes(),
        LeaderEncoding::Byte => vec![u8::try_from(id).unwrap_or(0)],
    }
}

/// Decode the answer to a leader query
pub fn decode_leader(bytes: &[u8], encoding: LeaderEncoding) -> Result<Option<NodeId>> {
    let id = match encoding {
        LeaderEncoding::Ascii => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<NodeId>().ok())
            .ok_or(Error::UnexpectedResponse("leader answer is not a number"))?,
        LeaderEncoding::Byte => match bytes {
            [b] => NodeId::from(*b),
            _ => return Err(Error::UnexpectedResponse("leader answer is not one byte")),
        },
    };
    Ok(Some(id).filter(|&id| id != UNKNOWN_LEADER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let request = QueryRequest::parse(br#"{"name":"get_leader","payload":{}}"#).unwrap();
        assert!(request.is_get_leader());

        let aliased = QueryRequest::parse(br#"{"title":"get_leader","payload":{}}"#).unwrap();
        assert!(aliased.is_get_leader());

        let bare = QueryRequest::parse(br#"{"name":"get_leader"}"#).unwrap();
        assert!(bare.is_get_leader());

        let other = QueryRequest::parse(br#"{"name":"get_term","payload":{}}"#).unwrap();
        assert!(!other.is_get_leader());

        assert!(matches!(
            QueryRequest::parse(b"get_leader"),
            Err(Error::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_leader_encoding() {
        assert_eq!(encode_leader(Some(5), LeaderEncoding::Ascii), b"5");
        assert_eq!(encode_leader(Some(12), LeaderEncoding::Ascii), b"12");
        assert_eq!(encode_leader(None, LeaderEncoding::Ascii), b"0");
        assert_eq!(encode_leader(Some(4), LeaderEncoding::Byte), vec![4u8]);
        assert_eq!(encode_leader(None, LeaderEncoding::Byte), vec![0u8]);
    }

    #[test]
    fn test_decode_leader() {
        assert_eq!(decode_leader(b"12", LeaderEncoding::Ascii).unwrap(), Some(12));
        assert_eq!(decode_leader(b"0", LeaderEncoding::Ascii).unwrap(), None);
        assert_eq!(decode_leader(&[3], LeaderEncoding::Byte).unwrap(), Some(3));
        assert!(decode_leader(b"x", LeaderEncoding::Ascii).is_err());
        assert!(decode_leader(&[1, 2], LeaderEncoding::Byte).is_err());
    }
}
