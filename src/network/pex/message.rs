//! Peer exchange messages
//!
//! JSON encoded on channel [`PEX_CHANNEL`].

use crate::network::netaddress::NetAddress;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Channel owned by the peer exchange reactor
pub const PEX_CHANNEL: u8 = 0x00;

/// Most addresses accepted in one `PexAddrs`
pub const MAX_PEX_ADDRS: usize = 250;

#[derive(Error, Debug)]
pub enum PexMessageError {
    #[error("{0} addresses exceed the limit of {MAX_PEX_ADDRS}")]
    TooManyAddrs(usize),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PexMessage {
    /// Ask for addresses
    PexRequest,

    /// Addresses we know
    PexAddrs { addrs: Vec<NetAddress> },
}

impl PexMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a message, rejecting oversized address lists
    pub fn from_bytes(data: &[u8]) -> Result<Self, PexMessageError> {
        let msg: PexMessage = serde_json::from_slice(data)?;
        if let PexMessage::PexAddrs { addrs } = &msg {
            if addrs.len() > MAX_PEX_ADDRS {
                return Err(PexMessageError::TooManyAddrs(addrs.len()));
            }
        }
        Ok(msg)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PexMessage::PexRequest => "pex_request",
            PexMessage::PexAddrs { .. } => "pex_addrs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let bytes = PexMessage::PexRequest.to_bytes().unwrap();
        assert_eq!(bytes, b"\"pex_request\"");
        assert_eq!(PexMessage::from_bytes(&bytes).unwrap(), PexMessage::PexRequest);
    }

    #[test]
    fn test_addrs() {
        let msg = PexMessage::PexAddrs {
            addrs: vec!["1.2.3.4:46656".parse().unwrap(), "[2001:db8::1]:46656".parse().unwrap()],
        };
        let decoded = PexMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.type_name(), "pex_addrs");
    }

    #[test]
    fn test_too_many_addrs() {
        let addr: NetAddress = "1.2.3.4:46656".parse().unwrap();
        let msg = PexMessage::PexAddrs {
            addrs: vec![addr; MAX_PEX_ADDRS + 1],
        };
        assert!(matches!(
            PexMessage::from_bytes(&msg.to_bytes().unwrap()),
            Err(PexMessageError::TooManyAddrs(n)) if n == MAX_PEX_ADDRS + 1
        ));
    }

    #[test]
    fn test_garbage() {
        assert!(PexMessage::from_bytes(b"\x00\x01garbage").is_err());
        assert!(PexMessage::from_bytes(b"{\"unknown\":1}").is_err());
    }
}
