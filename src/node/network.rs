//! Peer message envelope.
//!
//! Every message is a JSON object `{"type": ..., "data": ...}`. Only the
//! encoding lives here; moving bytes between peers is left to the caller.

use serde::{Deserialize, Serialize};

use crate::blockchain::{Block, Transaction};

/// Sender details attached to `register` and `request_chain`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Full chain, sent either as a bare list or wrapped in `{"blocks": [...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainPayload {
    Blocks(Vec<Block>),
    Wrapped { blocks: Vec<Block> },
}

impl ChainPayload {
    pub fn into_blocks(self) -> Vec<Block> {
        match self {
            ChainPayload::Blocks(blocks) | ChainPayload::Wrapped { blocks } => blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Register(PeerInfo),
    Tx(Transaction),
    Block(Block),
    RequestChain(PeerInfo),
    Chain(ChainPayload),
}

impl Message {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::genesis_block;
    use serde_json::json;

    #[test]
    fn test_envelope_layout() {
        let message = Message::RequestChain(PeerInfo { port: Some(8001) });
        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "request_chain", "data": {"port": 8001}}));
    }

    #[test]
    fn test_block_uses_wire_schema() {
        let genesis = genesis_block();
        let raw = json!({"type": "block", "data": genesis.to_json()}).to_string();

        assert_eq!(Message::decode(&raw).unwrap(), Message::Block(genesis));
    }

    #[test]
    fn test_chain_payload_forms() {
        let genesis = genesis_block();
        let bare = json!({"type": "chain", "data": [genesis.to_json()]}).to_string();
        let wrapped = json!({"type": "chain", "data": {"blocks": [genesis.to_json()]}}).to_string();

        for raw in [bare, wrapped] {
            match Message::decode(&raw).unwrap() {
                Message::Chain(payload) => assert_eq!(payload.into_blocks(), vec![genesis.clone()]),
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[test]
    fn test_malformed_input() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"type": "gossip", "data": {}}"#).is_err());
        assert!(Message::decode(r#"{"type": "tx", "data": {"sender": 5}}"#).is_err());
    }
}
