//! Daemon protocol message types
//!
//! Defines the JSON message format for client-server communication.

use serde::{Deserialize, Serialize};

/// Client-to-server message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke one operation of the service surface
    Query {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Ping to check connection
    Ping,
}

/// Server-to-client message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection established
    Connected(ConnectionInfo),
    /// Query response
    Response {
        id: u64,
        result: serde_json::Value,
    },
    /// Error response
    Error {
        id: Option<u64>,
        code: String,
        message: String,
    },
    /// Pong response
    Pong,
}

/// Connection info returned on connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub workspace_id: String,
    pub repo_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_message_round_trips() {
        let msg = ClientMessage::Query {
            id: 7,
            method: "query.references".into(),
            params: serde_json::json!({"workspace_id": "ws1", "symbol": "foo"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"query\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Query { id, method, .. } => {
                assert_eq!(id, 7);
                assert_eq!(method, "query.references");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
