//! Symdex daemon: the service surface over one workspace engine
//!
//! A long-lived process owning the workspace store, the single writer,
//! the extractor pool, the GC task, and the sync workers. Clients speak
//! JSON over WebSocket:
//!
//! ```json
//! // Client -> Server
//! {"type": "query", "id": 1, "method": "query.references",
//!  "params": {"workspace_id": "ws1", "symbol": "repoB::util::foo"}}
//!
//! // Server -> Client
//! {"type": "response", "id": 1, "result": {"results": [...], "confidence": {...}}}
//! {"type": "error", "id": 1, "code": "validation_error", "message": "..."}
//! ```
//!
//! Method names mirror the endpoint table: `query.*`, `explore.*`,
//! `cache.invalidate`, `workspace.*`, `context.*`, `sync.*`,
//! `webhook.gitlab`, and `health`.

pub mod connection;
pub mod protocol;

pub use connection::handle_connection;
pub use protocol::{ClientMessage, ServerMessage};
