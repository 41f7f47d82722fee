//! Boundary to the application command layer
//!
//! The session hands each decrypted request to a `Dispatcher` and encrypts
//! whatever comes back. Policy evaluation lives behind this trait.

use crate::MAX_PLAINTEXT_LEN;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// What the session should do with a dispatcher result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Send the response and keep serving
    Reply(Vec<u8>),
    /// Send the response, then close the session
    ReplyAndClose(Vec<u8>),
    /// Close without replying
    Close,
}

/// Interprets decrypted requests
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: Vec<u8>) -> Dispatch;
}

const PONG: &[u8] = br#"{"cmd":"pong"}"#;
const BYE: &[u8] = br#"{"cmd":"bye"}"#;
const ACCESS_DENIED: &[u8] = br#"{"response":"access denied"}"#;

#[derive(Debug, Deserialize)]
struct Command {
    cmd: String,
}

/// Minimal JSON command handler: `ping`, `close`, and a generic denial for
/// everything else.
#[derive(Debug, Clone, Default)]
pub struct JsonCommandDispatcher;

impl JsonCommandDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatcher for JsonCommandDispatcher {
    async fn dispatch(&self, request: Vec<u8>) -> Dispatch {
        if request.len() > MAX_PLAINTEXT_LEN {
            return Dispatch::Close;
        }
        match serde_json::from_slice::<Command>(&request) {
            Ok(command) if command.cmd == "ping" => Dispatch::Reply(PONG.to_vec()),
            Ok(command) if command.cmd == "close" => Dispatch::ReplyAndClose(BYE.to_vec()),
            Ok(command) => {
                debug!("Denied command: {}", command.cmd);
                Dispatch::Reply(ACCESS_DENIED.to_vec())
            }
            Err(_) => Dispatch::Reply(ACCESS_DENIED.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_and_close() {
        let dispatcher = JsonCommandDispatcher::new();
        assert_eq!(
            dispatcher.dispatch(br#"{"cmd":"ping"}"#.to_vec()).await,
            Dispatch::Reply(br#"{"cmd":"pong"}"#.to_vec())
        );
        assert_eq!(
            dispatcher.dispatch(br#"{"cmd":"close"}"#.to_vec()).await,
            Dispatch::ReplyAndClose(br#"{"cmd":"bye"}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_everything_else_is_denied() {
        let dispatcher = JsonCommandDispatcher::new();
        let denied = Dispatch::Reply(br#"{"response":"access denied"}"#.to_vec());
        assert_eq!(dispatcher.dispatch(br#"{"cmd":"unlock"}"#.to_vec()).await, denied);
        assert_eq!(dispatcher.dispatch(b"not json".to_vec()).await, denied);
        assert_eq!(dispatcher.dispatch(Vec::new()).await, denied);
    }

    #[tokio::test]
    async fn test_oversized_request_closes() {
        let dispatcher = JsonCommandDispatcher::new();
        let request = vec![b' '; MAX_PLAINTEXT_LEN + 1];
        assert_eq!(dispatcher.dispatch(request).await, Dispatch::Close);
    }
}
