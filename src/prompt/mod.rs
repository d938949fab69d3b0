pub mod client;
pub mod credential;
pub mod launchers;
pub mod server;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use client::PromptClient;
pub use launchers::HelperPaths;
pub use server::CredentialPromptServer;

/// Cap on a single query or answer read from the prompt socket.
pub const MAX_MESSAGE_BYTES: u64 = 1_048_576;

/// Query sent by a helper over the prompt socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptQuery {
    pub prompt: String,
    #[serde(default)]
    pub include_username: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Answer written back to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub password: String,
}

/// Emitted when a query was malformed or the prompt was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptCancelled {
    /// Pid of the helper that asked, when the query carried one.
    pub handler_pid: Option<u32>,
}

pub type PromptFuture = Pin<Box<dyn Future<Output = Result<PromptAnswer>> + Send>>;

/// Collects credentials from a human. Declining is an `Err`.
pub type PromptHandler = Arc<dyn Fn(PromptQuery) -> PromptFuture + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wire_format_is_camel_case() {
        let query: PromptQuery =
            serde_json::from_str(r#"{"prompt":"Password:","includeUsername":true,"pid":12}"#)
                .unwrap();
        assert!(query.include_username);
        assert_eq!(query.pid, Some(12));

        let minimal: PromptQuery = serde_json::from_str(r#"{"prompt":"Passphrase:"}"#).unwrap();
        assert!(!minimal.include_username);
        assert_eq!(minimal.pid, None);
    }

    #[test]
    fn answer_omits_missing_username() {
        let json = serde_json::to_string(&PromptAnswer {
            username: None,
            password: "hunter2".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"password":"hunter2"}"#);
    }
}
