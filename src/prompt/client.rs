use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{GitwardenError, Result};
use crate::prompt::{PromptAnswer, PromptQuery, MAX_MESSAGE_BYTES};

/// Client side of the prompt socket, used by the askpass and credential helpers.
pub struct PromptClient {
    socket_path: PathBuf,
    timeout_secs: u64,
}

impl PromptClient {
    pub fn new(socket_path: PathBuf, timeout_secs: u64) -> Self {
        Self {
            socket_path,
            timeout_secs,
        }
    }

    /// Send one query and wait for the answer.
    ///
    /// A server that declines closes the connection without answering, which
    /// surfaces as [`GitwardenError::PromptCancelled`].
    pub async fn request(&self, query: &PromptQuery) -> Result<PromptAnswer> {
        if !self.socket_path.exists() {
            return Err(GitwardenError::SocketNotFound {
                path: self.socket_path.clone(),
            });
        }

        let timeout = std::time::Duration::from_secs(self.timeout_secs);

        let result = tokio::time::timeout(timeout, async {
            let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                GitwardenError::Ipc {
                    reason: format!("connect failed: {}", e),
                }
            })?;

            let query_json = serde_json::to_vec(query)?;
            stream
                .write_all(&query_json)
                .await
                .map_err(|e| GitwardenError::Ipc {
                    reason: format!("write failed: {}", e),
                })?;
            // End of input marks the end of the query.
            stream.shutdown().await.map_err(|e| GitwardenError::Ipc {
                reason: format!("shutdown write failed: {}", e),
            })?;

            let mut response_buf = Vec::new();
            stream
                .take(MAX_MESSAGE_BYTES)
                .read_to_end(&mut response_buf)
                .await
                .map_err(|e| GitwardenError::Ipc {
                    reason: format!("read failed: {}", e),
                })?;

            if response_buf.iter().all(u8::is_ascii_whitespace) {
                return Err(GitwardenError::PromptCancelled);
            }

            let answer: PromptAnswer =
                serde_json::from_slice(&response_buf).map_err(|e| GitwardenError::Ipc {
                    reason: format!("invalid answer JSON: {}", e),
                })?;

            Ok::<PromptAnswer, GitwardenError>(answer)
        })
        .await;

        match result {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GitwardenError::PromptTimeout {
                timeout_secs: self.timeout_secs,
            }),
        }
    }
}
