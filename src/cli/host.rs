use tracing::debug;

use crate::error::Result;
use crate::sandbox::{self, HostSettings};

/// Serve as a sandbox host over this process's stdin/stdout until stdin
/// closes.
pub async fn run_host(settings: HostSettings) -> Result<()> {
    debug!(
        capacity = settings.capacity,
        git_path = %settings.git_path,
        "sandbox host starting"
    );
    sandbox::run_host(settings, tokio::io::stdin(), tokio::io::stdout()).await?;
    debug!("sandbox host exiting");
    Ok(())
}
