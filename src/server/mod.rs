pub mod api;

use anyhow::Result;
use std::sync::Arc;

use crate::host::HostState;

pub async fn start(port: u16, host: Arc<HostState>) -> Result<()> {
    api::serve(port, host).await
}
