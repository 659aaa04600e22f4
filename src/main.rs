use std::path::PathBuf;

use switchdb_restd::config::Config;
use switchdb_restd::Core;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let core = Core::bootstrap(config).await?;
    core.serve().await
}
