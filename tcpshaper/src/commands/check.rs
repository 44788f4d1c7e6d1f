use anyhow::Result;
use tracing::*;

use crate::config::load_config;

pub(crate) async fn command(cli: &crate::Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    info!("Server read:      {}", config.server.read);
    info!("Server write:     {}", config.server.write);
    info!("Connection read:  {}", config.connection.read);
    info!("Connection write: {}", config.connection.write);
    info!("No problems found");
    Ok(())
}
