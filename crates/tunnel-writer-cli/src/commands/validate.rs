//! Validate command implementation.

use anyhow::Result;
use tunnel_writer_core::{Connection, PartitionSpec, WriterConfig};

/// Check the configuration and build the connection without any remote call.
pub fn run(config: &WriterConfig) -> Result<()> {
    config.validate()?;
    let conn = Connection::from_config(config)?;

    println!("Configuration is valid\n");
    println!("  Endpoint:      {}", conn.endpoint());
    if let Some(tunnel) = conn.tunnel_endpoint() {
        println!("  Tunnel:        {}", tunnel);
    }
    println!("  Account type:  {}", conn.account_type());
    println!("  Target:        {}.{}", conn.default_project(), config.table);
    if let Some(partition) = &config.partition {
        println!("  Partition:     {}", PartitionSpec::parse(partition)?);
    }
    println!("  Truncate:      {}", config.truncate);
    println!("  Columns:       {}", config.columns.join(","));

    Ok(())
}
