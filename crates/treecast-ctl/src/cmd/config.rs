//! Effective configuration.

use anyhow::Result;

use treecast_core::TreecastConfig;

pub fn cmd_config(config: &TreecastConfig) -> Result<()> {
    println!("# {}", TreecastConfig::file_path().display());
    print!("{}", config.to_toml()?);
    Ok(())
}
