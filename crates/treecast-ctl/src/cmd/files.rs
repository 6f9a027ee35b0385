//! Storage directory listing.

use anyhow::Result;

use treecast_services::merkle;
use treecast_services::naming;
use treecast_services::{DirStorage, Storage, StorageFile};

pub fn cmd_ls(storage: &DirStorage) -> Result<()> {
    let names = storage.names()?;
    let data: Vec<&String> = names.iter().filter(|n| !naming::is_tree_name(n)).collect();
    if data.is_empty() {
        println!("No files in {}.", storage.root().display());
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  {} ({} files)", storage.root().display(), data.len());
    println!("═══════════════════════════════════════");
    for name in data {
        let size = storage.open(name).and_then(|f| f.len()).unwrap_or(0);
        let tree_name = naming::tree_name(name);
        let state = match storage.open(&tree_name) {
            Err(_) => "no tree".to_string(),
            Ok(mut f) => match merkle::read_header(&mut f) {
                Ok((g, root)) => format!("{} chunks, root {}", g.num_chunks, hex::encode(&root[..8])),
                Err(e) => format!("bad tree: {e}"),
            },
        };
        println!("  {name:<32} {size:>8} bytes  {state}");
    }
    Ok(())
}
