//! Tree inspection and repair commands.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use treecast_core::config::SessionConfig;
use treecast_services::naming;
use treecast_services::{DirStorage, MerkleStore, Storage};

type Tree = MerkleStore<<DirStorage as Storage>::File>;

#[derive(Serialize)]
struct TreeReport {
    file: String,
    tree: String,
    file_size: u32,
    chunk_size: u32,
    num_chunks: u16,
    tree_depth: u8,
    root_hash: String,
    complete_chunks: usize,
    complete: bool,
}

/// Open `file` and its tree, building the tree if needed.
fn open(storage: &DirStorage, file: &str, session: &SessionConfig) -> Result<(Tree, std::fs::File)> {
    if naming::is_tree_name(file) {
        bail!("{file} is a tree file; name the data file instead");
    }
    let mut data = storage
        .open(file)
        .with_context(|| format!("cannot open {file}"))?;
    let tree_name = naming::tree_name(file);
    let tree = MerkleStore::open_local(storage, &tree_name, &mut data, session.fault_policy)
        .with_context(|| format!("cannot open tree {tree_name}"))?;
    Ok((tree, data))
}

fn incomplete_chunks(tree: &mut Tree) -> Result<Vec<u16>> {
    let mut missing = Vec::new();
    for chunk in 0..tree.geometry().num_chunks {
        if !tree.chunk_complete(chunk)? {
            missing.push(chunk);
        }
    }
    Ok(missing)
}

fn report(tree: &mut Tree, file: &str) -> Result<TreeReport> {
    let g = tree.geometry();
    let missing = incomplete_chunks(tree)?;
    Ok(TreeReport {
        file: file.to_string(),
        tree: naming::tree_name(file),
        file_size: g.file_size,
        chunk_size: g.chunk_size,
        num_chunks: g.num_chunks,
        tree_depth: g.tree_depth,
        root_hash: hex::encode(tree.root_hash()),
        complete_chunks: usize::from(g.num_chunks) - missing.len(),
        complete: tree.is_complete()?,
    })
}

pub fn cmd_tree(storage: &DirStorage, file: &str, session: &SessionConfig, json: bool) -> Result<()> {
    let (mut tree, _) = open(storage, file, session)?;
    let r = report(&mut tree, file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&r)?);
        return Ok(());
    }
    println!("═══════════════════════════════════════");
    println!("  {}", r.file);
    println!("═══════════════════════════════════════");
    println!("  Tree        : {}", r.tree);
    println!("  File size   : {} bytes", r.file_size);
    println!("  Chunk size  : {} bytes", r.chunk_size);
    println!("  Chunks      : {} ({} complete)", r.num_chunks, r.complete_chunks);
    println!("  Depth       : {}", r.tree_depth);
    println!("  Root        : {}", r.root_hash);
    println!("  Complete    : {}", if r.complete { "yes" } else { "no" });
    Ok(())
}

pub fn cmd_check(storage: &DirStorage, file: &str, session: &SessionConfig) -> Result<()> {
    let (mut tree, mut data) = open(storage, file, session)?;
    tracing::debug!(file, "re-hashing against tree");
    tree.check(&mut data).context("check failed")?;
    let r = report(&mut tree, file)?;
    println!(
        "{}: {}/{} chunks verified, root {}",
        r.file,
        r.complete_chunks,
        r.num_chunks,
        if r.complete { "complete" } else { "incomplete" }
    );
    Ok(())
}

pub fn cmd_fill(storage: &DirStorage, file: &str, session: &SessionConfig) -> Result<()> {
    let (mut tree, _) = open(storage, file, session)?;
    tree.fill().context("fill failed")?;
    println!("Filled {}.", naming::tree_name(file));
    Ok(())
}

pub fn cmd_missing(storage: &DirStorage, file: &str, session: &SessionConfig) -> Result<()> {
    let (mut tree, _) = open(storage, file, session)?;
    let missing = incomplete_chunks(&mut tree)?;
    if missing.is_empty() {
        println!("{file}: no chunks missing.");
        return Ok(());
    }
    let list: Vec<String> = missing.iter().map(u16::to_string).collect();
    println!("{file}: {} missing: {}", missing.len(), list.join(" "));
    Ok(())
}
