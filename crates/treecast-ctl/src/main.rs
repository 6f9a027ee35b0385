//! treecast-ctl: inspect and repair a Treecast storage directory.

mod cmd;

use anyhow::{Context, Result};
use std::path::PathBuf;

use treecast_core::TreecastConfig;
use treecast_services::DirStorage;

fn print_usage() {
    println!("Usage: treecast-ctl [--root <dir>] <command>");
    println!();
    println!("Commands:");
    println!("  ls                         List data files and the state of their trees");
    println!("  tree <file> [--json]       Open or build the tree for <file> and describe it");
    println!("  check <file>               Re-hash <file> against its tree");
    println!("  fill <file>                Fill in interior hashes derivable from known children");
    println!("  missing <file>             List chunks not yet complete");
    println!("  simulate <file> <dir>      Send <file> to a fresh station in <dir> over a loopback radio");
    println!("  config                     Print the effective configuration");
    println!();
    println!("Options:");
    println!("  --root <dir>   Storage directory (default: storage.root from the config)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = TreecastConfig::load().context("failed to load config")?;

    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--root" => {
                i += 1;
                config.storage.root = args
                    .get(i)
                    .map(PathBuf::from)
                    .context("--root requires a value")?;
            }
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    let open_storage = || {
        DirStorage::new(&config.storage.root).with_context(|| {
            format!(
                "cannot open storage directory {}",
                config.storage.root.display()
            )
        })
    };

    match remaining.as_slice() {
        ["ls"] | [] => cmd::files::cmd_ls(&open_storage()?),
        ["tree", file] => cmd::tree::cmd_tree(&open_storage()?, file, &config.session, json),
        ["check", file] => cmd::tree::cmd_check(&open_storage()?, file, &config.session),
        ["fill", file] => cmd::tree::cmd_fill(&open_storage()?, file, &config.session),
        ["missing", file] => cmd::tree::cmd_missing(&open_storage()?, file, &config.session),
        ["simulate", file, dest] => {
            let dest = DirStorage::new(dest)
                .with_context(|| format!("cannot open storage directory {dest}"))?;
            cmd::simulate::cmd_simulate(&open_storage()?, &dest, file, &config)
        }
        ["config"] => cmd::config::cmd_config(&config),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
