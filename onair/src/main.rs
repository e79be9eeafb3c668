// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
//! `onair-dump`: open the configured baseline and print what it holds.
//!
//! With `--tree` the forward tree is dumped page by page; otherwise only
//! per-tree statistics are printed.

use std::io::Write;

use onair::config::IndexConfig;
use onair::index::{BTreeIndexStorageManager, HASHED_KEY_SIZE, INLINE_KEY_SIZE};
use onair::storage::{BTree, HexRenderer, TreeStats};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onair=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dump_pages = std::env::args().skip(1).any(|arg| arg == "--tree");

    // Load configuration from environment variables
    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: revision={}, meta_dir={}, cache_host={}",
        config.revision.as_deref().unwrap_or("<none>"),
        config.meta_dir.display(),
        config.cache_host.as_deref().unwrap_or("<none>")
    );

    let manager = match BTreeIndexStorageManager::from_config(&config) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("Failed to open index storage: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = report(&manager, dump_pages) {
        tracing::error!("Failed to dump indices: {e}");
        std::process::exit(1);
    }
}

fn report(
    manager: &BTreeIndexStorageManager,
    dump_pages: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let novelty = manager.novelty();

    writeln!(
        out,
        "base revision {}, new revision {}, novelty {} of {} bytes",
        manager.base_revision(),
        manager.new_revision(),
        novelty.size(),
        novelty.capacity()
    )?;

    let forward = manager.forward_tree();
    print_stats(&mut out, "forward", &forward, forward.stats(novelty)?)?;

    if let Some(manifest) = manager.manifest() {
        for name in manifest.inverted_indices.keys() {
            let Some(heads) = manifest.heads(name)? else {
                continue;
            };
            let key_size = if heads.internary.is_some() {
                HASHED_KEY_SIZE
            } else {
                INLINE_KEY_SIZE
            };
            let data = BTree::load(manager.storage().clone(), key_size, heads.data);
            print_stats(&mut out, name, &data, data.stats(novelty)?)?;
        }
    }

    if dump_pages {
        forward.dump(novelty, &mut out, &HexRenderer)?;
    }
    Ok(())
}

fn print_stats(
    out: &mut impl Write,
    name: &str,
    tree: &BTree,
    stats: TreeStats,
) -> std::io::Result<()> {
    writeln!(
        out,
        "{name}: root {} depth {} pages {}+{} entries {}",
        tree.root(),
        stats.depth,
        stats.internal_pages,
        stats.bottom_pages,
        stats.entries
    )
}
