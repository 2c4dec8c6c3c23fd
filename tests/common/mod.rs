//! Shared test harness: tracing setup and index constructors.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn splits_under_load() {
//!     common::init_tracing();
//!     let tree = common::small_tree(false);
//!     // ...
//! }
//! ```
//!
//! Library events only exist when the crate is built with `--features tracing`.
//!
//! # Environment
//!
//! - `RUST_LOG`: filter directives, e.g. `bwtree::tree::split=debug,bwtree::epoch=trace`
//! - `BWTREE_LOG_DIR`: directory for the NDJSON log (default `logs/`)
//! - `BWTREE_LOG_CONSOLE=0`: keep the console quiet, log to the file only
//!
//! # Reading the log
//!
//! Each test binary appends to `logs/bwtree.jsonl`, one JSON event per line:
//!
//! ```bash
//! # Follow one page through splits and consolidations
//! jq 'select(.fields.pid == 16)' logs/bwtree.jsonl
//!
//! # Every help-along completion
//! jq 'select(.fields.message == "split parent step installed")' logs/bwtree.jsonl
//!
//! # Warnings and worse
//! jq 'select(.level == "WARN" or .level == "ERROR")' logs/bwtree.jsonl
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use bwtree::{BwTree, IndexConfig};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_FILE: &str = "bwtree.jsonl";
const DEFAULT_FILTER: &str = "info";

static INIT: Once = Once::new();

/// Install the console and NDJSON subscribers once per test binary.
pub fn init_tracing() {
    INIT.call_once(install_subscriber);
}

/// Index with tiny pages, so a few hundred keys already build several levels.
pub fn small_tree(allow_duplicates: bool) -> BwTree<u64, u64> {
    BwTree::with_config(
        IndexConfig::default()
            .with_page_bytes(64)
            .with_duplicates(allow_duplicates)
            .with_consolidate_threshold(4),
    )
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn log_dir() -> PathBuf {
    env::var_os("BWTREE_LOG_DIR").map_or_else(|| PathBuf::from("logs"), PathBuf::from)
}

/// Append mode: nextest runs every test in its own process.
fn open_log() -> Option<File> {
    let dir: PathBuf = log_dir();
    fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
        .ok()
}

fn install_subscriber() {
    let console = !env::var("BWTREE_LOG_CONSOLE").is_ok_and(|v| v == "0");

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .with_filter(filter())
    });

    // A read-only checkout still gets console output.
    let file_layer = open_log().map(|file| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(Mutex::new(file))
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter())
    });

    // Another harness may already own the global subscriber.
    let _ = Registry::default().with(console_layer).with(file_layer).try_init();
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "Fail fast in tests")]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("tracing initialised");
        tracing::debug!(pid = 3, chain_len = 8, "structured event");
    }

    #[test]
    fn test_small_tree_splits_early() {
        let tree = small_tree(false);
        for k in 0..64 {
            tree.insert(k, k).unwrap();
        }
        assert!(tree.height() >= 2);
    }
}
