// Archive assembly — zips the page files that survived the download phase.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use zip::write::FileOptions;
use zip::ZipWriter;

/// Filter the expected page file names down to those actually present in
/// the session directory. The fetcher's internal retries can still leave
/// pages missing; those are omitted from the archive.
pub fn surviving_pages(dir: &Path, expected: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| dir.join(name).is_file())
        .cloned()
        .collect()
}

/// Write `entries` (file names relative to `dir`) into a zip at
/// `dir/archive_name`. Blocking file I/O runs off the async runtime.
pub async fn pack(dir: &Path, entries: Vec<String>, archive_name: &str) -> Result<()> {
    let dir = dir.to_path_buf();
    let archive_path = dir.join(archive_name);

    tokio::task::spawn_blocking(move || write_zip(&dir, &entries, &archive_path))
        .await
        .context("archive task panicked")?
}

fn write_zip(dir: &Path, entries: &[String], archive_path: &PathBuf) -> Result<()> {
    let output = File::create(archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let mut zip = ZipWriter::new(output);
    let options = FileOptions::default();

    for entry in entries {
        let path = dir.join(entry);
        let mut input =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        zip.start_file(entry.as_str(), options)?;
        io::copy(&mut input, &mut zip)?;
    }

    zip.finish()?;
    debug!(
        "archive {} finalized with {} entries",
        archive_path.display(),
        entries.len()
    );
    Ok(())
}
