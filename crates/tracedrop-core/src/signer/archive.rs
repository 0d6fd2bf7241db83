//! Compressed, reproducible archive of a trace directory.
//!
//! Entries are walked in sorted order and written with deterministic tar
//! headers (fixed mtime, uid/gid 0), so an unchanged directory always yields
//! the same payload bytes. Top-level entries matching the exclusion globs
//! (the trace's private `db*` index) are never archived.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, HeaderMode};

/// Top-level entries that must never leave the machine.
pub const DEFAULT_EXCLUDES: &[&str] = &["db*"];

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub excludes: Vec<String>,
    pub level: i32,
    pub workers: u32,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            level: 3,
            workers: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

impl ArchiveOptions {
    pub(crate) fn exclude_set(&self) -> io::Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.excludes {
            let glob = Glob::new(pattern).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad exclude glob: {e}"))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }
}

/// Archive `source` as tar + zstd into `out`, returning `out` once the
/// compressed stream has been fully written.
pub fn write_archive<W: Write>(source: &Path, out: W, options: &ArchiveOptions) -> io::Result<W> {
    let excludes = options.exclude_set()?;

    let mut encoder = zstd::stream::write::Encoder::new(out, options.level)?;
    if options.workers > 1 {
        encoder.multithread(options.workers)?;
    }

    let mut tar = Builder::new(encoder);
    tar.mode(HeaderMode::Deterministic);
    tar.follow_symlinks(false);

    for entry in sorted_entries(source)? {
        let name = entry.file_name().map(PathBuf::from).unwrap_or_default();
        if excludes.is_match(&name) {
            tracing::debug!(entry = %name.display(), "excluded from archive");
            continue;
        }
        append_tree(&mut tar, &entry, &name)?;
    }

    let encoder = tar.into_inner()?;
    encoder.finish()
}

fn append_tree<W: Write>(tar: &mut Builder<W>, path: &Path, name: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        tar.append_dir(name, path)?;
        for child in sorted_entries(path)? {
            let child_name = name.join(child.file_name().unwrap_or_default());
            append_tree(tar, &child, &child_name)?;
        }
        Ok(())
    } else {
        tar.append_path_with_name(path, name)
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}
