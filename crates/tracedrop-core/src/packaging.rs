//! Trace preparation before archiving.
//!
//! Makes a trace directory self-contained: packs it with `rr pack`, copies
//! in the host files the analysis side needs and records who produced it.

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::trace_info::path_arg;
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Host locations searched for `libthread_db.so`, first hit wins.
pub const LIBTHREAD_DB_CANDIDATES: &[&str] = &[
    "/usr/lib64/libthread_db.so",
    "/usr/lib/x86_64-linux-gnu/libthread_db.so",
];

pub const PRODUCER_METADATA_FILE: &str = "producer-metadata";
pub const SYSTEM_DEBUGINFO_DIR: &str = "files.system-debuginfo";
pub const USER_FILES_DIR: &str = "files.user";
pub const MOZILLA_DIR: &str = "files.mozilla";
const EXTRA_TRACE_FILES_DIR: &str = "extra_rr_trace_files";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid mapping pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("failed to encode producer metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PackagingError {
    pub fn exit_code(&self) -> i32 {
        7
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PackagingError + '_ {
    move |source| PackagingError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Title and URL the operator attached to the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Skip `rr pack`, for traces that were packed already.
    pub skip_pack: bool,
    pub producer: ProducerMetadata,
    pub user: String,
    pub group: String,
}

pub struct TracePreparer<'a> {
    runner: &'a dyn CommandRunner,
    libthread_db_candidates: Vec<PathBuf>,
}

impl<'a> TracePreparer<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            libthread_db_candidates: LIBTHREAD_DB_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_libthread_db_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.libthread_db_candidates = candidates;
        self
    }

    /// Run every preparation step on `trace_dir`.
    pub async fn prepare(
        &self,
        trace_dir: &Path,
        options: &PrepareOptions,
    ) -> Result<(), PackagingError> {
        if options.skip_pack {
            tracing::info!("skipping rr pack");
        } else {
            self.rr_pack(trace_dir).await?;
        }
        self.package_libthread_db(trace_dir)?;
        self.package_extra_rr_trace_files(trace_dir).await?;
        self.package_mozilla_application_ini(trace_dir).await?;
        write_producer_metadata(trace_dir, &options.producer)?;
        write_files_user(trace_dir, &options.user, &options.group)?;
        Ok(())
    }

    pub async fn rr_pack(&self, trace_dir: &Path) -> Result<(), PackagingError> {
        tracing::info!("Running 'rr pack'...");
        let spec = CommandSpec::new(["rr".to_string(), "pack".to_string(), path_arg(trace_dir)]);
        CommandError::check(&spec, self.runner.run(&spec).await?)?;
        Ok(())
    }

    /// Copy the host's `libthread_db.so`, world-readable, into the trace.
    pub fn package_libthread_db(
        &self,
        trace_dir: &Path,
    ) -> Result<Option<PathBuf>, PackagingError> {
        let Some(src) = self.libthread_db_candidates.iter().find(|p| p.is_file()) else {
            return Ok(None);
        };

        tracing::info!("Copying {} into trace...", src.display());
        let dest = trace_dir.join(SYSTEM_DEBUGINFO_DIR).join("libthread_db.so");
        copy_replace_file(src, &dest)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o555))
                .map_err(io_error(&dest))?;
        }
        Ok(Some(dest))
    }

    /// Merge every `extra_rr_trace_files` directory sitting next to a mapped
    /// binary into the trace root.
    pub async fn package_extra_rr_trace_files(
        &self,
        trace_dir: &Path,
    ) -> Result<Vec<PathBuf>, PackagingError> {
        let mut extra_dirs = BTreeSet::new();
        for mapping in mapped_files(trace_dir, &Glob::new("mmap_*")?.compile_matcher())? {
            for original in self.original_names(&mapping).await? {
                if let Some(parent) = original.parent() {
                    let candidate = parent.join(EXTRA_TRACE_FILES_DIR);
                    if candidate.is_dir() {
                        extra_dirs.insert(candidate);
                    }
                }
            }
        }

        for dir in &extra_dirs {
            tracing::debug!(dir = %dir.display(), "merging extra trace files");
            for entry in fs::read_dir(dir).map_err(io_error(dir))? {
                let src = entry.map_err(io_error(dir))?.path();
                let dest = trace_dir.join(src.file_name().unwrap_or_default());
                if src.is_file() {
                    copy_replace_file(&src, &dest)?;
                } else {
                    copy_tree(&src, &dest)?;
                }
            }
        }
        Ok(extra_dirs.into_iter().collect())
    }

    /// Copy the `application.ini` of a recorded Firefox build, if any.
    pub async fn package_mozilla_application_ini(
        &self,
        trace_dir: &Path,
    ) -> Result<Option<PathBuf>, PackagingError> {
        let matcher = Glob::new("mmap_*_firefox*")?.compile_matcher();
        for mapping in mapped_files(trace_dir, &matcher)? {
            for original in self.original_names(&mapping).await? {
                let Some(parent) = original.parent() else {
                    continue;
                };
                let ini = parent.join("application.ini");
                if ini.is_file() {
                    let dest = trace_dir.join(MOZILLA_DIR).join("application.ini");
                    copy_replace_file(&ini, &dest)?;
                    return Ok(Some(dest));
                }
            }
        }
        Ok(None)
    }

    /// Paths the tracer recorded for a mapping file, via `rr filename`.
    async fn original_names(&self, mapping: &Path) -> Result<Vec<PathBuf>, PackagingError> {
        let spec = CommandSpec::new(["rr".to_string(), "filename".to_string(), path_arg(mapping)]);
        let output = CommandError::check(&spec, self.runner.run(&spec).await?)?;
        Ok(output
            .stdout_lossy()
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

pub fn write_producer_metadata(
    trace_dir: &Path,
    producer: &ProducerMetadata,
) -> Result<(), PackagingError> {
    let path = trace_dir.join(PRODUCER_METADATA_FILE);
    let json = serde_json::to_vec(producer)?;
    fs::write(&path, json).map_err(io_error(&path))
}

pub fn write_files_user(trace_dir: &Path, user: &str, group: &str) -> Result<(), PackagingError> {
    let dir = trace_dir.join(USER_FILES_DIR);
    fs::create_dir_all(&dir).map_err(io_error(&dir))?;
    for (name, value) in [("user", user), ("group", group)] {
        let path = dir.join(name);
        fs::write(&path, value).map_err(io_error(&path))?;
    }
    Ok(())
}

/// Sorted top-level files of `trace_dir` whose names match `matcher`.
fn mapped_files(trace_dir: &Path, matcher: &GlobMatcher) -> Result<Vec<PathBuf>, PackagingError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(trace_dir).map_err(io_error(trace_dir))? {
        let path = entry.map_err(io_error(trace_dir))?.path();
        if path.file_name().is_some_and(|name| matcher.is_match(name)) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Replace `dst` with a copy of `src`, creating parent directories.
fn copy_replace_file(src: &Path, dst: &Path) -> Result<(), PackagingError> {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
        }
        Err(e) => return Err(io_error(dst)(e)),
    }
    fs::copy(src, dst).map_err(io_error(dst))?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), PackagingError> {
    fs::create_dir_all(dst).map_err(io_error(dst))?;
    for entry in fs::read_dir(src).map_err(io_error(src))? {
        let child = entry.map_err(io_error(src))?.path();
        let target = dst.join(child.file_name().unwrap_or_default());
        if child.is_dir() {
            copy_tree(&child, &target)?;
        } else {
            copy_replace_file(&child, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Answers `rr filename <mapping>` from a table; every other command succeeds.
    #[derive(Default)]
    struct FakeRr {
        filenames: HashMap<String, String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRr {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.argv.clone());
            let stdout = match spec.argv.get(1).map(String::as_str) {
                Some("filename") => self
                    .filenames
                    .get(&spec.argv[2])
                    .cloned()
                    .unwrap_or_default(),
                _ => String::new(),
            };
            Ok(CommandOutput {
                code: Some(0),
                stdout: stdout.into_bytes(),
                stderr: vec![],
            })
        }
    }

    #[test]
    fn test_producer_metadata_omits_absent_keys() {
        let tmp = TempDir::new().unwrap();
        write_producer_metadata(
            tmp.path(),
            &ProducerMetadata {
                title: Some("FAKE TITLE".into()),
                url: None,
            },
        )
        .unwrap();
        let json = fs::read_to_string(tmp.path().join(PRODUCER_METADATA_FILE)).unwrap();
        assert_eq!(json, r#"{"title":"FAKE TITLE"}"#);
    }

    #[tokio::test]
    async fn test_prepare_writes_identity_and_respects_skip_pack() {
        let tmp = TempDir::new().unwrap();
        let rr = FakeRr::default();
        let options = PrepareOptions {
            skip_pack: true,
            user: "alice@example.com".into(),
            group: "eng".into(),
            ..Default::default()
        };

        TracePreparer::new(&rr)
            .with_libthread_db_candidates(vec![])
            .prepare(tmp.path(), &options)
            .await
            .unwrap();

        let user = fs::read_to_string(tmp.path().join("files.user/user")).unwrap();
        let group = fs::read_to_string(tmp.path().join("files.user/group")).unwrap();
        assert_eq!((user.as_str(), group.as_str()), ("alice@example.com", "eng"));
        assert!(rr.calls.lock().unwrap().iter().all(|c| c[1] != "pack"));
    }

    #[tokio::test]
    async fn test_extra_trace_files_are_merged() {
        let trace = TempDir::new().unwrap();
        let build = TempDir::new().unwrap();
        let extra = build.path().join("out/extra_rr_trace_files/files.extra");
        fs::create_dir_all(&extra).unwrap();
        fs::write(extra.join("data"), "Hello kitty").unwrap();

        let mapping = trace.path().join("mmap_01_main");
        fs::write(&mapping, b"").unwrap();
        let mut rr = FakeRr::default();
        rr.filenames.insert(
            mapping.display().to_string(),
            format!("{}\n", build.path().join("out/main").display()),
        );

        let dirs = TracePreparer::new(&rr)
            .package_extra_rr_trace_files(trace.path())
            .await
            .unwrap();
        assert_eq!(dirs.len(), 1);
        let copied = fs::read_to_string(trace.path().join("files.extra/data")).unwrap();
        assert_eq!(copied, "Hello kitty");
    }

    #[tokio::test]
    async fn test_application_ini_only_for_firefox_mappings() {
        let trace = TempDir::new().unwrap();
        let build = TempDir::new().unwrap();
        fs::write(build.path().join("application.ini"), "[App]\nName=Firefox\n").unwrap();

        let mapping = trace.path().join("mmap_7_firefox-bin");
        fs::write(&mapping, b"").unwrap();
        let mut rr = FakeRr::default();
        rr.filenames.insert(
            mapping.display().to_string(),
            build.path().join("firefox-bin").display().to_string(),
        );

        let dest = TracePreparer::new(&rr)
            .package_mozilla_application_ini(trace.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dest, trace.path().join("files.mozilla/application.ini"));
        assert!(dest.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_libthread_db_copied_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let trace = TempDir::new().unwrap();
        let host = TempDir::new().unwrap();
        let lib = host.path().join("libthread_db.so");
        fs::write(&lib, b"\x7fELF").unwrap();

        let rr = FakeRr::default();
        let dest = TracePreparer::new(&rr)
            .with_libthread_db_candidates(vec![host.path().join("missing.so"), lib])
            .package_libthread_db(trace.path())
            .unwrap()
            .unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
    }
}
