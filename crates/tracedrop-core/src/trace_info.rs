//! Trace metadata as reported by the tracer (`rr traceinfo`).

use crate::command::{CommandError, CommandRunner, CommandSpec};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Recorded machine state relevant to the safety gate. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    #[serde(default, deserialize_with = "de_u64_or_string")]
    pub xcr0: u64,
    /// `[leaf, subleaf, eax, ebx, ecx, edx]` per record.
    #[serde(default)]
    pub cpuid_records: Vec<Vec<i64>>,
    /// `KEY=VALUE` entries in recording order.
    pub environ: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TraceInfoError {
    #[error("trace metadata has no `environ`; the tracer that produced it is too old")]
    Incompatible,

    #[error("malformed trace metadata: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TraceMetadata {
    pub fn from_json(json: &str) -> Result<Self, TraceInfoError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if value.get("environ").is_none() {
            return Err(TraceInfoError::Incompatible);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, TraceInfoError> {
        let json = std::fs::read_to_string(path).map_err(|source| TraceInfoError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Ask `rr traceinfo` for the metadata of `trace_dir`.
    pub async fn from_rr(
        runner: &dyn CommandRunner,
        trace_dir: &Path,
    ) -> Result<Self, TraceInfoError> {
        let spec = CommandSpec::new([
            "rr".to_string(),
            "traceinfo".to_string(),
            path_arg(trace_dir),
        ]);
        let output = CommandError::check(&spec, runner.run(&spec).await?)?;
        Self::from_json(&output.stdout_lossy())
    }

    /// The `[eax, ebx, ecx, edx]` result recorded for `leaf`/`subleaf`.
    pub fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<[u32; 4]> {
        self.cpuid_records
            .iter()
            .filter(|r| r.len() >= 6)
            .find(|r| r[0] == i64::from(leaf) && r[1] == i64::from(subleaf))
            .map(|r| [r[2] as u32, r[3] as u32, r[4] as u32, r[5] as u32])
    }

    /// Variable names in `environ`, in recording order.
    pub fn env_keys(&self) -> impl Iterator<Item = &str> {
        self.environ
            .iter()
            .map(|entry| entry.split_once('=').map_or(entry.as_str(), |(k, _)| k))
    }
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn de_u64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|e| de::Error::custom(format!("invalid xcr0 {s:?}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every command with one canned output.
    struct CannedRr {
        output: CommandOutput,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CannedRr {
        fn new(code: i32, stdout: &str) -> Self {
            Self {
                output: CommandOutput {
                    code: Some(code),
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: b"rr: no such trace".to_vec(),
                },
                calls: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for CannedRr {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.argv.clone());
            Ok(self.output.clone())
        }
    }

    #[test]
    fn test_parses_string_xcr0_and_records() {
        let meta = TraceMetadata::from_json(
            r#"{"xcr0":"231","cpuidRecords":[[7,0,0,65536,0,0],[1,0,1,2,3,4]],"environ":["A=1","B"]}"#,
        )
        .unwrap();
        assert_eq!(meta.xcr0, 231);
        assert_eq!(meta.cpuid(7, 0), Some([0, 65536, 0, 0]));
        assert_eq!(meta.cpuid(7, 1), None);
        assert_eq!(meta.env_keys().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_numeric_and_hex_xcr0() {
        let a = TraceMetadata::from_json(r#"{"xcr0":231,"environ":[]}"#).unwrap();
        let b = TraceMetadata::from_json(r#"{"xcr0":"0xe7","environ":[]}"#).unwrap();
        assert_eq!(a.xcr0, b.xcr0);
    }

    #[test]
    fn test_missing_environ_is_incompatible() {
        assert!(matches!(
            TraceMetadata::from_json(r#"{"xcr0":7,"cpuidRecords":[]}"#),
            Err(TraceInfoError::Incompatible)
        ));
    }

    #[test]
    fn test_short_records_are_ignored() {
        let meta =
            TraceMetadata::from_json(r#"{"cpuidRecords":[[7,0,1]],"environ":[]}"#).unwrap();
        assert_eq!(meta.cpuid(7, 0), None);
    }

    #[test]
    fn test_leaf_beyond_u32_does_not_alias() {
        let meta = TraceMetadata::from_json(
            r#"{"cpuidRecords":[[4294967303,0,0,65536,0,0]],"environ":[]}"#,
        )
        .unwrap();
        assert_eq!(meta.cpuid(7, 0), None);
    }

    #[tokio::test]
    async fn test_from_rr_parses_traceinfo_output() {
        let rr = CannedRr::new(
            0,
            r#"{
  "xcr0": "231",
  "cpuidRecords": [[7, 0, 0, 0, 0, 0]],
  "environ": ["LANG=C"]
}
"#,
        );
        let meta = TraceMetadata::from_rr(&rr, Path::new("/traces/latest")).await.unwrap();

        assert_eq!(meta.xcr0, 231);
        assert_eq!(meta.environ, vec!["LANG=C"]);
        assert_eq!(rr.calls.lock().unwrap()[0], vec!["rr", "traceinfo", "/traces/latest"]);
    }

    #[tokio::test]
    async fn test_from_rr_failure_is_command_error() {
        let rr = CannedRr::new(1, "");
        let err = TraceMetadata::from_rr(&rr, Path::new("/nope")).await.unwrap_err();
        assert!(matches!(err, TraceInfoError::Command(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_from_rr_without_environ_is_incompatible() {
        let rr = CannedRr::new(0, r#"{"xcr0":7,"cpuidRecords":[]}"#);
        let err = TraceMetadata::from_rr(&rr, Path::new("/old")).await.unwrap_err();
        assert!(matches!(err, TraceInfoError::Incompatible));
    }
}
