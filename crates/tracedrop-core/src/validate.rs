//! Trace-safety gate.
//!
//! Runs before any data leaves the machine. Two checks, in this order:
//!
//! 1. **CPU features**: the CPUID leaf 7 / sub-leaf 0 record is matched
//!    against [`BANNED_FEATURES`]. A feature is active when its bit is set
//!    in the record *and* the trace's XCR0 enables the state it needs. The
//!    analysis side cannot replay traces using them.
//! 2. **Environment**: each `KEY=VALUE` in the recorded environment is
//!    checked against [`SENSITIVE_VARIABLES`]; a hit means credentials were
//!    captured into the trace.
//!
//! Each violation spends one unit of the [`WarningBudget`]. With budget
//! left it is reported as a [`ValidationWarning`]; without, it is fatal.

use crate::trace_info::TraceMetadata;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Ebx,
    Ecx,
    Edx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BannedFeature {
    pub name: &'static str,
    pub register: Register,
    pub bit: u32,
    /// XCR0 bits that must all be set for the feature to be usable.
    pub xcr0: u64,
}

const XCR0_AVX512: u64 = 0xe0;
const XCR0_PKRU: u64 = 0x200;
const XCR0_AMX: u64 = 0x6_0000;

const fn feature(name: &'static str, register: Register, bit: u32, xcr0: u64) -> BannedFeature {
    BannedFeature {
        name,
        register,
        bit,
        xcr0,
    }
}

/// Leaf 7 / sub-leaf 0 features that must not be active in a submitted trace.
pub const BANNED_FEATURES: &[BannedFeature] = &[
    feature("avx512f", Register::Ebx, 16, XCR0_AVX512),
    feature("avx512dq", Register::Ebx, 17, XCR0_AVX512),
    feature("avx512ifma", Register::Ebx, 21, XCR0_AVX512),
    feature("avx512pf", Register::Ebx, 26, XCR0_AVX512),
    feature("avx512er", Register::Ebx, 27, XCR0_AVX512),
    feature("avx512cd", Register::Ebx, 28, XCR0_AVX512),
    feature("avx512bw", Register::Ebx, 30, XCR0_AVX512),
    feature("avx512vl", Register::Ebx, 31, XCR0_AVX512),
    feature("avx512vbmi", Register::Ecx, 1, XCR0_AVX512),
    feature("pku", Register::Ecx, 3, XCR0_PKRU),
    feature("avx512vbmi2", Register::Ecx, 6, XCR0_AVX512),
    feature("avx512vnni", Register::Ecx, 11, XCR0_AVX512),
    feature("avx512bitalg", Register::Ecx, 12, XCR0_AVX512),
    feature("avx512vpopcntdq", Register::Ecx, 14, XCR0_AVX512),
    feature("avx512_4vnniw", Register::Edx, 2, XCR0_AVX512),
    feature("avx512_4fmaps", Register::Edx, 3, XCR0_AVX512),
    feature("avx512_vp2intersect", Register::Edx, 8, XCR0_AVX512),
    feature("amx_bf16", Register::Edx, 22, XCR0_AMX),
    feature("avx512_fp16", Register::Edx, 23, XCR0_AVX512),
    feature("amx_tile", Register::Edx, 24, XCR0_AMX),
    feature("amx_int8", Register::Edx, 25, XCR0_AMX),
];

const fn leaf7_masks(features: &[BannedFeature]) -> [u32; 3] {
    let mut masks = [0u32; 3];
    let mut i = 0;
    while i < features.len() {
        let f = features[i];
        let idx = match f.register {
            Register::Ebx => 0,
            Register::Ecx => 1,
            Register::Edx => 2,
        };
        masks[idx] |= 1 << f.bit;
        i += 1;
    }
    masks
}

/// `[ebx, ecx, edx]` masks of every banned leaf 7 feature.
pub const BANNED_LEAF7_MASKS: [u32; 3] = leaf7_masks(BANNED_FEATURES);

/// Variable names whose presence in a trace means a credential was recorded.
pub const SENSITIVE_VARIABLES: &[&str] = &[
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "TRACEDROP_USER_SECRET_KEY",
    "SSHPASS",
    "STRIPE_SECRET_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITLAB_TOKEN",
    "NPM_TOKEN",
    "CARGO_REGISTRY_TOKEN",
    "PYPI_TOKEN",
    "DOCKER_PASSWORD",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "AZURE_CLIENT_SECRET",
    "VAULT_TOKEN",
];

/// Number of non-fatal violations the operator is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WarningBudget {
    remaining: u32,
}

impl WarningBudget {
    pub fn new(remaining: u32) -> Self {
        Self { remaining }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spend one unit. Returns false when nothing was left.
    pub fn spend(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Facts about the machine running the gate.
pub trait HostCapabilities: Send + Sync {
    /// Whether CPUID faulting is available, which is what lets the tracer
    /// hide features when re-recording.
    fn cpuid_faulting(&self) -> bool;
}

/// Reads `/proc/cpuinfo` for the `cpuid_fault` flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcCpuinfo;

impl HostCapabilities for ProcCpuinfo {
    fn cpuid_faulting(&self) -> bool {
        std::fs::read_to_string("/proc/cpuinfo")
            .map(|info| {
                info.lines()
                    .filter(|l| l.starts_with("flags"))
                    .any(|l| l.split_whitespace().any(|flag| flag == "cpuid_fault"))
            })
            .unwrap_or(false)
    }
}

/// Fixed answers, for tests and for operators who know their host.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHost {
    pub cpuid_faulting: bool,
}

impl HostCapabilities for StaticHost {
    fn cpuid_faulting(&self) -> bool {
        self.cpuid_faulting
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    CpuFeatures {
        features: Vec<&'static str>,
        /// The host cannot fault on CPUID, so re-recording without the
        /// features is impossible and the violation was let through.
        unenforceable: bool,
    },
    SensitiveVariable {
        name: String,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuFeatures {
                features,
                unenforceable: false,
            } => write!(
                f,
                "trace uses CPU features the analysis service cannot replay: {}",
                features.join(", ")
            ),
            Self::CpuFeatures {
                features,
                unenforceable: true,
            } => write!(
                f,
                "trace uses unsupported CPU features ({}) but this host lacks CPUID faulting, \
                 so they cannot be disabled; continuing anyway",
                features.join(", ")
            ),
            Self::SensitiveVariable { name } => write!(
                f,
                "trace environment contains {name}, which may disclose a credential"
            ),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "trace uses CPU features the analysis service cannot replay: {}.\n\
         Re-record with: {suggestion}",
        features.join(", ")
    )]
    BannedCpuFeatures {
        features: Vec<&'static str>,
        suggestion: String,
    },

    #[error(
        "trace environment contains {name}, which may disclose a credential.\n\
         Re-record with {name} unset (e.g. `env -u {name} rr record ...`)"
    )]
    SensitiveVariable { name: String },

    #[error("trace metadata has no `environ`; the tracer that produced it is too old")]
    IncompatibleTrace,
}

impl ValidationError {
    pub fn exit_code(&self) -> i32 {
        2
    }
}

/// Features from [`BANNED_FEATURES`] active in `meta`, in table order.
pub fn active_banned_features(meta: &TraceMetadata) -> Vec<&'static str> {
    let Some([_, ebx, ecx, edx]) = meta.cpuid(7, 0) else {
        return Vec::new();
    };

    BANNED_FEATURES
        .iter()
        .filter(|f| {
            let reg = match f.register {
                Register::Ebx => ebx,
                Register::Ecx => ecx,
                Register::Edx => edx,
            };
            reg & (1 << f.bit) != 0 && meta.xcr0 & f.xcr0 == f.xcr0
        })
        .map(|f| f.name)
        .collect()
}

/// Command line to re-record with every banned leaf 7 feature masked out.
pub fn rerecord_suggestion() -> String {
    let [ebx, ecx, edx] = BANNED_LEAF7_MASKS;
    format!("rr record --disable-cpuid-features-leaf7 0x{ebx:x},0x{ecx:x},0x{edx:x} <program>")
}

pub struct Validator<'a> {
    host: &'a dyn HostCapabilities,
}

impl<'a> Validator<'a> {
    pub fn new(host: &'a dyn HostCapabilities) -> Self {
        Self { host }
    }

    /// Apply the gate. Warnings are returned in discovery order, CPU
    /// features first; `budget` is decremented for each one.
    pub fn validate(
        &self,
        meta: &TraceMetadata,
        budget: &mut WarningBudget,
    ) -> Result<Vec<ValidationWarning>, ValidationError> {
        let mut warnings = Vec::new();

        let features = active_banned_features(meta);
        if !features.is_empty() {
            if budget.spend() {
                warnings.push(ValidationWarning::CpuFeatures {
                    features,
                    unenforceable: false,
                });
            } else if !self.host.cpuid_faulting() {
                warnings.push(ValidationWarning::CpuFeatures {
                    features,
                    unenforceable: true,
                });
            } else {
                return Err(ValidationError::BannedCpuFeatures {
                    features,
                    suggestion: rerecord_suggestion(),
                });
            }
        }

        for key in meta.env_keys() {
            if !SENSITIVE_VARIABLES.contains(&key) {
                continue;
            }
            if budget.spend() {
                warnings.push(ValidationWarning::SensitiveVariable {
                    name: key.to_string(),
                });
            } else {
                return Err(ValidationError::SensitiveVariable {
                    name: key.to_string(),
                });
            }
        }

        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(xcr0: u64, leaf7: Option<[i64; 3]>, environ: &[&str]) -> TraceMetadata {
        TraceMetadata {
            xcr0,
            cpuid_records: leaf7
                .map(|[b, c, d]| vec![vec![7, 0, 0, b, c, d]])
                .unwrap_or_default(),
            environ: environ.iter().map(|s| s.to_string()).collect(),
        }
    }

    const FAULTING: StaticHost = StaticHost {
        cpuid_faulting: true,
    };

    #[test]
    fn test_masks_cover_table() {
        let [ebx, ecx, edx] = BANNED_LEAF7_MASKS;
        assert_eq!(ebx, 0xdc23_0000);
        assert_eq!(ecx, 0x584a);
        assert_eq!(edx, 0x03c0_010c);
    }

    #[test]
    fn test_feature_needs_xcr0_enablement() {
        let avx512f = 1 << 16;
        assert!(active_banned_features(&meta(0x7, Some([avx512f, 0, 0]), &[])).is_empty());
        assert_eq!(
            active_banned_features(&meta(0xe7, Some([avx512f, 0, 0]), &[])),
            vec!["avx512f"]
        );
    }

    #[test]
    fn test_clean_trace_passes_without_spending() {
        let mut budget = WarningBudget::new(1);
        let warnings = Validator::new(&FAULTING)
            .validate(&meta(0xe7, Some([0, 0, 0]), &["HOME=/root"]), &mut budget)
            .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(budget.remaining(), 1);
    }

    #[test]
    fn test_cpu_violation_is_fatal_without_budget() {
        let mut budget = WarningBudget::new(0);
        let err = Validator::new(&FAULTING)
            .validate(&meta(0x2e7, Some([0, 1 << 3, 0]), &[]), &mut budget)
            .unwrap_err();
        match err {
            ValidationError::BannedCpuFeatures {
                features,
                suggestion,
            } => {
                assert_eq!(features, vec!["pku"]);
                assert!(suggestion.contains("--disable-cpuid-features-leaf7"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cpu_violation_downgraded_without_cpuid_faulting() {
        let host = StaticHost {
            cpuid_faulting: false,
        };
        let mut budget = WarningBudget::new(0);
        let warnings = Validator::new(&host)
            .validate(&meta(0xe7, Some([1 << 16, 0, 0]), &[]), &mut budget)
            .unwrap();
        assert_eq!(
            warnings,
            vec![ValidationWarning::CpuFeatures {
                features: vec!["avx512f"],
                unenforceable: true
            }]
        );
    }

    #[test]
    fn test_sensitive_variable_with_value_containing_equals() {
        let mut budget = WarningBudget::new(0);
        let err = Validator::new(&FAULTING)
            .validate(&meta(0, None, &["SSHPASS=a=b"]), &mut budget)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::SensitiveVariable {
                name: "SSHPASS".into()
            }
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_similar_names_are_not_flagged() {
        let mut budget = WarningBudget::new(0);
        Validator::new(&FAULTING)
            .validate(&meta(0, None, &["SSHPASS_HINT=1", "XSSHPASS=1"]), &mut budget)
            .unwrap();
    }
}
