use std::path::PathBuf;

use thiserror::Error;

/// Startup-only configuration failures (`spec.md` §7's Configuration class):
/// rule-file parse errors, missing required CLI combinations, bad interface
/// names. All surfaced to `main` and mapped to a non-zero exit code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open rule file {0:?}: {1}")]
    RuleFileOpen(PathBuf, std::io::Error),

    #[error("rule file {path:?} line {line}: {reason}")]
    RuleParse { path: PathBuf, line: usize, reason: String },

    #[error("rule file {path:?} line {line}: action=fwd requires out_iface")]
    MissingOutIface { path: PathBuf, line: usize },
}
