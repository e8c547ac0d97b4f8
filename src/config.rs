//! Ambient CLI configuration (§12). Lives outside the core: `open_repository`
//! and friends take an already-resolved path and never read the
//! environment themselves.

use std::env;
use std::path::PathBuf;

use derive_deref::Deref;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref GENERATOR_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").unwrap();
}

/// A validated manifest generator identifier (§6: `files.yaml`'s
/// `generator` field).
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct GeneratorId(String);

impl GeneratorId {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if GENERATOR_ID_PATTERN.is_match(&raw) {
            Some(GeneratorId(raw))
        } else {
            None
        }
    }

    pub fn default_for_crate() -> Self {
        GeneratorId(format!("mobilecombackup/{}", env!("CARGO_PKG_VERSION")))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub repo_root: PathBuf,
    pub verbose: bool,
    pub generator_id: GeneratorId,
}

impl Config {
    /// Resolves configuration from CLI flags (highest priority),
    /// `MOBILECOMBACKUP_*` environment variables, then built-in defaults.
    pub fn resolve(repo_root_flag: Option<PathBuf>, verbose_flag: bool, generator_id_flag: Option<String>) -> Self {
        let repo_root = repo_root_flag
            .or_else(|| env::var("MOBILECOMBACKUP_REPO_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let verbose = verbose_flag || env::var("MOBILECOMBACKUP_VERBOSE").is_ok();

        let generator_id = generator_id_flag
            .or_else(|| env::var("MOBILECOMBACKUP_GENERATOR_ID").ok())
            .and_then(GeneratorId::new)
            .unwrap_or_else(GeneratorId::default_for_crate);

        Config { repo_root, verbose, generator_id }
    }
}
