use thiserror::Error;

/// The externally-observable error kinds from the runtime's error handling design:
/// each one maps to a distinct exit/diagnostic shape, independent of whatever
/// `anyhow::Context` string got attached along the way.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("image not found: {registry}/{name}:{tag}")]
    NotFound {
        registry: String,
        name: String,
        tag: String,
    },

    #[error("malformed manifest at {path}: {reason}")]
    ManifestParse { path: String, reason: String },

    #[error("network fabric operation failed: {0}")]
    FabricFailure(String),

    #[error("mount operation failed: {0}")]
    MountFailure(String),

    #[error("exec failed: {0}")]
    ExecFailure(String),
}
