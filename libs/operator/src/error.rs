use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors surfaced by the reconciliation engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("values error: {0}")]
    ValuesError(String),

    #[error("chart error: {0}")]
    ChartError(String),

    #[error("template rendering error: {0}")]
    TemplateError(#[source] tera::Error),

    #[error("release storage error: {0}")]
    StorageError(String),

    /// Distinguished "release not found". Uninstall treats this as success.
    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("invalid watch configuration: {0}")]
    WatchesError(String),

    #[error("action configuration error: {0}")]
    ConfigError(String),

    #[error("discovery failed for {gvk}: {message}")]
    DiscoveryError { gvk: String, message: String },

    /// Best-effort cleanup after a failed install itself failed.
    #[error("uninstall failed: {uninstall}; original install error: {install}")]
    InstallCleanupError { uninstall: String, install: String },

    /// Forced rollback after a failed upgrade itself failed.
    #[error("rollback failed: {rollback}; original upgrade error: {upgrade}")]
    RollbackError { rollback: String, upgrade: String },

    #[error("status update error: {0}")]
    StatusUpdateError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("manifest error: {0}")]
    ManifestError(String),

    #[error("extension error: {0}")]
    ExtensionError(String),

    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Stable, low-cardinality label for the failure counter.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::ValuesError(_) => "values",
            Error::ChartError(_) => "chart",
            Error::TemplateError(_) => "template",
            Error::StorageError(_) => "storage",
            Error::ReleaseNotFound(_) => "release_not_found",
            Error::WatchesError(_) => "watches",
            Error::ConfigError(_) => "config",
            Error::DiscoveryError { .. } => "discovery",
            Error::InstallCleanupError { .. } => "install_cleanup",
            Error::RollbackError { .. } => "rollback",
            Error::StatusUpdateError(_) => "status_update",
            Error::SerializationError(_) => "serialization",
            Error::ManifestError(_) => "manifest",
            Error::ExtensionError(_) => "extension",
            Error::InvalidTraceId => "invalid_trace_id",
        }
        .to_string()
    }

    pub fn is_release_not_found(&self) -> bool {
        matches!(self, Error::ReleaseNotFound(_))
    }
}

/// True when the API rejected a write because of a stale resourceVersion.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True when the API reported the object missing.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
