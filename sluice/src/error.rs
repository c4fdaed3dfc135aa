use std::path::PathBuf;

use sluice_ingest_core::IngestError;
use sluice_observability::ObservabilityError;
use snafu::Snafu;

/// CLI error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("Failed to read {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write {}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid catalog file {}", path.display()))]
    InvalidCatalog {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("Invalid message on line {line}"))]
    InvalidMessage {
        line: usize,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to write checkpoint acknowledgements"))]
    WriteAcks { source: std::io::Error },
    #[snafu(display("Failed to read input messages"))]
    ReadInput { source: std::io::Error },
    #[snafu(display("Invalid {name} argument: {message}"))]
    InvalidArgument { name: &'static str, message: String },
    #[snafu(display("Ingest error"))]
    Ingest { source: IngestError },
    #[snafu(display("Observability error"))]
    Observability { source: ObservabilityError },
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
