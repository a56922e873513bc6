//! Chain-of-custody record for one acquisition.

/// Version string embedded in every custody record.
pub fn version_string() -> String {
    format!("custos {}", env!("CARGO_PKG_VERSION"))
}

/// The provenance record for one container creation.
///
/// Every field is captured verbatim so the rendered text block is
/// reproducible and auditable. The record aggregates already-computed
/// hash and error logs; it does not sign anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyRecord {
    /// RFC3339 wall-clock timestamps, second precision.
    pub started: String,
    pub finished: String,
    pub version: String,
    /// Full command line this process was invoked with.
    pub invocation: String,
    pub working_dir: String,
    /// Source identifier: device path, file path, or `-` for stdin.
    pub source: String,
    pub destination: String,
    /// Name of the acquisition entry inside the container.
    pub entry: String,
    /// The exact data-mover command line, hashing parameters included.
    pub mover_command: String,
}

impl CustodyRecord {
    /// Render the record as the plain-text container entry.
    pub fn render(&self) -> String {
        format!(
            "Started: {}\n\
             Version: {}\n\
             Invocation: {}\n\
             Working directory: {}\n\
             Source: {}\n\
             Destination: {}\n\
             Entry: {}\n\
             Acquisition command: {}\n\
             Completed: {}\n",
            self.started,
            self.version,
            self.invocation,
            self.working_dir,
            self.source,
            self.destination,
            self.entry,
            self.mover_command,
            self.finished,
        )
    }
}
