use snafu::Snafu;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// An external command exited nonzero or could not be spawned. The
    /// message is the first line of stderr when there was one, else the
    /// synthesized exit status.
    #[snafu(display("{}", message))]
    CommandFailed { message: String },

    #[snafu(display("{}: timed out after {} seconds", command, seconds))]
    CommandTimeout { command: String, seconds: u32 },

    #[snafu(display("Could not lock {}: timed out", path.display()))]
    LockTimeout { path: PathBuf },

    #[snafu(display("Could not open lock file {}: {}", path.display(), source))]
    LockFile { path: PathBuf, source: io::Error },

    #[snafu(display("Invalid logical volume path '{}'", path))]
    InvalidVolumePath { path: String },

    #[snafu(display("Invalid size string '{}'", size))]
    InvalidSize { size: String },

    #[snafu(display(
        "Requested size {} too large (maximum {})",
        requested,
        maximum
    ))]
    SizeTooLarge { requested: String, maximum: String },

    #[snafu(display("Volume group {} does not exist", volume_group))]
    VolumeGroupMissing { volume_group: String },

    #[snafu(display("Logical volume {} already exists", path))]
    VolumeExists { path: String },

    #[snafu(display("Invalid network spec '{}', expected host:port", spec))]
    InvalidNetworkSpec { spec: String },

    #[snafu(display("Could not resolve host '{}': {}", host, source))]
    ResolveHost { host: String, source: io::Error },

    #[snafu(display("Configuration file {} does not exist", path.display()))]
    ConfigMissing { path: PathBuf },

    #[snafu(display("Configuration file version {} not supported", version))]
    ConfigVersionUnsupported { version: String },

    #[snafu(display("Failed to read configuration {}: {}", path.display(), source))]
    ConfigRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to parse configuration {}: {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Failed to serialize configuration: {}", source))]
    ConfigSerialize { source: toml::ser::Error },

    #[snafu(display("Failed to create temporary file in {}: {}", dir.display(), source))]
    ConfigTempfile { dir: PathBuf, source: io::Error },

    #[snafu(display("Failed to write configuration to {}: {}", path.display(), source))]
    ConfigPersist {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("Failed to remove configuration file {}: {}", path.display(), source))]
    ConfigRemove { path: PathBuf, source: io::Error },

    #[snafu(display("No target named '{}' in configuration", name))]
    UnknownTarget { name: String },

    #[snafu(display("No index service named '{}' in configuration", name))]
    UnknownIndex { name: String },

    #[snafu(display("Target '{}' already exists in configuration", name))]
    TargetExists { name: String },

    #[snafu(display("Failed to set up logger: {}", source))]
    Logger { source: log::SetLoggerError },
}
