//! Error types for the ocibundle library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, Error>`. Streaming producers surface their failure through the
//! consumer's next read; external-process failures carry the captured
//! standard error of the converter.

use std::io;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for bundle, image and layer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A mutation referenced a layer index at or beyond the base image's
    /// layer count, or a layer selector resolved out of range.
    #[error("invalid layer index")]
    InvalidLayerIndex,

    /// No layer matches the given digest or diff-id.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// An index holds no child descriptor with the given digest.
    #[error("descriptor not found in index: {0}")]
    DescriptorNotFound(String),

    /// The operation is incompatible with the media type encountered.
    #[error("unexpected media type: {0}")]
    UnexpectedMediaType(String),

    /// A config override was not a config object while a standard config
    /// media type was set.
    #[error("unexpected config file type")]
    UnexpectedConfigFileType,

    /// The whiteout filter pass encountered an opaque marker whose parent
    /// was not recorded by the scan pass.
    #[error("unexpected opaque marker in {0:?}")]
    UnexpectedOpaque(String),

    /// The base layer's media type is neither a recognised tar layer nor
    /// SquashFS.
    #[error("unsupported layer type: {0}")]
    UnsupportedLayerType(String),

    /// No usable SquashFS converter program is available on the host.
    #[error("squashfs converter not supported: {0}")]
    SquashfsConverterNotSupported(String),

    /// An external converter exited with a failure status.
    #[error("{program} failed ({status}): {stderr}")]
    ConverterFailure {
        program: String,
        status: String,
        stderr: String,
    },

    /// A selector matched no root-index entry.
    #[error("no match found")]
    NoMatch,

    /// A selector matched more than one root-index entry.
    #[error("multiple matches found")]
    MultipleMatches,

    /// More than one root-index entry carries the same reference-name
    /// annotation value.
    #[error("multiple ref.name annotations found with same value")]
    MultipleRefNames,

    /// The requested platform does not match the image's config.
    #[error("image does not satisfy platform: {0}")]
    PlatformNotSatisfied(String),

    /// A referenced blob could not be read out of an index.
    #[error("unable to read blob from index: {0}")]
    BlobRead(String),

    /// No blob with the given digest is stored in the bundle.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// The bundle's descriptor table has no free slot left.
    #[error("descriptor table full")]
    DescriptorTableFull,

    /// The file is not a valid bundle.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// A digest string could not be parsed, or uses an algorithm other
    /// than SHA-256 where SHA-256 is required.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// OCI schema error.
    #[error("OCI spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),
}
