//! Tagged-variant parameter model for the argument-transit protocol.
//!
//! [`Parameter`] is the client/worker-side representation of every argument
//! a caller can supply. It is a strict superset of [`WireParameter`], the
//! subset that is actually allowed to cross the broker: local-file and
//! in-process stream variants must be converted to their cloud-file
//! counterparts by a transit pipeline before an envelope is built (see
//! `cmdproxy-client`/`cmdproxy-worker`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use cmdproxy_blobstore::BlobStore;
use cmdproxy_error::CmdproxyError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Returns the name of the local host, used as the default hostname for
/// local-kind file parameters and stream-staged blobs.
///
/// Falls back to `"localhost"` if the hostname cannot be determined (e.g.
/// in a minimal container without `/etc/hostname` or `HOSTNAME` set).
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ---------------------------------------------------------------------------
// WireParameter — the serialisable subset
// ---------------------------------------------------------------------------

/// The subset of [`Parameter`] variants allowed inside a serialised
/// envelope. Encodes as a single-key JSON object per variant, e.g.
/// `{"Str": {"value": "..."}}`, matching the wire format in spec §6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireParameter {
    /// Literal string argument.
    Str {
        /// The literal value.
        value: String,
    },
    /// Resolved against the caller's environment at client send time.
    Env {
        /// Environment variable name.
        name: String,
    },
    /// Resolved against the worker's environment at execution time.
    RemoteEnv {
        /// Environment variable name.
        name: String,
    },
    /// Command identified by logical name, resolved via the server's
    /// command palette.
    CmdName {
        /// Logical command name.
        name: String,
    },
    /// Absolute executable path on the worker.
    CmdPath {
        /// Absolute (or `PATH`-resolvable) executable path.
        path: String,
    },
    /// Named-placeholder template; children are recursively wire-safe.
    Format {
        /// Template string with `{name}` placeholders.
        tmpl: String,
        /// Placeholder name to child parameter.
        args: IndexMap<String, WireParameter>,
    },
    /// Input file already present in the blob store.
    InCloudFile {
        /// Path component of the canonical blob name.
        path: String,
        /// Hostname component of the canonical blob name.
        hostname: String,
    },
    /// Output slot in the blob store; the worker writes here.
    OutCloudFile {
        /// Path component of the canonical blob name.
        path: String,
        /// Hostname component of the canonical blob name.
        hostname: String,
    },
}

impl WireParameter {
    /// Decode a single parameter from its JSON wire representation.
    ///
    /// Rejects unknown variant tags with
    /// [`cmdproxy_error::ErrorCode::EnvelopeDecode`].
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CmdproxyError> {
        serde_json::from_value(value.clone())
            .map_err(|e| CmdproxyError::envelope_decode(format!("invalid parameter: {e}")))
    }

    /// Encode to its JSON wire representation.
    pub fn to_json(&self) -> Result<serde_json::Value, CmdproxyError> {
        serde_json::to_value(self)
            .map_err(|e| CmdproxyError::envelope_decode(format!("cannot encode parameter: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Parameter — the full client/worker-side type
// ---------------------------------------------------------------------------

/// Byte source for staging an input blob: either a local file path or an
/// in-process reader supplied by the caller.
pub enum ByteSource {
    /// Read the bytes from a path on the local filesystem.
    Path(String),
    /// Read the bytes from an in-memory buffer already captured from the
    /// caller's reader.
    Bytes(Vec<u8>),
}

/// The full parameter type. A strict superset of [`WireParameter`]; see the
/// module docs for the relationship between the two.
pub enum Parameter {
    /// Literal string argument.
    Str(String),
    /// Resolved against the caller's environment at client send time.
    Env {
        /// Environment variable name.
        name: String,
    },
    /// Resolved against the worker's environment at execution time.
    RemoteEnv {
        /// Environment variable name.
        name: String,
    },
    /// Command identified by logical name.
    CmdName {
        /// Logical command name.
        name: String,
    },
    /// Absolute executable path on the worker.
    CmdPath {
        /// Absolute (or `PATH`-resolvable) executable path.
        path: String,
    },
    /// Named-placeholder template; children recurse.
    Format {
        /// Template string with `{name}` placeholders.
        tmpl: String,
        /// Placeholder name to child parameter, in caller-supplied order.
        args: IndexMap<String, Parameter>,
    },
    /// Input file living on the caller's host.
    InLocalFile {
        /// Path on the caller's filesystem.
        path: String,
    },
    /// Output file to be written back to the caller's host.
    OutLocalFile {
        /// Path on the caller's filesystem.
        path: String,
    },
    /// Input file already present in the blob store under `@hostname:path`.
    InCloudFile {
        /// Path component of the canonical blob name.
        path: String,
        /// Hostname component of the canonical blob name.
        hostname: String,
    },
    /// Output slot in the blob store; worker writes here.
    OutCloudFile {
        /// Path component of the canonical blob name.
        path: String,
        /// Hostname component of the canonical blob name.
        hostname: String,
    },
    /// Caller-side byte source staged as an input blob. Client-only; never
    /// serialised.
    InStream {
        /// Bytes to upload, captured from the caller's reader.
        bytes: Vec<u8>,
        /// Cloud-only blob name the bytes are staged under.
        filename: String,
    },
    /// Caller-side byte sink filled from a blob after execution.
    /// Client-only; never serialised.
    OutStream {
        /// Cloud-only blob name the result is downloaded from.
        filename: String,
    },
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => f.debug_tuple("Str").field(v).finish(),
            Self::Env { name } => f.debug_struct("Env").field("name", name).finish(),
            Self::RemoteEnv { name } => f.debug_struct("RemoteEnv").field("name", name).finish(),
            Self::CmdName { name } => f.debug_struct("CmdName").field("name", name).finish(),
            Self::CmdPath { path } => f.debug_struct("CmdPath").field("path", path).finish(),
            Self::Format { tmpl, args } => f
                .debug_struct("Format")
                .field("tmpl", tmpl)
                .field("args", args)
                .finish(),
            Self::InLocalFile { path } => {
                f.debug_struct("InLocalFile").field("path", path).finish()
            }
            Self::OutLocalFile { path } => {
                f.debug_struct("OutLocalFile").field("path", path).finish()
            }
            Self::InCloudFile { path, hostname } => f
                .debug_struct("InCloudFile")
                .field("path", path)
                .field("hostname", hostname)
                .finish(),
            Self::OutCloudFile { path, hostname } => f
                .debug_struct("OutCloudFile")
                .field("path", path)
                .field("hostname", hostname)
                .finish(),
            Self::InStream { filename, .. } => f
                .debug_struct("InStream")
                .field("filename", filename)
                .finish(),
            Self::OutStream { filename } => {
                f.debug_struct("OutStream").field("filename", filename).finish()
            }
        }
    }
}

impl From<WireParameter> for Parameter {
    fn from(w: WireParameter) -> Self {
        match w {
            WireParameter::Str { value } => Parameter::Str(value),
            WireParameter::Env { name } => Parameter::Env { name },
            WireParameter::RemoteEnv { name } => Parameter::RemoteEnv { name },
            WireParameter::CmdName { name } => Parameter::CmdName { name },
            WireParameter::CmdPath { path } => Parameter::CmdPath { path },
            WireParameter::Format { tmpl, args } => Parameter::Format {
                tmpl,
                args: args.into_iter().map(|(k, v)| (k, v.into())).collect(),
            },
            WireParameter::InCloudFile { path, hostname } => {
                Parameter::InCloudFile { path, hostname }
            }
            WireParameter::OutCloudFile { path, hostname } => {
                Parameter::OutCloudFile { path, hostname }
            }
        }
    }
}

impl TryFrom<Parameter> for WireParameter {
    type Error = CmdproxyError;

    /// Converts a fully-guarded parameter into its wire form.
    ///
    /// Fails for `InLocalFile`, `OutLocalFile`, `InStream` and `OutStream`:
    /// by the time an envelope is built, the client pipeline's guards must
    /// already have rewritten these into `InCloudFile`/`OutCloudFile`.
    fn try_from(p: Parameter) -> Result<Self, Self::Error> {
        match p {
            Parameter::Str(value) => Ok(WireParameter::Str { value }),
            Parameter::Env { name } => Ok(WireParameter::Env { name }),
            Parameter::RemoteEnv { name } => Ok(WireParameter::RemoteEnv { name }),
            Parameter::CmdName { name } => Ok(WireParameter::CmdName { name }),
            Parameter::CmdPath { path } => Ok(WireParameter::CmdPath { path }),
            Parameter::Format { tmpl, args } => {
                let mut wire_args = IndexMap::with_capacity(args.len());
                for (k, v) in args {
                    wire_args.insert(k, WireParameter::try_from(v)?);
                }
                Ok(WireParameter::Format { tmpl, args: wire_args })
            }
            Parameter::InCloudFile { path, hostname } => {
                Ok(WireParameter::InCloudFile { path, hostname })
            }
            Parameter::OutCloudFile { path, hostname } => {
                Ok(WireParameter::OutCloudFile { path, hostname })
            }
            other => Err(CmdproxyError::envelope_decode(format!(
                "parameter not serialisable before transit rewrite: {other:?}"
            ))),
        }
    }
}

/// Which canonical-blob-name role a file-kind parameter plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// Input blob: must exist before dispatch.
    Input,
    /// Output slot: must not exist at reservation time.
    Output,
}

impl Parameter {
    /// `true` for every input-kind file variant.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Parameter::InLocalFile { .. } | Parameter::InCloudFile { .. } | Parameter::InStream { .. }
        )
    }

    /// `true` for every output-kind file variant.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Parameter::OutLocalFile { .. }
                | Parameter::OutCloudFile { .. }
                | Parameter::OutStream { .. }
        )
    }

    /// `true` only for the already-cloud variants (`InCloudFile`/`OutCloudFile`).
    pub fn is_cloud(&self) -> bool {
        matches!(self, Parameter::InCloudFile { .. } | Parameter::OutCloudFile { .. })
    }

    /// The [`FileRole`] of this parameter, if it is a file-kind variant.
    pub fn file_role(&self) -> Option<FileRole> {
        if self.is_input() {
            Some(FileRole::Input)
        } else if self.is_output() {
            Some(FileRole::Output)
        } else {
            None
        }
    }

    /// The canonical blob name `@hostname:path` for a file-kind variant.
    ///
    /// Returns `None` for non-file variants.
    pub fn canonical_blob_name(&self) -> Option<String> {
        match self {
            Parameter::InLocalFile { path } | Parameter::OutLocalFile { path } => {
                Some(format!("@{}:{path}", local_hostname()))
            }
            Parameter::InCloudFile { path, hostname } | Parameter::OutCloudFile { path, hostname } => {
                Some(format!("@{hostname}:{path}"))
            }
            Parameter::InStream { filename, .. } | Parameter::OutStream { filename } => {
                Some(format!("@{}:{filename}", local_hostname()))
            }
            _ => None,
        }
    }

    /// Returns the cloud-kind sibling of a file variant: identical path and
    /// hostname, re-tagged as `InCloudFile`/`OutCloudFile`.
    ///
    /// Idempotent: calling this on an already-cloud variant returns an
    /// equivalent value. Returns `None` for non-file variants.
    pub fn as_cloud(&self) -> Option<Parameter> {
        match self {
            Parameter::InLocalFile { path } => Some(Parameter::InCloudFile {
                path: path.clone(),
                hostname: local_hostname(),
            }),
            Parameter::OutLocalFile { path } => Some(Parameter::OutCloudFile {
                path: path.clone(),
                hostname: local_hostname(),
            }),
            Parameter::InCloudFile { path, hostname } => Some(Parameter::InCloudFile {
                path: path.clone(),
                hostname: hostname.clone(),
            }),
            Parameter::OutCloudFile { path, hostname } => Some(Parameter::OutCloudFile {
                path: path.clone(),
                hostname: hostname.clone(),
            }),
            Parameter::InStream { filename, .. } => Some(Parameter::InCloudFile {
                path: filename.clone(),
                hostname: local_hostname(),
            }),
            Parameter::OutStream { filename } => Some(Parameter::OutCloudFile {
                path: filename.clone(),
                hostname: local_hostname(),
            }),
            _ => None,
        }
    }

    /// Upload `bytes` into `store` under this parameter's canonical blob
    /// name. Callers must ensure `self` is a file-kind variant.
    pub async fn upload(
        &self,
        store: &dyn BlobStore,
        bytes: Vec<u8>,
    ) -> Result<cmdproxy_blobstore::BlobId, CmdproxyError> {
        let name = self.canonical_blob_name().ok_or_else(|| {
            CmdproxyError::envelope_decode("upload() called on a non-file parameter")
        })?;
        store.put(&name, bytes).await
    }

    /// Download the bytes stored under this parameter's canonical blob
    /// name. Callers must ensure `self` is a file-kind variant.
    pub async fn download(&self, store: &dyn BlobStore) -> Result<Vec<u8>, CmdproxyError> {
        let name = self.canonical_blob_name().ok_or_else(|| {
            CmdproxyError::envelope_decode("download() called on a non-file parameter")
        })?;
        store.get(&name).await
    }

    /// Remove the blob stored under this parameter's canonical blob name.
    /// Idempotent. Callers must ensure `self` is a file-kind variant.
    pub async fn remove(&self, store: &dyn BlobStore) -> Result<(), CmdproxyError> {
        let name = self.canonical_blob_name().ok_or_else(|| {
            CmdproxyError::envelope_decode("remove() called on a non-file parameter")
        })?;
        store.delete_by_name(&name).await
    }
}
