//! Server-side transit pipeline (C5).
//!
//! Mirror image of `cmdproxy-client`: decodes an envelope, materialises
//! every parameter to a local temp path or literal value, spawns the
//! subprocess via [`cmdproxy_exec`], uploads produced outputs, and always
//! returns a serialised [`RunResponse`] — decoding, materialisation, or
//! execution failures are caught at the boundary rather than propagated.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use cmdproxy_blobstore::BlobStore;
use cmdproxy_error::CmdproxyError;
use cmdproxy_param::Parameter;
use cmdproxy_protocol::{EnvelopeCodec, RunRequest, RunResponse};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::error;

pub use cmdproxy_param::WireParameter;

/// Server-side mapping from logical command name to executable path.
/// Its keys also name the worker queues the daemon registers (spec §6).
#[derive(Debug, Clone, Default)]
pub struct CommandPalette(HashMap<String, String>);

impl CommandPalette {
    /// Build a palette from a logical-name → executable-path map.
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self(entries)
    }

    /// Resolve a logical command name, failing with `UnknownCommand`.
    pub fn resolve(&self, name: &str) -> Result<String, CmdproxyError> {
        self.0.get(name).cloned().ok_or_else(|| CmdproxyError::unknown_command(name))
    }

    /// Logical command names, i.e. the worker's per-command queue set.
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Handle one broker task: decode `request_json`, run it to completion, and
/// return a serialised [`RunResponse`]. Never panics or propagates an error
/// — every failure becomes `{ return_code: -1, error: "<diagnostic>" }`.
pub async fn handle(request_json: &str, store: &dyn BlobStore, palette: &CommandPalette) -> String {
    let response = match EnvelopeCodec::decode_request(request_json) {
        Ok(req) => match run_request(req, store, palette).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(code = %e.code, message = %e.message, "run request failed");
                RunResponse::failure(e.to_diagnostic())
            }
        },
        Err(e) => {
            error!(code = %e.code, message = %e.message, "envelope decode failed");
            RunResponse::failure(e.to_diagnostic())
        }
    };

    EnvelopeCodec::encode_response(&response).unwrap_or_else(|_| {
        r#"{"return_code":-1,"error":"ENVELOPE_DECODE: failed to encode failure response"}"#
            .to_string()
    })
}

async fn run_request(
    req: RunRequest,
    store: &dyn BlobStore,
    palette: &CommandPalette,
) -> Result<RunResponse, CmdproxyError> {
    let command_path = resolve_command(&req.command, palette)?;
    let prefix = format!("cmdproxy-{}-", hostname_hint(&req));
    let workspace = tempfile::Builder::new()
        .prefix(&prefix)
        .tempdir()
        .map_err(|e| {
            CmdproxyError::execution_failure(format!("creating temp workspace: {e}")).with_source(e)
        })?;

    let mut outputs: Vec<(PathBuf, String)> = Vec::new();

    let mut argv = Vec::with_capacity(req.args.len());
    for arg in &req.args {
        argv.push(materialize(arg, store, workspace.path(), &mut outputs).await?);
    }

    let env = match &req.env {
        None => None,
        Some(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), materialize(v, store, workspace.path(), &mut outputs).await?);
            }
            Some(out)
        }
    };

    let stdout_path = match &req.stdout {
        None => None,
        Some(p) => Some(PathBuf::from(materialize(p, store, workspace.path(), &mut outputs).await?)),
    };
    let stderr_path = match &req.stderr {
        None => None,
        Some(p) => Some(PathBuf::from(materialize(p, store, workspace.path(), &mut outputs).await?)),
    };

    let mut spec = cmdproxy_exec::ExecSpec::new(command_path, argv);
    spec.env = env;
    spec.cwd = req.cwd.clone();
    spec.stdout_path = stdout_path;
    spec.stderr_path = stderr_path;

    let exit_code = cmdproxy_exec::execute(&spec).await?;

    for (path, name) in &outputs {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                CmdproxyError::execution_failure(format!("reading produced output: {e}")).with_source(e)
            })?;
            store.put(name, bytes).await?;
        }
    }

    Ok(RunResponse::success(exit_code))
}

fn resolve_command(command: &WireParameter, palette: &CommandPalette) -> Result<String, CmdproxyError> {
    match command {
        WireParameter::CmdName { name } => palette.resolve(name),
        WireParameter::CmdPath { path } => {
            if Path::new(path).exists() || cmdproxy_exec::which::command_exists(path) {
                Ok(path.clone())
            } else {
                Err(CmdproxyError::command_not_found(path.clone()))
            }
        }
        other => Err(CmdproxyError::envelope_decode(format!(
            "command must be CmdName or CmdPath, got {other:?}"
        ))),
    }
}

type BoxedMaterialize<'a> = Pin<Box<dyn Future<Output = Result<String, CmdproxyError>> + Send + 'a>>;

/// Resolve one [`WireParameter`] to the string an argv slot, env value, or
/// template substitution needs (spec §4.5's "materialised form" column).
/// File-kind variants materialise to a freshly-created local temp path:
/// inputs are downloaded eagerly, outputs reserve the path for upload after
/// execution.
fn materialize<'a>(
    w: &'a WireParameter,
    store: &'a dyn BlobStore,
    workspace: &'a Path,
    outputs: &'a mut Vec<(PathBuf, String)>,
) -> BoxedMaterialize<'a> {
    Box::pin(async move {
        match w {
            WireParameter::Str { value } => Ok(value.clone()),
            WireParameter::Env { name } | WireParameter::RemoteEnv { name } => {
                std::env::var(name).map_err(|_| CmdproxyError::missing_env_var(name.clone()))
            }
            WireParameter::CmdName { .. } | WireParameter::CmdPath { .. } => Err(
                CmdproxyError::envelope_decode("command parameter not valid outside the envelope's command field"),
            ),
            WireParameter::Format { tmpl, args } => {
                let mut rendered = tmpl.clone();
                for (key, child) in args {
                    let value = materialize(child, store, workspace, outputs).await?;
                    rendered = rendered.replace(&format!("{{{key}}}"), &value);
                }
                Ok(rendered)
            }
            WireParameter::InCloudFile { .. } => {
                let param = Parameter::from(w.clone());
                let bytes = param.download(store).await?;
                let temp_path = workspace.join(temp_file_name(w));
                tokio::fs::write(&temp_path, &bytes).await.map_err(|e| {
                    CmdproxyError::execution_failure(format!("writing input temp file: {e}")).with_source(e)
                })?;
                Ok(temp_path.to_string_lossy().into_owned())
            }
            WireParameter::OutCloudFile { path, hostname } => {
                let name = Parameter::OutCloudFile { path: path.clone(), hostname: hostname.clone() }
                    .canonical_blob_name()
                    .expect("OutCloudFile always has a canonical name");
                let temp_path = workspace.join(temp_file_name(w));
                outputs.push((temp_path.clone(), name));
                Ok(temp_path.to_string_lossy().into_owned())
            }
        }
    })
}

fn temp_file_name(w: &WireParameter) -> String {
    let raw = match w {
        WireParameter::InCloudFile { path, hostname } | WireParameter::OutCloudFile { path, hostname } => {
            format!("{hostname}_{path}")
        }
        _ => "param".to_string(),
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_string()
            } else {
                format!("_{:02x}", c as u32)
            }
        })
        .collect()
}

fn hostname_hint(req: &RunRequest) -> String {
    fn extract(w: &WireParameter) -> Option<&str> {
        match w {
            WireParameter::InCloudFile { hostname, .. } | WireParameter::OutCloudFile { hostname, .. } => {
                Some(hostname)
            }
            _ => None,
        }
    }
    req.args
        .iter()
        .find_map(extract)
        .or_else(|| req.stdout.as_ref().and_then(extract))
        .or_else(|| req.stderr.as_ref().and_then(extract))
        .unwrap_or("worker")
        .to_string()
}
