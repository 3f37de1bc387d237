//! Client-side transit pipeline (C4).
//!
//! Rewrites a caller's argument tree into a server-safe envelope, staging
//! local inputs and reserving output slots as it walks, dispatches the
//! envelope via [`cmdproxy_dispatch`], then on return reverses those side
//! effects in a single guard stack — every blob this pipeline creates is
//! deleted before `run` returns, whether dispatch succeeded, failed, or was
//! cancelled.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use cmdproxy_blobstore::BlobStore;
use cmdproxy_dispatch::Broker;
use cmdproxy_error::{CmdproxyError, ErrorCode};
use cmdproxy_param::{Parameter, WireParameter};
use cmdproxy_protocol::{EnvelopeCodec, RunRequest, RunResponse};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// A caller-supplied scalar leaf, wrapped as `Str(stringification)` per the
/// argument-tree walk (spec §4.4).
#[derive(Debug, Clone)]
pub enum Scalar {
    /// A string leaf, passed through unwrapped.
    Str(String),
    /// An integer leaf, stringified with `to_string`.
    Int(i64),
    /// A float leaf, stringified with `to_string`.
    Float(f64),
    /// A boolean leaf, stringified as `"true"`/`"false"`.
    Bool(bool),
}

impl Scalar {
    fn stringify(&self) -> String {
        match self {
            Scalar::Str(s) => s.clone(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

/// A caller's raw argument tree: parameter variants, scalars, and nested
/// containers (mapping / sequence / set). Containers are walked depth-first,
/// left to right, preserving container kind and mapping keys; they are not
/// part of the wire protocol, so a guarded container is JSON-stringified
/// into a `Str` once every child has been guarded (see [`guard_enter_tree`]).
#[derive(Debug, Clone)]
pub enum ArgTree {
    /// An ordered key/value container.
    Mapping(IndexMap<String, ArgTree>),
    /// An ordered list container.
    Sequence(Vec<ArgTree>),
    /// An unordered container; order is still walked left to right as given.
    Set(Vec<ArgTree>),
    /// A parameter variant leaf.
    Param(Parameter),
    /// A scalar leaf.
    Scalar(Scalar),
    /// An absent value; propagates unchanged as an empty string argument.
    None,
}

/// One deferred cleanup action, pushed as a guard enters and drained in
/// reverse once dispatch returns (spec §4.4 "Cleanup discipline").
enum Cleanup {
    /// `InLocalFile`/`InStream`: delete the staged blob unconditionally.
    DeleteBlob(String),
    /// `OutLocalFile`: if the slot was populated, download to `dest_path`
    /// then delete; a missing slot is tolerated.
    DownloadThenDelete { name: String, dest_path: String },
    /// `OutStream`: if the slot was populated, capture its bytes under
    /// `key` in the returned [`RunOutcome::stream_outputs`], then delete.
    DownloadStreamThenDelete { name: String, key: String },
}

type BoxedGuard<'a> = Pin<Box<dyn Future<Output = Result<Parameter, CmdproxyError>> + Send + 'a>>;

/// Outcome of a completed `run` call.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// The worker's reported process exit code.
    pub return_code: i32,
    /// Bytes downloaded for every `OutStream` argument, keyed by the
    /// stream's `filename`.
    pub stream_outputs: HashMap<String, Vec<u8>>,
}

/// Guard one [`Parameter`] leaf on entry, recursing into `Format` children.
fn guard_enter_param<'a>(
    p: Parameter,
    store: &'a dyn BlobStore,
    cleanups: &'a mut Vec<Cleanup>,
) -> BoxedGuard<'a> {
    Box::pin(async move {
        match p {
            Parameter::Str(s) => Ok(Parameter::Str(s)),
            Parameter::Env { name } => {
                let value = std::env::var(&name).map_err(|_| CmdproxyError::missing_env_var(name))?;
                Ok(Parameter::Str(value))
            }
            Parameter::RemoteEnv { name } => Ok(Parameter::RemoteEnv { name }),
            Parameter::CmdName { name } => Ok(Parameter::CmdName { name }),
            Parameter::CmdPath { path } => Ok(Parameter::CmdPath { path }),
            Parameter::Format { tmpl, args } => {
                let mut guarded = IndexMap::with_capacity(args.len());
                for (k, v) in args {
                    guarded.insert(k, guard_enter_param(v, store, cleanups).await?);
                }
                Ok(Parameter::Format { tmpl, args: guarded })
            }
            Parameter::InLocalFile { ref path } => {
                let cloud = p.as_cloud().expect("InLocalFile has a cloud sibling");
                let name = cloud.canonical_blob_name().expect("file variant has a canonical name");
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    CmdproxyError::blob_missing(name.clone())
                        .with_context("path", path.clone())
                        .with_source(e)
                })?;
                cloud.upload(store, bytes).await?;
                cleanups.push(Cleanup::DeleteBlob(name));
                Ok(cloud)
            }
            Parameter::InCloudFile { path, hostname } => {
                let candidate = Parameter::InCloudFile { path, hostname };
                let name = candidate.canonical_blob_name().unwrap();
                if !store.exists(&name).await? {
                    return Err(CmdproxyError::blob_missing(name));
                }
                Ok(candidate)
            }
            Parameter::OutLocalFile { ref path } => {
                let cloud = p.as_cloud().expect("OutLocalFile has a cloud sibling");
                let name = cloud.canonical_blob_name().expect("file variant has a canonical name");
                if store.exists(&name).await? {
                    return Err(CmdproxyError::blob_conflict(name));
                }
                cleanups.push(Cleanup::DownloadThenDelete { name, dest_path: path.clone() });
                Ok(cloud)
            }
            Parameter::OutCloudFile { path, hostname } => {
                let candidate = Parameter::OutCloudFile { path, hostname };
                let name = candidate.canonical_blob_name().unwrap();
                if store.exists(&name).await? {
                    return Err(CmdproxyError::blob_conflict(name));
                }
                Ok(candidate)
            }
            Parameter::InStream { bytes, filename } => {
                let cloud = Parameter::InCloudFile { path: filename, hostname: cmdproxy_param::local_hostname() };
                let name = cloud.canonical_blob_name().expect("file variant has a canonical name");
                cloud.upload(store, bytes).await?;
                cleanups.push(Cleanup::DeleteBlob(name));
                Ok(cloud)
            }
            Parameter::OutStream { ref filename } => {
                let cloud = p.as_cloud().expect("OutStream has a cloud sibling");
                let name = cloud.canonical_blob_name().expect("file variant has a canonical name");
                if store.exists(&name).await? {
                    return Err(CmdproxyError::blob_conflict(name));
                }
                cleanups.push(Cleanup::DownloadStreamThenDelete {
                    name,
                    key: filename.clone(),
                });
                Ok(cloud)
            }
        }
    })
}

type BoxedTreeGuard<'a> = Pin<Box<dyn Future<Output = Result<Parameter, CmdproxyError>> + Send + 'a>>;

/// Guard one [`ArgTree`] node on entry, flattening containers into a `Str`
/// of their guarded children once the recursion bottoms out.
fn guard_enter_tree<'a>(
    tree: ArgTree,
    store: &'a dyn BlobStore,
    cleanups: &'a mut Vec<Cleanup>,
) -> BoxedTreeGuard<'a> {
    Box::pin(async move {
        match tree {
            ArgTree::Param(p) => guard_enter_param(p, store, cleanups).await,
            ArgTree::Scalar(s) => Ok(Parameter::Str(s.stringify())),
            ArgTree::None => Ok(Parameter::Str(String::new())),
            ArgTree::Mapping(map) => {
                let mut wire = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    let guarded = guard_enter_tree(v, store, cleanups).await?;
                    wire.insert(k, WireParameter::try_from(guarded)?);
                }
                let json = serde_json::to_string(&wire)
                    .map_err(|e| CmdproxyError::envelope_decode(format!("stringifying mapping argument: {e}")))?;
                Ok(Parameter::Str(json))
            }
            ArgTree::Sequence(items) | ArgTree::Set(items) => {
                let mut wire = Vec::with_capacity(items.len());
                for item in items {
                    let guarded = guard_enter_tree(item, store, cleanups).await?;
                    wire.push(WireParameter::try_from(guarded)?);
                }
                let json = serde_json::to_string(&wire)
                    .map_err(|e| CmdproxyError::envelope_decode(format!("stringifying sequence argument: {e}")))?;
                Ok(Parameter::Str(json))
            }
        }
    })
}

/// Run every deferred cleanup in reverse order, best-effort. Failures are
/// logged rather than propagated: cleanup must never mask the primary
/// dispatch outcome, and a tolerated-missing slot is not an error.
async fn unwind(cleanups: Vec<Cleanup>, store: &dyn BlobStore) -> HashMap<String, Vec<u8>> {
    let mut stream_outputs = HashMap::new();
    for cleanup in cleanups.into_iter().rev() {
        match cleanup {
            Cleanup::DeleteBlob(name) => {
                if let Err(e) = store.delete_by_name(&name).await {
                    warn!(name, error = %e, "cleanup: failed to delete staged blob");
                }
            }
            Cleanup::DownloadThenDelete { name, dest_path } => match store.exists(&name).await {
                Ok(true) => {
                    match store.get(&name).await {
                        Ok(bytes) => {
                            if let Err(e) = tokio::fs::write(&dest_path, &bytes).await {
                                warn!(name, dest_path, error = %e, "cleanup: failed to write output file");
                            }
                        }
                        Err(e) => warn!(name, error = %e, "cleanup: failed to download output blob"),
                    }
                    if let Err(e) = store.delete_by_name(&name).await {
                        warn!(name, error = %e, "cleanup: failed to delete output slot");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(name, error = %e, "cleanup: failed to check output slot"),
            },
            Cleanup::DownloadStreamThenDelete { name, key } => match store.exists(&name).await {
                Ok(true) => {
                    match store.get(&name).await {
                        Ok(bytes) => {
                            stream_outputs.insert(key, bytes);
                        }
                        Err(e) => warn!(name, error = %e, "cleanup: failed to download stream output"),
                    }
                    if let Err(e) = store.delete_by_name(&name).await {
                        warn!(name, error = %e, "cleanup: failed to delete stream output slot");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(name, error = %e, "cleanup: failed to check stream output slot"),
            },
        }
    }
    stream_outputs
}

/// The command argument determines the target queue: `CmdName(n)` routes to
/// queue `n` unless `queue_override` is set; `CmdPath` requires
/// `queue_override` and is a [`ErrorCode::DispatchFailure`] without one.
/// Any other command variant is rejected — raw-string commands are not
/// supported (spec §4.4).
pub fn target_queue(command: &Parameter, queue_override: Option<&str>) -> Result<String, CmdproxyError> {
    match command {
        Parameter::CmdName { name } => Ok(queue_override.map(str::to_string).unwrap_or_else(|| name.clone())),
        Parameter::CmdPath { .. } => queue_override.map(str::to_string).ok_or_else(|| {
            CmdproxyError::new(
                ErrorCode::DispatchFailure,
                "CmdPath command requires an explicit target queue",
            )
        }),
        other => Err(CmdproxyError::envelope_decode(format!(
            "command must be CmdName or CmdPath, got {other:?}"
        ))),
    }
}

/// Run one command end to end: guard every argument, dispatch the envelope,
/// and unwind every guard before returning.
///
/// `args` is the caller's positional argument tree; `env`/`stdout`/`stderr`
/// are already-classified [`Parameter`] values. `queue_override` names an
/// explicit target queue, required when `command` is `CmdPath`.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    broker: &dyn Broker,
    store: &dyn BlobStore,
    command: Parameter,
    args: Vec<ArgTree>,
    env: Option<IndexMap<String, Parameter>>,
    cwd: Option<String>,
    stdout: Option<Parameter>,
    stderr: Option<Parameter>,
    queue_override: Option<&str>,
    dispatch_timeout: Option<Duration>,
) -> Result<RunOutcome, CmdproxyError> {
    let queue = target_queue(&command, queue_override)?;
    let mut cleanups = Vec::new();

    let guarded = guard_request(command, args, env, stdout, stderr, store, &mut cleanups).await;

    let request = match guarded {
        Ok(req) => req,
        Err(e) => {
            unwind(cleanups, store).await;
            return Err(e);
        }
    };
    let request = RunRequest { cwd, ..request };

    let envelope = match EnvelopeCodec::encode_request(&request) {
        Ok(json) => json,
        Err(e) => {
            unwind(cleanups, store).await;
            return Err(e);
        }
    };

    let dispatch_result =
        cmdproxy_dispatch::dispatch(broker, &queue, envelope, dispatch_timeout).await;

    let response_json = match dispatch_result {
        Ok(json) => json,
        Err(e) => {
            unwind(cleanups, store).await;
            return Err(e);
        }
    };

    let response: RunResponse = match EnvelopeCodec::decode_response(&response_json) {
        Ok(r) => r,
        Err(e) => {
            unwind(cleanups, store).await;
            return Err(e);
        }
    };

    let stream_outputs = unwind(cleanups, store).await;

    if response.is_server_error() {
        return Err(CmdproxyError::server_end(response.error.unwrap()));
    }

    Ok(RunOutcome {
        return_code: response.return_code,
        stream_outputs,
    })
}

#[allow(clippy::too_many_arguments)]
async fn guard_request(
    command: Parameter,
    args: Vec<ArgTree>,
    env: Option<IndexMap<String, Parameter>>,
    stdout: Option<Parameter>,
    stderr: Option<Parameter>,
    store: &dyn BlobStore,
    cleanups: &mut Vec<Cleanup>,
) -> Result<RunRequest, CmdproxyError> {
    let command = WireParameter::try_from(guard_enter_param(command, store, cleanups).await?)?;

    let mut wire_args = Vec::with_capacity(args.len());
    for arg in args {
        let guarded = guard_enter_tree(arg, store, cleanups).await?;
        wire_args.push(WireParameter::try_from(guarded)?);
    }

    let wire_env = match env {
        None => None,
        Some(map) => {
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                let guarded = guard_enter_param(v, store, cleanups).await?;
                out.insert(k, WireParameter::try_from(guarded)?);
            }
            Some(out)
        }
    };

    let wire_stdout = match stdout {
        None => None,
        Some(p) => Some(WireParameter::try_from(guard_enter_param(p, store, cleanups).await?)?),
    };
    let wire_stderr = match stderr {
        None => None,
        Some(p) => Some(WireParameter::try_from(guard_enter_param(p, store, cleanups).await?)?),
    };

    Ok(RunRequest {
        command,
        args: wire_args,
        env: wire_env,
        cwd: None,
        stdout: wire_stdout,
        stderr: wire_stderr,
    })
}
