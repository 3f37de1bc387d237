//! End-to-end scenarios (spec §8) driving the whole pipeline — client guard
//! walk, in-memory broker dispatch, worker materialisation, subprocess
//! execution — through `/bin/sh`, without a real broker or blob backend.

use cmdproxy_blobstore::{BlobStore, InMemoryBlobStore};
use cmdproxy_client::{run, ArgTree, Scalar};
use cmdproxy_dispatch::{Broker, InMemoryBroker};
use cmdproxy_param::Parameter;
use cmdproxy_worker::CommandPalette;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Wire an in-memory broker whose `sh` queue is served by the real worker
/// pipeline, sharing `store`.
async fn harness() -> (InMemoryBroker, Arc<InMemoryBlobStore>) {
    let store = Arc::new(InMemoryBlobStore::new());
    let broker = InMemoryBroker::new();

    let mut palette_map = HashMap::new();
    palette_map.insert("sh".to_string(), "/bin/sh".to_string());
    let palette = Arc::new(CommandPalette::new(palette_map));

    for queue in ["sh", "direct"] {
        let store = Arc::clone(&store);
        let palette = Arc::clone(&palette);
        broker.register(
            queue,
            "run",
            Arc::new(move |payload| {
                let store = Arc::clone(&store);
                let palette = Arc::clone(&palette);
                Box::pin(async move { cmdproxy_worker::handle(&payload, store.as_ref(), palette.as_ref()).await })
            }),
        );
    }
    tokio::task::yield_now().await;
    (broker, store)
}

#[tokio::test]
async fn e1_echo_roundtrip_through_local_files() {
    let (broker, store) = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let tmp_in = dir.path().join("in");
    let tmp_out = dir.path().join("out");
    let tmp_stdout = dir.path().join("stdout");
    let tmp_stderr = dir.path().join("stderr");
    tokio::fs::write(&tmp_in, b"hello").await.unwrap();

    let mut fmt_args = IndexMap::new();
    fmt_args.insert(
        "i".to_string(),
        Parameter::InLocalFile { path: tmp_in.to_string_lossy().into_owned() },
    );
    fmt_args.insert(
        "o".to_string(),
        Parameter::OutLocalFile { path: tmp_out.to_string_lossy().into_owned() },
    );

    let outcome = run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Format { tmpl: "cat {i} > {o}".into(), args: fmt_args }),
        ],
        None,
        None,
        Some(Parameter::OutLocalFile { path: tmp_stdout.to_string_lossy().into_owned() }),
        Some(Parameter::OutLocalFile { path: tmp_stderr.to_string_lossy().into_owned() }),
        Some("sh"),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.return_code, 0);
    assert_eq!(tokio::fs::read(&tmp_out).await.unwrap(), b"hello");
    assert!(!tmp_stdout.exists() || tokio::fs::read(&tmp_stdout).await.unwrap().is_empty());
    assert!(!tmp_stderr.exists() || tokio::fs::read(&tmp_stderr).await.unwrap().is_empty());
    assert!(store.names().await.is_empty(), "no blob should outlive a successful run");
}

#[tokio::test]
async fn e2_cloud_only_output_persists() {
    let (broker, store) = harness().await;

    let mut fmt_args = IndexMap::new();
    fmt_args.insert(
        "o".to_string(),
        Parameter::OutCloudFile { path: "/srv/r.bin".into(), hostname: "node42".into() },
    );

    let outcome = run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Format { tmpl: "printf BIN > {o}".into(), args: fmt_args }),
        ],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.return_code, 0);
    assert_eq!(store.get("@node42:/srv/r.bin").await.unwrap(), b"BIN");
}

#[tokio::test]
async fn e3_missing_env_var_fails_before_dispatch_with_no_blob_residue() {
    let (broker, store) = harness().await;
    std::env::remove_var("CMDPROXY_E2E_MISSING");

    let err = run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Env { name: "CMDPROXY_E2E_MISSING".into() }),
        ],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.code, cmdproxy_error::ErrorCode::MissingEnvVar);
    assert!(store.names().await.is_empty());
}

#[tokio::test]
async fn e4_unknown_command_surfaces_as_server_end() {
    let (broker, store) = harness().await;

    let dir = tempfile::tempdir().unwrap();
    let tmp_in = dir.path().join("in");
    tokio::fs::write(&tmp_in, b"x").await.unwrap();

    let err = run(
        &broker,
        store.as_ref(),
        Parameter::CmdName { name: "nope".into() },
        vec![ArgTree::Param(Parameter::InLocalFile { path: tmp_in.to_string_lossy().into_owned() })],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.code, cmdproxy_error::ErrorCode::ServerEnd);
    assert!(store.names().await.is_empty(), "uploaded input blobs are deleted even on server failure");
}

#[tokio::test]
async fn e5_format_with_nested_local_files_downloads_result() {
    let (broker, store) = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    tokio::fs::write(&a, b"payload-a").await.unwrap();

    let mut fmt_args = IndexMap::new();
    fmt_args.insert("i".to_string(), Parameter::InLocalFile { path: a.to_string_lossy().into_owned() });
    fmt_args.insert("o".to_string(), Parameter::OutLocalFile { path: b.to_string_lossy().into_owned() });

    let outcome = run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Format { tmpl: "cp {i} {o}".into(), args: fmt_args }),
        ],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.return_code, 0);
    assert_eq!(tokio::fs::read(&b).await.unwrap(), b"payload-a");
    assert!(store.names().await.is_empty());
}

#[tokio::test]
async fn e6_stream_input_is_staged_and_cleaned_up() {
    let (broker, store) = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let payload = vec![b'X'; 1000];

    let mut fmt_args = IndexMap::new();
    fmt_args.insert(
        "i".to_string(),
        Parameter::InStream { bytes: payload.clone(), filename: "x.bin".into() },
    );
    fmt_args.insert("o".to_string(), Parameter::OutLocalFile { path: out.to_string_lossy().into_owned() });

    let outcome = run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Format { tmpl: "cat {i} > {o}".into(), args: fmt_args }),
        ],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap();

    assert_eq!(outcome.return_code, 0);
    assert_eq!(tokio::fs::read(&out).await.unwrap(), payload);
    assert!(store.names().await.is_empty(), "staged stream blob must not outlive the run call");
}

#[tokio::test]
async fn property_cleanup_holds_across_success_and_failure() {
    let (broker, store) = harness().await;
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    tokio::fs::write(&a, b"x").await.unwrap();

    // Successful run.
    run(
        &broker,
        store.as_ref(),
        Parameter::CmdPath { path: "/bin/sh".into() },
        vec![
            ArgTree::Scalar(Scalar::Str("-c".into())),
            ArgTree::Param(Parameter::Format {
                tmpl: "cat {i}".into(),
                args: IndexMap::from([(
                    "i".to_string(),
                    Parameter::InLocalFile { path: a.to_string_lossy().into_owned() },
                )]),
            }),
        ],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await
    .unwrap();
    assert!(store.names().await.is_empty());

    // Failing run (unknown command), same input file.
    let _ = run(
        &broker,
        store.as_ref(),
        Parameter::CmdName { name: "nope".into() },
        vec![ArgTree::Param(Parameter::InLocalFile { path: a.to_string_lossy().into_owned() })],
        None,
        None,
        None,
        None,
        Some("sh"),
        None,
    )
    .await;
    assert!(store.names().await.is_empty());
}

#[tokio::test]
async fn property_deleting_a_nonexistent_blob_is_silent() {
    let store = InMemoryBlobStore::new();
    store.delete_by_name("@host:/never/existed").await.unwrap();
}
