//! Reconciliation and sync against the in-memory server.

mod common;

use std::sync::Arc;

use p4ci_core::{ChangeNumber, RevisionSpec, StorageType};
use p4ci_server::{MemoryServer, ServerError};
use p4ci_workspace::marker::{self, marker_path};
use p4ci_workspace::{CorrectiveAction, Repo, WorkspaceError, WorkspaceState};
use tempfile::TempDir;

use common::{config, seeded_server, snapshot, MAIN_C};

#[test]
fn first_sync_fetches_everything_then_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");

    let first = repo.sync(&RevisionSpec::latest()).expect("first sync");
    assert_eq!(first.files_count, 3);
    assert_eq!(first.total_bytes, (MAIN_C.len() + 8 + 8) as u64);
    assert_eq!(
        std::fs::read(tmp.path().join("depot/app/main.c")).expect("synced file"),
        MAIN_C
    );

    let second = repo.sync(&RevisionSpec::latest()).expect("second sync");
    assert_eq!(second.files_count, 0);
    assert!(second.files.is_empty());
}

#[test]
fn new_client_is_flushed_to_zero_and_marked() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");

    let outcome = repo.reconcile().expect("reconcile").clone();
    assert_eq!(outcome.state, WorkspaceState::Uninitialized);
    assert!(matches!(outcome.action, CorrectiveAction::FlushToZero { .. }));

    let name = repo.client_name().clone();
    assert!(name.as_str().starts_with("bk-p4-agent-1-"));
    let record = server.client(&name).expect("client saved");
    assert_eq!(record.root, tmp.path());
    assert!(record.options.contains("clobber"));
    assert!(!record.options.contains("noclobber"));

    let written = marker::read_marker(tmp.path()).expect("read").expect("marker");
    assert_eq!(written.client, name);
    assert_eq!(written.port.as_deref(), Some("memory:1666"));

    // Memoized: a second call does not flush again.
    repo.reconcile().expect("reconcile again");
    assert_eq!(server.flushes().len(), 1);
}

#[test]
fn sync_records_the_synced_change() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    server.submit("second", &[("//depot/app/main.c", b"v2\n")]);
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");

    repo.sync(&RevisionSpec::at_change(ChangeNumber(1))).expect("sync @1");
    let at_one = marker::read_marker(tmp.path()).expect("read").expect("marker");
    assert_eq!(at_one.change, Some(ChangeNumber(1)));
    assert_eq!(
        std::fs::read(tmp.path().join("depot/app/main.c")).expect("file"),
        MAIN_C
    );

    repo.sync(&RevisionSpec::latest()).expect("sync head");
    let at_head = marker::read_marker(tmp.path()).expect("read").expect("marker");
    assert_eq!(at_head.change, Some(ChangeNumber(2)));
}

#[test]
fn deleted_marker_forces_full_redownload() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
        repo.sync(&RevisionSpec::latest()).expect("sync");
    }
    std::fs::remove_file(marker_path(tmp.path())).expect("delete marker");

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("reopen");
    let outcome = repo.reconcile().expect("reconcile").clone();
    assert_eq!(outcome.state, WorkspaceState::Stale);

    let result = repo.sync(&RevisionSpec::latest()).expect("sync after marker loss");
    assert_eq!(result.files_count, 3);
}

#[test]
fn moving_workspace_to_another_client_syncs_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let previous = {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-a")).expect("open a");
        assert_eq!(repo.sync(&RevisionSpec::latest()).expect("sync a").files_count, 3);
        repo.client_name().clone()
    };

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-b")).expect("open b");
    let outcome = repo.reconcile().expect("reconcile b").clone();
    assert!(matches!(outcome.state, WorkspaceState::Migrated { .. }));
    assert_eq!(
        outcome.action,
        CorrectiveAction::FlushToClient {
            previous: previous.clone(),
            via_stream: None,
        }
    );
    let name = repo.client_name().clone();
    assert!(server
        .flushes()
        .contains(&(name.clone(), format!("//{name}/...@{previous}"))));

    let result = repo.sync(&RevisionSpec::latest()).expect("sync b");
    assert_eq!(result.files_count, 0);
    assert_eq!(server.have(&name), server.have(&previous));
}

#[test]
fn migration_falls_back_to_the_recorded_change() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new().with_client_flush(&[]));
    {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-a")).expect("open a");
        repo.sync(&RevisionSpec::latest()).expect("sync a");
    }

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-b")).expect("open b");
    let outcome = repo.reconcile().expect("reconcile b").clone();
    assert_eq!(
        outcome.action,
        CorrectiveAction::FlushToChange {
            change: ChangeNumber(1),
            via_stream: None,
        }
    );
    assert_eq!(outcome.marker.change, Some(ChangeNumber(1)));
    assert_eq!(repo.sync(&RevisionSpec::latest()).expect("sync b").files_count, 0);
}

#[test]
fn stream_switch_flushes_under_the_previous_stream() {
    let tmp = TempDir::new().expect("tempdir");
    let server = MemoryServer::new();
    server.submit("main", &[("//stream/main/a.txt", b"main\n")]);
    server.submit("dev", &[("//stream/dev/a.txt", b"dev\n")]);
    let server = Arc::new(server);

    let on_stream = |agent: &str, stream: &str| {
        let mut cfg = config(tmp.path(), agent);
        cfg.stream = Some(stream.to_owned());
        cfg
    };
    let previous = {
        let mut repo = Repo::open(Arc::clone(&server), on_stream("agent-a", "//stream/main"))
            .expect("open a");
        repo.sync(&RevisionSpec::latest()).expect("sync a");
        repo.client_name().clone()
    };
    assert_eq!(
        std::fs::read(tmp.path().join("a.txt")).expect("main file"),
        b"main\n"
    );

    let mut repo =
        Repo::open(Arc::clone(&server), on_stream("agent-b", "//stream/dev")).expect("open b");
    let outcome = repo.reconcile().expect("reconcile b").clone();
    assert_eq!(
        outcome.action,
        CorrectiveAction::FlushToClient {
            previous: previous.clone(),
            via_stream: Some("//stream/main".to_owned()),
        }
    );
    let name = repo.client_name().clone();
    assert!(server
        .flushes()
        .contains(&(name.clone(), format!("//{name}/...@{previous}"))));
    assert_eq!(
        server.flush_streams().last().cloned().flatten().as_deref(),
        Some("//stream/main")
    );
    let record = server.client(&name).expect("client saved");
    assert_eq!(record.stream.as_deref(), Some("//stream/dev"));
    assert_eq!(outcome.marker.stream.as_deref(), Some("//stream/dev"));

    repo.sync(&RevisionSpec::latest()).expect("sync b");
    assert_eq!(
        std::fs::read(tmp.path().join("a.txt")).expect("dev file"),
        b"dev\n"
    );
}

#[test]
fn unknown_position_cleans_then_resyncs_everything() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new().with_client_flush(&[]));
    let previous = {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-a")).expect("open a");
        repo.sync(&RevisionSpec::latest()).expect("sync a");
        repo.client_name().clone()
    };
    let synced = snapshot(tmp.path());
    let mut written = marker::read_marker(tmp.path()).expect("read").expect("marker");
    written.change = None;
    marker::write_marker(tmp.path(), &written).expect("rewrite marker");

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-b")).expect("open b");
    let outcome = repo.reconcile().expect("reconcile b").clone();
    assert_eq!(
        outcome.action,
        CorrectiveAction::Clean {
            previous: previous.clone()
        }
    );
    let name = repo.client_name().clone();
    assert!(server
        .cleans()
        .contains(&(name.clone(), vec![name.all_files()])));
    assert!(snapshot(tmp.path()).is_empty());
    let kept = marker::read_marker(tmp.path()).expect("read").expect("marker present");
    assert_eq!(kept.client, name);
    assert_eq!(kept.change, None);

    let result = repo.sync(&RevisionSpec::latest()).expect("sync b");
    assert_eq!(result.files_count, 3);
    assert_eq!(snapshot(tmp.path()), synced);
    assert!(marker_path(tmp.path()).exists());
}

#[test]
fn wrong_fingerprint_is_an_authenticity_error() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new().with_ssl_fingerprint("AA:BB:CC"));
    let mut wrong = config(tmp.path(), "agent-1");
    wrong.fingerprints = vec!["11:22:33".to_owned()];

    let err = Repo::open(Arc::clone(&server), wrong).err().expect("untrusted server");
    assert!(
        matches!(err, WorkspaceError::Server(ServerError::Untrusted { .. })),
        "got {err}"
    );
    assert!(err.to_string().contains("authenticity"));

    let mut right = config(tmp.path(), "agent-1");
    right.fingerprints = vec!["AA:BB:CC".to_owned()];
    let mut repo = Repo::open(Arc::clone(&server), right).expect("trusted server");
    assert!(repo.sync(&RevisionSpec::latest()).expect("sync").files_count > 0);
}

#[test]
fn odd_view_fails_before_contacting_the_server() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let mut odd = config(tmp.path(), "agent-1");
    odd.view = vec!["//depot/app/...".to_owned()];

    let err = Repo::open(Arc::clone(&server), odd).err().expect("odd view");
    assert!(matches!(err, WorkspaceError::Config(_)), "got {err}");
    assert!(!server.is_connected());
}

#[test]
fn storage_type_cannot_change() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
        repo.sync(&RevisionSpec::latest()).expect("sync");
    }

    let mut readonly = config(tmp.path(), "agent-1");
    readonly.client_type = StorageType::Readonly;
    let mut repo = Repo::open(Arc::clone(&server), readonly).expect("open readonly");
    let err = repo.sync(&RevisionSpec::latest()).expect_err("type change refused");
    match err {
        WorkspaceError::StorageTypeConflict { message, .. } => {
            assert!(message.contains("storage type cannot be changed"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn clean_restores_deleted_files_and_keeps_the_marker() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");
    let synced = snapshot(tmp.path());

    std::fs::remove_file(tmp.path().join("depot/app/README")).expect("delete");
    std::fs::write(tmp.path().join("depot/app/stray.o"), b"junk").expect("stray");
    repo.clean().expect("clean");

    assert_eq!(snapshot(tmp.path()), synced);
    let kept = marker::read_marker(tmp.path()).expect("read").expect("marker kept");
    assert_eq!(&kept.client, repo.client_name());
}

#[test]
fn head_follows_the_view_then_the_server() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    server.submit("docs only", &[("//depot/docs/guide.md", b"# Guide v2\n")]);

    let mut app_only = config(tmp.path(), "agent-1");
    app_only.view = vec!["//depot/app/...".to_owned(), "app/...".to_owned()];
    let repo = Repo::open(Arc::clone(&server), app_only).expect("open");
    assert_eq!(repo.head().expect("head"), RevisionSpec::new("@1"));
    drop(repo);

    let mut empty = config(tmp.path(), "agent-1");
    empty.view = vec!["//depot/empty/...".to_owned(), "empty/...".to_owned()];
    let repo = Repo::open(Arc::clone(&server), empty).expect("open");
    assert_eq!(repo.head_of_view("//depot/empty/...").expect("scoped"), None);
    assert_eq!(repo.head().expect("head"), RevisionSpec::new("@2"));
}

#[test]
fn head_at_revision_resolves_labels() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    server.set_label("pinned", Some("@1"));
    server.submit("later", &[("//depot/app/main.c", b"v2\n")]);
    server.set_label("tagged", None);

    let repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    assert_eq!(
        repo.head_at_revision(&RevisionSpec::new("@pinned")).expect("label"),
        Some(ChangeNumber(1))
    );
    assert_eq!(
        repo.head_at_revision(&RevisionSpec::new("@tagged")).expect("label"),
        Some(ChangeNumber(2))
    );
    assert_eq!(
        repo.head_at_revision(&RevisionSpec::new("@1")).expect("change"),
        Some(ChangeNumber(1))
    );
    assert_eq!(repo.description(ChangeNumber(2)).expect("describe"), "later");
}

#[test]
fn dropping_the_repo_disconnects() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    assert!(server.is_connected());
    drop(repo);
    assert!(!server.is_connected());
    assert_eq!(server.disconnect_count(), 1);
}
