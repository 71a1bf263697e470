//! Shelf validation, materialization, backup and the checkout flow.

mod common;

use std::sync::Arc;

use p4ci_core::{ChangeNumber, EnvContext, RevisionSpec};
use p4ci_server::{MemoryServer, ShelfEntry};
use p4ci_workspace::marker::{patch_list_path, read_patch_list};
use p4ci_workspace::pipeline::{COMMIT_INFO_KEY, REVISION_KEY, SHELVE_KEY};
use p4ci_workspace::{checkout, MemoryMetadata, Repo, ShelfError, WorkspaceError};
use tempfile::TempDir;

use common::{config, seeded_server, snapshot, Quirky, MAIN_C};

fn user_shelf(server: &MemoryServer) -> ChangeNumber {
    server.shelve_files(
        "Make main return 1",
        "dev-workstation",
        vec![
            ShelfEntry::edit("//depot/app/main.c", b"int main(void) { return 1; }\n".to_vec()),
            ShelfEntry::add("//depot/app/util.c", b"void util(void) {}\n".to_vec()),
            ShelfEntry::delete("//depot/app/README"),
        ],
    )
}

#[test]
fn materialize_then_revert_restores_synced_content() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = user_shelf(&server);
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");
    let synced = snapshot(tmp.path());

    let report = repo.materialize_shelf(shelf).expect("materialize");
    assert_eq!(report.shelved, 3);
    assert_eq!(report.touched.len(), 3);
    assert_eq!(report.skipped, 0);

    let app = tmp.path().join("depot/app");
    assert_eq!(
        std::fs::read(app.join("main.c")).expect("patched"),
        b"int main(void) { return 1; }\n"
    );
    assert!(app.join("util.c").exists());
    assert!(!app.join("README").exists());
    assert!(server.opened(repo.client_name()).is_empty());
    assert_eq!(read_patch_list(tmp.path()).expect("patch list").len(), 3);

    repo.revert().expect("revert");
    assert_eq!(snapshot(tmp.path()), synced);
    assert!(!patch_list_path(tmp.path()).exists());
}

#[test]
fn next_sync_undoes_a_materialization() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = user_shelf(&server);
    {
        let mut repo =
            Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
        repo.sync(&RevisionSpec::latest()).expect("sync");
        repo.materialize_shelf(shelf).expect("materialize");
    }

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("reopen");
    let result = repo.sync(&RevisionSpec::latest()).expect("sync");
    assert_eq!(result.files_count, 0);
    assert_eq!(
        std::fs::read(tmp.path().join("depot/app/main.c")).expect("restored"),
        MAIN_C
    );
    assert!(!tmp.path().join("depot/app/util.c").exists());
}

#[test]
fn exclusive_lock_shelf_is_refused_untouched() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = server.shelve_files(
        "Locked asset",
        "dev-workstation",
        vec![
            ShelfEntry::edit("//depot/app/main.c", b"patched\n".to_vec()),
            ShelfEntry::edit("//depot/app/logo.png", b"\x89PNG".to_vec()).with_type("binary+l"),
        ],
    );
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");
    let synced = snapshot(tmp.path());

    let err = repo.materialize_shelf(shelf).expect_err("locked files");
    match &err {
        WorkspaceError::Shelf(ShelfError::ExclusiveLock { files, .. }) => {
            assert_eq!(files, &vec!["//depot/app/logo.png".to_owned()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("exclusive lock (+l)"));
    assert_eq!(snapshot(tmp.path()), synced);
    assert!(!patch_list_path(tmp.path()).exists());

    let err = repo.unshelve(shelf).expect_err("locked files");
    assert!(matches!(err, WorkspaceError::Shelf(ShelfError::ExclusiveLock { .. })));
    assert!(server.opened(repo.client_name()).is_empty());
}

#[test]
fn missing_or_empty_shelves_are_shelf_errors() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let empty = server.shelve_files("Nothing here", "dev-workstation", Vec::new());
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");

    let err = repo.materialize_shelf(ChangeNumber(999)).expect_err("unknown change");
    assert!(matches!(err, WorkspaceError::Shelf(ShelfError::NotFound { .. })), "got {err}");

    let err = repo.materialize_shelf(empty).expect_err("empty shelf");
    assert!(matches!(err, WorkspaceError::Shelf(ShelfError::Empty { .. })), "got {err}");
}

#[test]
fn describe_failures_other_than_unknown_change_are_server_errors() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = user_shelf(&server);
    let mut quirky = Quirky::new(Arc::clone(&server));
    quirky.describe_failure = Some("You don't have permission for this operation.".to_owned());
    let mut repo = Repo::open(quirky, config(tmp.path(), "agent-1")).expect("open");

    let err = repo.materialize_shelf(shelf).expect_err("permission denied");
    assert!(matches!(err, WorkspaceError::Server(_)), "got {err}");
    assert!(err.to_string().contains("permission"));
}

#[test]
fn overlay_rows_are_written_once() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = server.shelve_files(
        "One file",
        "dev-workstation",
        vec![ShelfEntry::edit("//depot/app/main.c", b"int main(void) { return 2; }\n".to_vec())],
    );
    let mut quirky = Quirky::new(Arc::clone(&server));
    quirky.overlay_rows = true;
    let mut repo = Repo::open(quirky, config(tmp.path(), "agent-1")).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");
    let prints = server.print_count();

    let report = repo.materialize_shelf(shelf).expect("materialize");
    assert_eq!(report.shelved, 1);
    assert_eq!(report.touched.len(), 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(server.print_count() - prints, 1);
    assert_eq!(read_patch_list(tmp.path()).expect("patch list").len(), 1);
    assert_eq!(
        std::fs::read(tmp.path().join("depot/app/main.c")).expect("patched"),
        b"int main(void) { return 2; }\n"
    );
}

#[test]
fn shelf_outside_sync_scope_writes_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = server.shelve_files(
        "Docs tweak",
        "dev-workstation",
        vec![ShelfEntry::edit("//depot/docs/guide.md", b"# Better guide\n".to_vec())],
    );
    let mut app_only = config(tmp.path(), "agent-1");
    app_only.sync = vec!["//depot/app/...".to_owned()];
    let mut repo = Repo::open(Arc::clone(&server), app_only).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");
    let synced = snapshot(tmp.path());
    let prints = server.print_count();

    let report = repo.materialize_shelf(shelf).expect("out of scope is fine");
    assert!(report.touched.is_empty());
    assert_eq!(report.skipped, 1);
    assert_eq!(server.print_count(), prints);
    assert!(!patch_list_path(tmp.path()).exists());
    assert_eq!(snapshot(tmp.path()), synced);
}

#[test]
fn many_files_are_spread_over_workers() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let entries: Vec<ShelfEntry> = (0..40)
        .map(|i| ShelfEntry::add(&format!("//depot/app/gen/file{i:02}.txt"), format!("{i}\n")))
        .collect();
    let shelf = server.shelve_files("Generated", "dev-workstation", entries);

    let mut small_pool = config(tmp.path(), "agent-1");
    small_pool.shelf_workers = 4;
    let mut repo = Repo::open(Arc::clone(&server), small_pool).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");

    let report = repo.materialize_shelf(shelf).expect("materialize");
    assert_eq!(report.touched.len(), 40);
    for i in 0..40 {
        let path = tmp.path().join(format!("depot/app/gen/file{i:02}.txt"));
        assert_eq!(std::fs::read_to_string(path).expect("written"), format!("{i}\n"));
    }
}

#[test]
fn backup_copies_the_shelf_into_a_new_change() {
    let tmp = TempDir::new().expect("tempdir");
    let server = seeded_server(MemoryServer::new());
    let shelf = user_shelf(&server);
    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    repo.sync(&RevisionSpec::latest()).expect("sync");

    let backup = repo.backup_shelf(shelf).expect("backup");
    assert_ne!(backup, shelf);
    assert_eq!(
        repo.description(backup).expect("describe backup"),
        format!("Backup of {shelf} for precommit testing in Buildkite")
    );

    let original = server.shelved(shelf);
    let copied = server.shelved(backup);
    assert_eq!(copied.len(), original.len());
    for entry in &original {
        let copy = copied
            .iter()
            .find(|c| c.depot_path == entry.depot_path)
            .expect("file copied");
        assert_eq!(copy.action, entry.action);
        assert_eq!(copy.content, entry.content);
    }
}

#[test]
fn checkout_pins_revision_and_applies_branch_shelf() {
    let tmp = TempDir::new().expect("tempdir");
    let server = MemoryServer::new();
    server.submit(
        "stream import",
        &[
            ("//stream-depot/main/a.txt", b"v1\n"),
            ("//stream-depot/main/b.txt", b"b\n"),
        ],
    );
    let server = Arc::new(server);
    let shelf = server.shelve_files(
        "Fix a",
        "dev-workstation",
        vec![ShelfEntry::edit("//stream-depot/main/a.txt", b"v2\n".to_vec())],
    );
    let env = EnvContext::from_vars([
        ("BUILDKITE_BRANCH", format!("stream-depot/main!{shelf}")),
        ("BUILDKITE_COMMIT", "HEAD".to_owned()),
    ]);
    let metadata = MemoryMetadata::new();
    let mut stream_config = config(tmp.path(), "agent-1");
    stream_config.stream = Some("//stream-depot/main".to_owned());

    let first = {
        let mut repo =
            Repo::open(Arc::clone(&server), stream_config.clone()).expect("open");
        checkout(&mut repo, &env, &metadata).expect("checkout")
    };
    assert_eq!(first.revision, RevisionSpec::new("@1"));
    assert_eq!(first.sync.files_count, 2);
    let (user_change, backup) = first.shelf.expect("shelf applied");
    assert_eq!(user_change, shelf);
    assert_eq!(
        std::fs::read(tmp.path().join("a.txt")).expect("patched"),
        b"v2\n"
    );

    let values = metadata.snapshot();
    assert_eq!(values[REVISION_KEY], "@1");
    assert_eq!(values[SHELVE_KEY], backup.to_string());
    assert_eq!(values[COMMIT_INFO_KEY], "commit 1\n\n\tFix a");

    // A later job of the same build reuses the pinned revision and backup.
    let second = {
        let mut repo = Repo::open(Arc::clone(&server), stream_config).expect("reopen");
        checkout(&mut repo, &env, &metadata).expect("checkout again")
    };
    assert_eq!(second.revision, first.revision);
    assert_eq!(second.shelf, Some((shelf, backup)));
    assert!(server.shelved(ChangeNumber(backup.0 + 1)).is_empty());
    assert_eq!(
        std::fs::read(tmp.path().join("a.txt")).expect("patched"),
        b"v2\n"
    );
}

#[test]
fn checkout_on_an_empty_server_pins_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let server = Arc::new(MemoryServer::new());
    let env = EnvContext::from_vars([("BUILDKITE_COMMIT", "HEAD")]);
    let metadata = MemoryMetadata::new();

    let mut repo = Repo::open(Arc::clone(&server), config(tmp.path(), "agent-1")).expect("open");
    let outcome = checkout(&mut repo, &env, &metadata).expect("checkout");
    assert!(outcome.revision.is_latest());
    assert_eq!(outcome.sync.files_count, 0);
    assert!(metadata.snapshot().is_empty());
}
