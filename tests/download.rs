mod common;

use common::{tree, write, Env, ToyCipher};
use encsync_lib::core::{DownloadSummary, DownloadTarget, ScanTarget, Status, Target};
use encsync_lib::storage::{LocalStorage, SharedStorage};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn dest(env: &Env) -> SharedStorage {
    Arc::new(LocalStorage::new(env.path("out").to_str().unwrap()).unwrap())
}

fn plain_sample(env: &Env) {
    write(env.path("src/docs/a.txt"), b"aaa");
    write(env.path("src/docs/sub/b.txt"), b"bb");
    write(env.path("src/other.txt"), b"o");
}

#[tokio::test]
async fn test_download_indexed_subtree_then_skip() {
    let env = Env::new();
    plain_sample(&env);
    let source = env.folder("src", "src");
    ScanTarget::new(&env.ctx, source.clone()).run().await.unwrap();

    let target = DownloadTarget::new(&env.ctx, source, "/docs", dest(&env), "/copy");
    let summary = target.download(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        summary,
        DownloadSummary {
            dirs: 2,
            downloaded: 2,
            skipped: 0,
            failed: 0,
        }
    );
    assert_eq!(
        tree(env.path("out")),
        vec!["copy/", "copy/a.txt", "copy/sub/", "copy/sub/b.txt"]
    );
    assert_eq!(std::fs::read(env.path("out/copy/sub/b.txt")).unwrap(), b"bb");

    let again = target.download(&CancellationToken::new()).await.unwrap();
    assert_eq!(again.downloaded, 0);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn test_download_unindexed_file_into_dir() {
    let env = Env::new();
    plain_sample(&env);
    let target = DownloadTarget::new(
        &env.ctx,
        env.folder("src", "src"),
        "/docs/a.txt",
        dest(&env),
        "/",
    );

    target.run().await.unwrap();
    assert_eq!(target.status(), Status::Finished);
    assert_eq!(tree(env.path("out")), vec!["a.txt"]);
    assert_eq!(std::fs::read(env.path("out/a.txt")).unwrap(), b"aaa");
}

#[tokio::test]
async fn test_download_file_to_new_name() {
    let env = Env::new();
    plain_sample(&env);
    let target = DownloadTarget::new(
        &env.ctx,
        env.folder("src", "src"),
        "/other.txt",
        dest(&env),
        "/renamed.txt",
    );

    target.run().await.unwrap();
    assert_eq!(tree(env.path("out")), vec!["renamed.txt"]);
}

#[tokio::test]
async fn test_download_decrypts_unindexed_source() {
    let env = Env::new();
    let raw = env.path("enc");
    let raw_dir = raw.join(ToyCipher::encode(3, "d"));
    write(raw_dir.join(ToyCipher::encode(4, "b")), b"TOY!zz");
    write(raw.join(ToyCipher::encode(5, "d-x")), b"TOY!no");

    let target = DownloadTarget::new(
        &env.ctx,
        env.encrypted_folder("enc", "enc"),
        "/d",
        dest(&env),
        "/restored",
    );
    target.run().await.unwrap();

    assert_eq!(tree(env.path("out")), vec!["restored/", "restored/b"]);
    assert_eq!(std::fs::read(env.path("out/restored/b")).unwrap(), b"zz");
}

#[tokio::test]
async fn test_download_missing_source_fails() {
    let env = Env::new();
    plain_sample(&env);
    let target = DownloadTarget::new(
        &env.ctx,
        env.folder("src", "src"),
        "/nope",
        dest(&env),
        "/x",
    );

    let err = target.run().await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(target.status(), Status::Failed);
}
