//! `ferry remote` driven as an exec peer by the remote driver.

use std::path::Path;
use std::sync::Arc;

use ferry_storage::drivers::ExecConnector;
use ferry_storage::{RemoteDriver, Storage};

fn remote_argv(config: &Path) -> Vec<String> {
    vec![
        env!("CARGO_BIN_EXE_ferry").to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "remote".to_string(),
    ]
}

fn posix_repo(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let repo = dir.join("repo");
    std::fs::create_dir(&repo).unwrap();
    let config = dir.join("ferry.toml");
    std::fs::write(&config, format!("[repo]\npath = \"{}\"\n", repo.display())).unwrap();
    (repo, config)
}

#[tokio::test]
async fn peer_process_exits_cleanly_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, config) = posix_repo(dir.path());

    let connector = Arc::new(ExecConnector::new(remote_argv(&config)));
    let storage = Storage::new(Arc::new(RemoteDriver::connect(connector).await.unwrap())).writable();
    storage.put("archive/000000010000000000000001", b"over exec").await.unwrap();
    assert_eq!(
        std::fs::read(repo.join("archive/000000010000000000000001")).unwrap(),
        b"over exec"
    );

    // fails unless the peer saw `exit` and returned status 0
    storage.close().await.unwrap();

    // the driver reconnects after close
    assert_eq!(
        storage.get("archive/000000010000000000000001", false).await.unwrap(),
        Some(b"over exec".to_vec())
    );
    storage.close().await.unwrap();
}

#[tokio::test]
async fn peer_with_bad_config_fails_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("ferry.toml");
    std::fs::write(&config, "[repo]\npath = \"relative\"\n").unwrap();

    let connector = Arc::new(ExecConnector::new(remote_argv(&config)));
    assert!(RemoteDriver::connect(connector).await.is_err());
}
