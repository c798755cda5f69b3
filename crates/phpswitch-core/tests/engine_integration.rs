mod support;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use phpswitch_core::{
    ActivationError, CatalogError, Engine, EngineError, InstallError, StartupRefresh,
    VerifyError, build_client, fetch_catalog, try_fetch_catalog,
};
use phpswitch_model::{
    InstallPhase, InstallProgress, MemoryStore, NoProgress, PhpVersion, ProgressSink, Registry,
    RegistryStore, ThreadSafety, VersionKey,
};
use phpswitch_platform::{ProfileScript, SearchPath, SearchPathError};
use support::{TestServer, closed_url, engine_config, install_root, listing_html, package_zip};
use tempfile::tempdir;

const FILE_823: &str = "php-8.2.3-Win32-vs16-x64.zip";
const FILE_822_NTS: &str = "php-8.2.2-nts-Win32-vs16-x64.zip";
const FILE_TINY: &str = "php-7.4.33-Win32-vc15-x86.zip";

async fn package_server(scratch: &Path) -> TestServer {
    let mut routes = HashMap::new();
    routes.insert("/".to_string(), b"ok".to_vec());
    routes.insert(
        "/archives/".to_string(),
        listing_html(&[FILE_823, FILE_822_NTS, FILE_TINY]),
    );
    routes.insert(
        format!("/archives/{FILE_823}"),
        package_zip(scratch, "8.2.3"),
    );
    routes.insert(
        format!("/archives/{FILE_822_NTS}"),
        package_zip(scratch, "8.2.2"),
    );
    routes.insert(
        format!("/archives/{FILE_TINY}"),
        vec![0u8; 10 * 1024],
    );
    TestServer::start(routes).await
}

fn engine_for(server: &TestServer, root: &Path) -> (Arc<Engine>, Arc<MemoryStore>) {
    let search_path = ProfileScript::with_live_path(root.join("env.sh"), "");
    engine_with_search_path(server, root, Box::new(search_path))
}

fn engine_with_search_path(
    server: &TestServer,
    root: &Path,
    search_path: Box<dyn SearchPath>,
) -> (Arc<Engine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(Registry::new(install_root(root))));
    let engine = Engine::new(
        engine_config(server, root),
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        search_path,
    )
    .expect("engine should be built");
    (Arc::new(engine), store)
}

/// A search path that can be read but never written.
struct ReadOnlySearchPath;

impl SearchPath for ReadOnlySearchPath {
    fn contains(&self, _dir: &Path) -> Result<bool, SearchPathError> {
        Ok(false)
    }

    fn append(&self, _dir: &Path) -> Result<(), SearchPathError> {
        Err(SearchPathError::Io {
            context: "failed to write search path",
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn describe(&self) -> String {
        "read-only test path".to_string()
    }
}

async fn install_files(engine: &Engine, store: &MemoryStore, files: &[&str]) -> Vec<VersionKey> {
    assert!(engine.refresh_catalog().await);
    let catalog = store.snapshot().available_versions;
    let mut keys = Vec::new();
    for file in files {
        let entry = catalog
            .iter()
            .find(|entry| entry.file_name == *file)
            .expect("package should be listed");
        let installed = engine
            .install(entry, Arc::new(NoProgress))
            .await
            .expect("install should succeed");
        keys.push(installed.key());
    }
    keys
}

fn active_path(store: &MemoryStore) -> Option<std::path::PathBuf> {
    store
        .snapshot()
        .active()
        .map(|active| active.install_path.clone())
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<InstallProgress>>,
}

impl ProgressSink for RecordingSink {
    fn report(&self, progress: InstallProgress) {
        self.events
            .lock()
            .expect("sink lock should not be poisoned")
            .push(progress);
    }
}

impl RecordingSink {
    fn phases(&self) -> Vec<InstallPhase> {
        self.events
            .lock()
            .expect("sink lock should not be poisoned")
            .iter()
            .map(|event| event.phase)
            .collect()
    }
}

#[tokio::test]
async fn catalog_is_fetched_from_listing() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let config = engine_config(&server, temp.path());
    let client = build_client(config.http_timeout).expect("client should be built");

    let entries = try_fetch_catalog(&client, &config.catalog)
        .await
        .expect("listing should be fetched");

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].version, PhpVersion::new(8, 2, 3));
    assert_eq!(
        entries[0].download_url,
        server.url(&format!("/archives/{FILE_823}"))
    );
    let nts = entries
        .iter()
        .find(|entry| entry.file_name == FILE_822_NTS)
        .expect("nts build should be listed");
    assert_eq!(nts.thread_safety, ThreadSafety::Nts);
    assert!(!nts.is_latest_patch);
}

#[tokio::test]
async fn catalog_fetch_gives_up_without_connectivity() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let mut config = engine_config(&server, temp.path());
    config.catalog.probe_urls = vec![closed_url().await];
    let client = build_client(config.http_timeout).expect("client should be built");

    let error = try_fetch_catalog(&client, &config.catalog)
        .await
        .expect_err("fetch should fail without connectivity");
    assert!(matches!(error, CatalogError::Connectivity));
    assert!(fetch_catalog(&client, &config.catalog).await.is_none());
}

#[tokio::test]
async fn empty_listing_is_an_error() {
    let mut routes = HashMap::new();
    routes.insert("/".to_string(), b"ok".to_vec());
    routes.insert("/archives/".to_string(), Vec::new());
    let server = TestServer::start(routes).await;
    let temp = tempdir().expect("create temp dir");
    let config = engine_config(&server, temp.path());
    let client = build_client(config.http_timeout).expect("client should be built");

    let error = try_fetch_catalog(&client, &config.catalog)
        .await
        .expect_err("empty listing should fail");
    assert!(matches!(error, CatalogError::EmptyListing));
}

#[tokio::test]
async fn startup_fetches_in_foreground_when_catalog_is_empty() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());

    let (_report, refresh) = engine.startup().await.expect("startup should succeed");
    assert!(matches!(refresh, StartupRefresh::Completed(true)));
    assert_eq!(store.snapshot().available_versions.len(), 3);
    assert!(store.snapshot().last_updated.is_some());

    let (_report, refresh) = engine.startup().await.expect("startup should succeed");
    assert!(matches!(refresh, StartupRefresh::NotNeeded));
}

#[tokio::test]
async fn install_records_version_and_survives_reconcile() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());
    assert!(engine.refresh_catalog().await);

    let entry = store
        .snapshot()
        .available_versions
        .into_iter()
        .find(|entry| entry.file_name == FILE_823)
        .expect("8.2.3 should be listed");
    let sink = Arc::new(RecordingSink::default());

    let installed = engine
        .install(&entry, Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .await
        .expect("install should succeed");

    assert_eq!(installed.version, PhpVersion::new(8, 2, 3));
    assert_eq!(
        installed.install_path,
        install_root(temp.path()).join("php-8.2.3")
    );
    assert!(installed.install_path.join(support::EXE).is_file());
    assert!(!installed.is_active);

    let phases = sink.phases();
    assert_eq!(phases.first(), Some(&InstallPhase::Starting));
    assert!(phases.contains(&InstallPhase::Downloading));
    assert!(phases.contains(&InstallPhase::Extracting));
    assert_eq!(phases.last(), Some(&InstallPhase::Completed));

    let report = engine.reconcile().await.expect("reconcile should succeed");
    assert_eq!(report.found, 1);
    assert!(!report.changed());
    assert_eq!(engine.snapshot().await.installed_versions.len(), 1);
    assert!(
        engine
            .is_installed(installed.version, installed.thread_safety, Some(installed.arch))
            .await
    );

    let scratch = temp.path().join("scratch");
    let leftovers = std::fs::read_dir(&scratch)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn undersized_download_is_rejected_without_install_dir() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());
    assert!(engine.refresh_catalog().await);

    let entry = store
        .snapshot()
        .available_versions
        .into_iter()
        .find(|entry| entry.file_name == FILE_TINY)
        .expect("7.4.33 should be listed");
    let sink = Arc::new(RecordingSink::default());

    let error = engine
        .install(&entry, Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .await
        .expect_err("a 10 KB package should be rejected");

    assert!(matches!(
        error,
        EngineError::Install(InstallError::Undersized { bytes: 10_240 })
    ));
    assert!(!install_root(temp.path()).join("php-7.4.33").exists());
    assert_eq!(sink.phases().last(), Some(&InstallPhase::Failed));
    assert!(engine.snapshot().await.installed_versions.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn activation_backs_up_real_directory_and_marks_one_active() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());
    assert!(engine.refresh_catalog().await);

    let catalog = store.snapshot().available_versions;
    let mut keys = Vec::new();
    for file in [FILE_823, FILE_822_NTS] {
        let entry = catalog
            .iter()
            .find(|entry| entry.file_name == file)
            .expect("package should be listed");
        let installed = engine
            .install(entry, Arc::new(NoProgress))
            .await
            .expect("install should succeed");
        keys.push(installed.key());
    }

    let link = engine.link_path().to_path_buf();
    std::fs::create_dir_all(link.join("ext")).expect("manual install should be created");
    std::fs::write(link.join("php.ini"), "memory_limit=1G").expect("ini should be written");
    std::fs::write(link.join("ext").join("php_xdebug.so"), "so").expect("ext should be written");

    let version = engine.activate(&keys[0]).await.expect("activation should succeed");
    assert_eq!(version, PhpVersion::new(8, 2, 3));

    let backups: Vec<_> = std::fs::read_dir(temp.path())
        .expect("temp dir should be readable")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("php_backup_"))
        })
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        std::fs::read_to_string(backups[0].join("php.ini")).expect("ini should be backed up"),
        "memory_limit=1G"
    );
    assert!(backups[0].join("ext").join("php_xdebug.so").is_file());

    let script = std::fs::read_to_string(temp.path().join("env.sh"))
        .expect("profile script should be written");
    assert!(script.contains(&link.to_string_lossy().into_owned()));

    let version = engine.activate(&keys[1]).await.expect("switch should succeed");
    assert_eq!(version, PhpVersion::new(8, 2, 2));

    let registry = store.snapshot();
    let active: Vec<_> = registry
        .installed_versions
        .iter()
        .filter(|installed| installed.is_active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key(), keys[1]);
    assert_eq!(
        std::fs::read_link(&link).expect("link should exist"),
        active[0].install_path
    );

    let script = std::fs::read_to_string(temp.path().join("env.sh"))
        .expect("profile script should be readable");
    assert_eq!(script.lines().count(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn failed_verification_keeps_link_and_follows_it_in_registry() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());
    let keys = install_files(&engine, &store, &[FILE_823, FILE_822_NTS]).await;

    engine.activate(&keys[0]).await.expect("first activation should succeed");

    let broken = store
        .snapshot()
        .find_installed(&keys[1])
        .expect("second version should be recorded")
        .install_path
        .clone();
    std::fs::write(
        broken.join(support::EXE),
        "#!/bin/sh\necho 'Warning: broken extension' >&2\necho 'PHP 8.2.2 (cli)'\n",
    )
    .expect("runtime should be replaced");

    let error = engine
        .activate(&keys[1])
        .await
        .expect_err("verification should fail");
    assert!(
        matches!(
            error,
            EngineError::Activation(ActivationError::Verify(VerifyError::Stderr(_)))
        ),
        "unexpected error: {error}"
    );

    let link = engine.link_path();
    assert_eq!(std::fs::read_link(link).expect("link should remain"), broken);
    assert_eq!(active_path(&store), Some(broken));
    assert_eq!(
        store
            .snapshot()
            .installed_versions
            .iter()
            .filter(|installed| installed.is_active)
            .count(),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn search_path_failure_is_reported_after_linking() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) =
        engine_with_search_path(&server, temp.path(), Box::new(ReadOnlySearchPath));
    let keys = install_files(&engine, &store, &[FILE_823]).await;

    let error = engine
        .activate(&keys[0])
        .await
        .expect_err("search path update should fail");
    assert!(
        matches!(error, EngineError::Activation(ActivationError::PathUpdate(_))),
        "unexpected error: {error}"
    );

    let target = store
        .snapshot()
        .find_installed(&keys[0])
        .expect("version should stay recorded")
        .install_path
        .clone();
    assert_eq!(
        std::fs::read_link(engine.link_path()).expect("link should be created"),
        target
    );
    assert_eq!(active_path(&store), Some(target));
}

#[cfg(unix)]
#[tokio::test]
async fn remove_many_counts_successes_and_failures() {
    let temp = tempdir().expect("create temp dir");
    let server = package_server(temp.path()).await;
    let (engine, store) = engine_for(&server, temp.path());
    assert!(engine.refresh_catalog().await);

    let entry = store
        .snapshot()
        .available_versions
        .into_iter()
        .find(|entry| entry.file_name == FILE_823)
        .expect("8.2.3 should be listed");
    let installed = engine
        .install(&entry, Arc::new(NoProgress))
        .await
        .expect("install should succeed");
    engine
        .activate(&installed.key())
        .await
        .expect("activation should succeed");

    let unknown = phpswitch_model::VersionKey::new(
        PhpVersion::new(5, 6, 40),
        ThreadSafety::Ts,
        phpswitch_model::Arch::X86,
    );
    let summary = engine.remove_many(&[installed.key(), unknown]).await;

    assert_eq!(summary.removed, 1);
    assert_eq!(summary.failed, 1);
    assert!(!installed.install_path.exists());
    assert!(std::fs::symlink_metadata(engine.link_path()).is_err());
    assert!(store.snapshot().installed_versions.is_empty());
}
