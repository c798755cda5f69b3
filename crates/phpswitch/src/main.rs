mod config;
mod error;
mod logging;
mod op_lock;
mod render;
mod selection;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use phpswitch_core::{Engine, EngineConfig, StartupRefresh};
use phpswitch_model::{ProgressSink, RegistryStore, VersionKey};
use phpswitch_platform::{
    AppPaths, LinkState, default_search_path, is_elevated, link_state, restart_elevated,
};
use tokio::task::JoinHandle;

use crate::config::JsonConfigStore;
use crate::error::AppError;
use crate::op_lock::OperationLock;
use crate::render::StderrProgress;
use crate::selection::{BuildFilter, VersionSelector, resolve_catalog, resolve_installed};

#[derive(Parser, Debug)]
#[command(name = "phpswitch", version)]
#[command(about = "Install PHP builds and switch the system-wide version", long_about = None)]
struct Cli {
    /// Verbose logging to the terminal and log file.
    #[arg(long, global = true)]
    debug: bool,
    /// Refresh the catalog on every run and keep the raw listing.
    #[arg(long, global = true)]
    dev: bool,
    /// Do not relaunch with administrator rights.
    #[arg(long, global = true)]
    no_elevate: bool,
    /// Use (and remember) a different install root.
    #[arg(long, global = true, value_name = "DIR")]
    install_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Copy)]
struct BuildArgs {
    /// Non-thread-safe build.
    #[arg(long)]
    nts: bool,
    /// 32-bit build.
    #[arg(long)]
    x86: bool,
}

impl BuildArgs {
    fn filter(self) -> BuildFilter {
        BuildFilter::new(self.nts, self.x86)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Installed versions.
    List,
    /// Versions in the release catalog.
    Available {
        /// Every patch release instead of the newest per line.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        refresh: bool,
    },
    /// Fetch the release catalog now.
    Refresh,
    /// Download and install a version (X.Y for the newest patch, or X.Y.Z).
    Install {
        selector: String,
        #[command(flatten)]
        build: BuildArgs,
        /// Make it the active version afterwards.
        #[arg(long)]
        activate: bool,
    },
    /// Make an installed version the active one.
    Use {
        selector: String,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Delete installed versions.
    Remove {
        #[arg(required = true)]
        selectors: Vec<String>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Rescan the install root.
    Sync,
    /// Report the active version.
    Status,
    /// Print the directories phpswitch uses.
    Paths,
}

impl Commands {
    fn touches_machine_state(&self) -> bool {
        matches!(
            self,
            Self::Use { .. } | Self::Remove { .. } | Self::Install { activate: true, .. }
        )
    }

    /// Every command past `paths` reconciles and may save the registry.
    fn writes_config(&self) -> bool {
        !matches!(self, Self::Paths)
    }

    fn refreshes_explicitly(&self) -> bool {
        matches!(self, Self::Refresh | Self::Available { refresh: true, .. })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = paths.ensure_dirs() {
        eprintln!("warning: failed to create application directories: {error}");
    }

    let store = Arc::new(JsonConfigStore::open(paths.config_file()));
    let settings = store.settings();
    logging::init_logging(
        &paths.log_file(),
        cli.debug || settings.debug_logging,
        settings.max_log_size_bytes,
    );
    info!("phpswitch {} running {:?}", env!("CARGO_PKG_VERSION"), cli.command);

    match run(cli, &paths, store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if error.is_usage_error() {
                warn!("{error}");
            } else {
                log_failure_context(&error, &paths);
            }
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn log_failure_context(error: &AppError, paths: &AppPaths) {
    error!("Command failed: {error}");
    error!(
        "Environment: os={} arch={} pid={} elevated={} exe={} log={}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::process::id(),
        is_elevated(),
        std::env::current_exe().map_or_else(|_| "unknown".to_string(), |p| p.display().to_string()),
        paths.log_file().display()
    );
}

async fn run(cli: Cli, paths: &AppPaths, store: Arc<JsonConfigStore>) -> Result<(), AppError> {
    // The machine search path lives under HKLM, so every redirection change
    // needs administrator rights on Windows.
    if cfg!(windows) && cli.command.touches_machine_state() && !cli.no_elevate && !is_elevated() {
        info!("Relaunching with administrator rights");
        let args: Vec<String> = std::env::args().skip(1).collect();
        restart_elevated(&args)?;
        println!("Continuing in an elevated window");
        return Ok(());
    }

    let _lock = if cli.command.writes_config() || cli.install_root.is_some() {
        let lock = OperationLock::acquire(&paths.operation_lock_file())?;
        store.reload();
        Some(lock)
    } else {
        None
    };

    let mut settings = store.settings();
    settings.dev_mode |= cli.dev;

    if let Commands::Paths = cli.command {
        print_paths(paths, &store, &settings);
        return Ok(());
    }

    let engine_config = EngineConfig {
        link_path: settings.link_path(paths),
        scratch_dir: paths.download_dir(),
        catalog: settings.catalog_source(paths),
        http_timeout: Duration::from_secs(settings.http_timeout_secs),
        verify_timeout: Duration::from_secs(settings.verify_timeout_secs),
        refresh_policy: settings.refresh_policy(),
    };
    let engine = Arc::new(Engine::new(
        engine_config,
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        default_search_path(paths),
    )?);

    let root = cli.install_root.clone().or_else(|| {
        settings
            .registry
            .install_root
            .as_os_str()
            .is_empty()
            .then(|| paths.default_install_root())
    });
    if let Some(root) = root {
        engine.set_install_root(root).await?;
    }

    let (report, background) = if cli.command.refreshes_explicitly() {
        (engine.reconcile().await?, None)
    } else {
        let (report, refresh) = engine.startup().await?;
        let background = match refresh {
            StartupRefresh::Background(handle) => Some(handle),
            StartupRefresh::Completed(false) => {
                warn!("No catalog could be fetched; the release list may be empty");
                None
            }
            StartupRefresh::NotNeeded
            | StartupRefresh::Completed(true)
            | StartupRefresh::AlreadyRunning => None,
        };
        (report, background)
    };

    if settings.first_run {
        println!(
            "Versions install to {}; the active one is linked at {}",
            engine.snapshot().await.install_root.display(),
            engine.link_path().display()
        );
        store.update_settings(|config| config.first_run = false)?;
    }

    let result = dispatch(&cli.command, &engine, report).await;
    finish_background_refresh(background).await;
    result
}

async fn dispatch(
    command: &Commands,
    engine: &Arc<Engine>,
    report: phpswitch_core::ReconcileReport,
) -> Result<(), AppError> {
    match command {
        Commands::List => {
            for line in render::installed_lines(&engine.snapshot().await) {
                println!("{line}");
            }
        }
        Commands::Available { all, refresh } => {
            if *refresh {
                engine.try_refresh_catalog().await?;
            }
            for line in render::available_lines(&engine.snapshot().await, *all) {
                println!("{line}");
            }
        }
        Commands::Refresh => {
            let count = engine.try_refresh_catalog().await?;
            println!("Catalog updated with {count} packages");
        }
        Commands::Install {
            selector,
            build,
            activate,
        } => install(engine, selector, *build, *activate).await?,
        Commands::Use { selector, build } => {
            let key = installed_key(engine, selector, *build).await?;
            activate(engine, &key).await?;
        }
        Commands::Remove { selectors, build } => remove(engine, selectors, *build).await?,
        Commands::Sync => println!("{}", render::report_line(&report)),
        Commands::Status => status(engine).await,
        Commands::Paths => {}
    }
    Ok(())
}

async fn install(
    engine: &Arc<Engine>,
    selector: &str,
    build: BuildArgs,
    then_activate: bool,
) -> Result<(), AppError> {
    let parsed: VersionSelector = selector.parse()?;
    let registry = engine.snapshot().await;
    let entry = resolve_catalog(&registry.available_versions, parsed, build.filter())
        .cloned()
        .ok_or_else(|| AppError::no_match("catalog entry", selector))?;

    let sink: Arc<dyn ProgressSink> = Arc::new(StderrProgress);
    let installed = engine.install(&entry, sink).await?;
    println!(
        "Installed {} to {}",
        installed.display_name(),
        installed.install_path.display()
    );

    if then_activate {
        activate(engine, &installed.key()).await?;
    }
    Ok(())
}

async fn installed_key(
    engine: &Arc<Engine>,
    selector: &str,
    build: BuildArgs,
) -> Result<VersionKey, AppError> {
    let parsed: VersionSelector = selector.parse()?;
    let registry = engine.snapshot().await;
    resolve_installed(&registry.installed_versions, parsed, build.filter())
        .map(phpswitch_model::InstalledVersion::key)
        .ok_or_else(|| AppError::no_match("installed version", selector))
}

async fn activate(engine: &Arc<Engine>, key: &VersionKey) -> Result<(), AppError> {
    let version = engine.activate(key).await?;
    println!("Now using PHP {version} ({key})");
    println!(
        "{} is on the search path via {}",
        engine.link_path().display(),
        engine.search_path().describe()
    );
    Ok(())
}

async fn remove(
    engine: &Arc<Engine>,
    selectors: &[String],
    build: BuildArgs,
) -> Result<(), AppError> {
    let mut keys = Vec::new();
    let mut unmatched = 0;
    for selector in selectors {
        match installed_key(engine, selector, build).await {
            Ok(key) => keys.push(key),
            Err(error) => {
                eprintln!("{error}");
                unmatched += 1;
            }
        }
    }

    let summary = engine.remove_many(&keys).await;
    let failed = summary.failed + unmatched;
    println!("Removed {}, failed {failed}", summary.removed);
    if failed > 0 {
        return Err(AppError::operation_failed(
            "Remove",
            format!("{failed} of {} versions could not be removed", selectors.len()),
        ));
    }
    Ok(())
}

async fn status(engine: &Arc<Engine>) {
    println!("{}", render::status_line(&engine.check_active_version().await));

    let link = engine.link_path();
    match link_state(link) {
        LinkState::Missing => println!("Link {} does not exist", link.display()),
        LinkState::RealDirectory => println!(
            "{} is a real directory; it will be backed up on the next switch",
            link.display()
        ),
        LinkState::Link(target) => println!("Link {} -> {}", link.display(), target.display()),
    }

    match engine.search_path().contains(link) {
        Ok(true) => println!("{} is on the search path", link.display()),
        Ok(false) => println!(
            "{} is not on the search path yet ({})",
            link.display(),
            engine.search_path().describe()
        ),
        Err(error) => warn!("Could not read the search path: {error}"),
    }

    if let Some(active) = engine.snapshot().await.active() {
        println!("Registry active entry: {}", active.display_name());
    }
}

fn print_paths(paths: &AppPaths, store: &JsonConfigStore, settings: &config::AppConfig) {
    let install_root = if settings.registry.install_root.as_os_str().is_empty() {
        paths.default_install_root()
    } else {
        settings.registry.install_root.clone()
    };
    println!("config:       {}", store.path().display());
    println!("cache:        {}", paths.cache_dir.display());
    println!("log:          {}", paths.log_file().display());
    println!("install root: {}", install_root.display());
    println!("link:         {}", settings.link_path(paths).display());
}

async fn finish_background_refresh(handle: Option<JoinHandle<bool>>) {
    let Some(handle) = handle else {
        return;
    };
    match handle.await {
        Ok(true) => info!("Background catalog refresh finished"),
        Ok(false) => warn!("Background catalog refresh kept the cached catalog"),
        Err(error) => warn!("Background catalog refresh task failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn install_flags_parse() {
        let cli = Cli::parse_from([
            "phpswitch",
            "--no-elevate",
            "install",
            "8.2",
            "--nts",
            "--activate",
        ]);
        assert!(cli.no_elevate);
        let Commands::Install {
            selector,
            build,
            activate,
        } = cli.command
        else {
            panic!("expected install command");
        };
        assert_eq!(selector, "8.2");
        assert!(build.nts && !build.x86);
        assert!(activate);
    }

    #[test]
    fn only_redirection_changes_touch_machine_state() {
        let install = Cli::parse_from(["phpswitch", "install", "8.3"]).command;
        let install_activate = Cli::parse_from(["phpswitch", "install", "8.3", "--activate"]).command;
        let remove = Cli::parse_from(["phpswitch", "remove", "8.1", "8.2"]).command;
        let list = Cli::parse_from(["phpswitch", "list"]).command;

        assert!(!install.touches_machine_state());
        assert!(install_activate.touches_machine_state());
        assert!(remove.touches_machine_state());
        assert!(!list.touches_machine_state());
    }

    #[test]
    fn every_command_but_paths_takes_the_operation_lock() {
        for args in [
            vec!["phpswitch", "list"],
            vec!["phpswitch", "status"],
            vec!["phpswitch", "available"],
            vec!["phpswitch", "sync"],
            vec!["phpswitch", "install", "8.3"],
        ] {
            assert!(Cli::parse_from(args).command.writes_config());
        }
        assert!(!Cli::parse_from(["phpswitch", "paths"]).command.writes_config());
    }

    #[test]
    fn remove_requires_a_selector() {
        assert!(Cli::try_parse_from(["phpswitch", "remove"]).is_err());
    }
}
