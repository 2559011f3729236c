use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;

use crate::config::EffectiveConfig;
use crate::core::{ScanConfig, ScanState};
use crate::engine::{Engine, EngineOptions};
use crate::scan::ScanCommand;
use crate::ui::{ScanConsole, UiConfig, UpdateConsole, write_json};
use crate::update::UpdateSettings;

#[derive(Debug, Parser)]
#[command(
    name = "depcheck-runner",
    version,
    about = "Run OWASP Dependency-Check scans, keep the install up to date, and read its JSON reports"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Abort a scan that runs longer than this many seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan a project directory with Dependency-Check.
    Scan(ScanArgs),
    /// Download and install the latest Dependency-Check release.
    Update(UpdateArgs),
    /// Load and summarize a Dependency-Check JSON report.
    Report(ReportArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Project directory to scan (defaults to the current directory).
    #[arg(long)]
    pub project: Option<PathBuf>,
    #[arg(long)]
    pub install_dir: Option<PathBuf>,
    #[arg(long)]
    pub format: Option<String>,
    /// Pass `--noupdate` so the tool skips its vulnerability database refresh.
    #[arg(long, conflicts_with = "update")]
    pub no_update: bool,
    /// Let the tool refresh its vulnerability database.
    #[arg(long)]
    pub update: bool,
    #[arg(long)]
    pub nvd_api_key: Option<String>,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    pub install_dir: Option<PathBuf>,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Report file (defaults to ./dependency-check-report.json).
    pub path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct ScanJson<'a> {
    status: ScanState,
    exit_code: i32,
    report_path: &'a Path,
    report: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct DryRunJson<'a> {
    command_line: String,
    report_path: &'a Path,
}

#[derive(Debug, Serialize)]
struct UpdateJson<'a> {
    version: &'a str,
    install_dir: &'a Path,
    downloaded_bytes: u64,
    extracted_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::platform::effective_home_dir()?;

    let env_config_path = std::env::var_os("DEPCHECK_CONFIG").map(PathBuf::from);
    let cfg = crate::config::load(
        cli.config.as_deref().or(env_config_path.as_deref()),
        &home_dir,
    )
    .map_err(crate::exit::invalid_args_err)?;

    let color = stdout_is_tty && cfg.ui.color && !cli.no_color;

    let ui_cfg = UiConfig {
        color,
        stderr_is_tty,
        quiet: cli.quiet,
        verbose: cli.verbose,
        json: cli.json,
    };

    let engine = Engine::new(
        EngineOptions {
            http_timeout: Duration::from_secs(cfg.update.http_timeout_secs),
            download_timeout: Duration::from_secs(cfg.update.download_timeout_secs),
            ..EngineOptions::default()
        },
        home_dir,
    );

    match cli.command {
        Commands::Scan(args) => {
            let config = scan_config(&cfg, &args, cli.timeout)?;
            let command = ScanCommand::build(&config);
            let report_path = crate::report::default_report_path(&config.project_path);

            if args.dry_run {
                let command_line = command.redacted_command_line();
                if cli.json {
                    write_json(&DryRunJson {
                        command_line,
                        report_path: &report_path,
                    })?;
                } else if !ui_cfg.quiet {
                    println!("dry-run: would run: {command_line}");
                    println!("report: {}", report_path.display());
                }
                return Ok(());
            }

            let runner = engine.runner().clone();
            // Outside a running scan (readiness wait, report load) there is
            // nothing to cancel, so Ctrl-C ends the process.
            ctrlc::set_handler(move || {
                if !runner.cancel() {
                    std::process::exit(crate::exit::ExitCode::Interrupted.as_i32());
                }
            })
            .context("failed to install the Ctrl-C handler")?;

            let mut console = ScanConsole::new(&ui_cfg);
            let outcome = engine.scan(&config, &mut console)?;

            if ui_cfg.verbose {
                if let Some(path) = &outcome.log_path {
                    eprintln!(
                        "log: {}",
                        crate::logs::mask_home(path, engine.home_dir())
                    );
                }
            }

            if cli.json {
                write_json(&ScanJson {
                    status: outcome.result.state(),
                    exit_code: outcome.result.exit_code,
                    report_path: &outcome.result.report_path,
                    report: outcome.report.value(),
                })?;
            } else {
                crate::ui::print_report(&outcome.report, &ui_cfg);
            }
        }
        Commands::Update(args) => {
            let install_dir = resolve_install_dir(&cfg, args.install_dir)?;
            let updater = engine.updater(UpdateSettings {
                version_url: cfg.update.version_url.clone(),
                release_base_url: cfg.update.release_base_url.clone(),
            })?;

            if args.dry_run {
                let plan = updater.plan(&install_dir)?;
                if cli.json {
                    write_json(&plan)?;
                } else if !ui_cfg.quiet {
                    println!("dry-run: latest version: {}", plan.latest_version);
                    println!("dry-run: would download: {}", plan.download_url);
                    println!(
                        "dry-run: would replace the contents of: {}",
                        plan.install_dir.display()
                    );
                }
                return Ok(());
            }

            let mut console = UpdateConsole::new(&ui_cfg);
            let res = engine.update(&updater, &install_dir, &mut console);
            console.finish();
            let outcome = res?;

            if cli.json {
                write_json(&UpdateJson {
                    version: &outcome.plan.latest_version,
                    install_dir: &outcome.plan.install_dir,
                    downloaded_bytes: outcome.downloaded_bytes,
                    extracted_entries: outcome.extracted_entries,
                    warning: outcome.cleanup_warning.as_ref().map(|w| w.to_string()),
                })?;
            } else {
                crate::ui::print_update_outcome(&outcome, &ui_cfg);
            }
        }
        Commands::Report(args) => {
            let path = match args.path {
                Some(path) => path,
                None => crate::report::default_report_path(&current_dir()?),
            };
            let report = engine.load_report(&path)?;
            if cli.json {
                write_json(report.value())?;
            } else {
                crate::ui::print_report(&report, &ui_cfg);
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "depcheck-runner", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: use `depcheck-runner config --show`");
            }
        }
    }

    Ok(())
}

/// Merges CLI flags over the effective config. Flags win.
fn scan_config(
    cfg: &EffectiveConfig,
    args: &ScanArgs,
    timeout_secs: Option<u64>,
) -> Result<ScanConfig> {
    let install_dir = resolve_install_dir(cfg, args.install_dir.clone())?;
    let project = match &args.project {
        Some(project) => project.clone(),
        None => current_dir()?,
    };

    let mut config = ScanConfig::new(install_dir, project);
    config.project_name = cfg.scan.project_name.clone();
    config.output_format = args
        .format
        .clone()
        .unwrap_or_else(|| cfg.scan.output_format.clone());
    crate::scan::validate_output_format(&config.output_format)?;
    config.skip_self_update = if args.update {
        false
    } else if args.no_update {
        true
    } else {
        cfg.scan.skip_self_update
    };
    config.api_key = args
        .nvd_api_key
        .clone()
        .or_else(|| cfg.scan.nvd_api_key.clone());

    if let Some(secs) = timeout_secs {
        if secs == 0 {
            return Err(crate::exit::invalid_args(
                "--timeout must be greater than 0",
            ));
        }
        config.timeout = Some(Duration::from_secs(secs));
    }

    Ok(config)
}

fn resolve_install_dir(cfg: &EffectiveConfig, flag: Option<PathBuf>) -> Result<PathBuf> {
    flag.or_else(|| cfg.tool.install_dir.clone()).ok_or_else(|| {
        crate::exit::invalid_args(
            "Dependency-Check install directory is not set (use --install-dir, DEPCHECK_INSTALL_DIR, or [tool] install_dir)",
        )
    })
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("failed to resolve the current directory")
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (expected bash|zsh|fish)"
        ))),
    }
}
