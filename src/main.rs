use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use devhost::config::{
    DomainConfig, GlobalConfig, ProjectConfig, ProjectConfigBuilder, ServiceKind, DESCRIPTOR_FILE,
};
use devhost::docker::{ContainerRuntime, DockerManager, UnavailableRuntime};
use devhost::library::{TemplateLibrary, TemplateSource};
use devhost::paths::Paths;
use devhost::php::ActivationState;
use devhost::reconciler::{CheckReport, Reconciler, StartResult, StopResult};
use devhost::runner::{CommandRunner, CommandSpec, SystemRunner};
use devhost::{Issue, PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devhost", version, about = "Local development environments for PHP projects")]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short = 'C', long, global = true)]
    project: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the project (containers, PHP pool, vhosts, certificates, DNS)
    Start {
        /// Start every known project
        #[arg(long)]
        all: bool,
    },
    /// Stop the project and any shared service nobody else uses
    Stop {
        /// Stop every known project
        #[arg(long)]
        all: bool,
        /// Report what would change without changing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Stop then start
    Restart {
        #[arg(long)]
        all: bool,
    },
    /// Report the reconciled state without changing anything
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a project descriptor
    Init(InitArgs),
    /// Run a command defined in the descriptor
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Inspect the templates generators use
    Library {
        #[command(subcommand)]
        command: LibraryCommand,
    },
    /// PHP runtime settings
    Php {
        #[command(subcommand)]
        command: PhpCommand,
    },
}

#[derive(Args)]
struct InitArgs {
    /// Project name (default: directory name)
    #[arg(long)]
    name: Option<String>,
    /// Domain to serve; repeat for more (default: <name>.<tld>)
    #[arg(long = "domain")]
    domains: Vec<String>,
    /// PHP version
    #[arg(long)]
    php: Option<String>,
    /// Service as kind or kind=version; repeat for more
    #[arg(long = "service")]
    services: Vec<String>,
    /// Serve domains over plain HTTP only
    #[arg(long)]
    no_ssl: bool,
    /// Overwrite an existing descriptor
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum LibraryCommand {
    /// List templates and where each comes from
    List,
    /// Print a template
    Show { name: String },
}

#[derive(Subcommand)]
enum PhpCommand {
    /// Host-global settings file for one PHP version
    SystemIni {
        #[command(subcommand)]
        command: SystemIniCommand,
    },
}

#[derive(Subcommand)]
enum SystemIniCommand {
    /// Show owner, activation state and the manual commands
    Show { version: String },
    /// Activate the staged settings (requires elevated privilege)
    Enable { version: String },
    /// Deactivate the settings (requires elevated privilege)
    Disable { version: String },
    /// Forget the owner and staged settings
    Clear { version: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "devhost=debug" } else { "devhost=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!(name = PKG_NAME, version = VERSION, "devhost starting");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let paths = Paths::discover()?;

    match cli.command {
        Command::Library { command } => {
            library(&paths, command)?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Init(args) => {
            let global = GlobalConfig::load(&paths)?;
            return init(&project_dir, &global, args);
        }
        Command::Run { name, args } => {
            let config = load_project(&project_dir)?;
            return run_command(&config, &name, &args).await;
        }
        _ => {}
    }

    let global = GlobalConfig::load(&paths)?;
    let runner = Arc::new(SystemRunner::new(global.privilege()));
    let runtime: Arc<dyn ContainerRuntime> = match DockerManager::connect(global.docker_host.as_deref()) {
        Ok(docker) => Arc::new(docker),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Container runtime unavailable");
            Arc::new(UnavailableRuntime::new(&e))
        }
    };
    let runner: Arc<dyn CommandRunner> = runner;
    let reconciler = Reconciler::new(paths, global, runner, runtime)?;

    // Partial completion exits 0. Only a fatal validation or reconcile
    // error fails the command, including one project of an --all run.
    let ok = match cli.command {
        Command::Start { all: true } => report_starts(&reconciler.start_all().await?),
        Command::Start { all: false } => {
            let config = load_project(&project_dir)?;
            report_starts(&[reconciler.start(&config).await?])
        }
        Command::Stop { all: true, dry_run } => {
            report_stops(&reconciler.stop_all(dry_run).await?);
            true
        }
        Command::Stop { all: false, dry_run } => {
            let config = load_project(&project_dir)?;
            report_stops(&[reconciler.stop(&config, dry_run).await?]);
            true
        }
        Command::Restart { all: true } => report_starts(&reconciler.restart_all().await?),
        Command::Restart { all: false } => {
            let config = load_project(&project_dir)?;
            report_starts(&[reconciler.restart(&config).await?])
        }
        Command::Check { json } => {
            let config = match ProjectConfig::find(&project_dir) {
                Some(file) => Some(ProjectConfig::load(&file)?),
                None => None,
            };
            let report = reconciler.check(config.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_check(&report);
            }
            true
        }
        Command::Php {
            command: PhpCommand::SystemIni { command },
        } => {
            system_ini(&reconciler, command).await?;
            true
        }
        Command::Library { .. } | Command::Init(_) | Command::Run { .. } => true,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_project(dir: &Path) -> anyhow::Result<ProjectConfig> {
    let Some(file) = ProjectConfig::find(dir) else {
        bail!(
            "no {} found in {} or its parents; run `devhost init` first",
            DESCRIPTOR_FILE,
            dir.display()
        );
    };
    Ok(ProjectConfig::load(&file)?)
}

fn init(dir: &Path, global: &GlobalConfig, args: InitArgs) -> anyhow::Result<ExitCode> {
    let file = dir.join(DESCRIPTOR_FILE);
    if file.exists() && !args.force {
        bail!("{} already exists; pass --force to overwrite", file.display());
    }

    let dir = std::fs::canonicalize(dir).with_context(|| format!("cannot open {}", dir.display()))?;
    let name = match args.name {
        Some(name) => name,
        None => dir
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase().replace([' ', '.'], "-"))
            .context("cannot derive a project name; pass --name")?,
    };

    let mut builder = ProjectConfigBuilder::new(&name, dir.clone());
    if let Some(php) = &args.php {
        builder = builder.php(php);
    }
    let domains = if args.domains.is_empty() {
        vec![format!("{}.{}", name, global.tld)]
    } else {
        args.domains
    };
    for host in &domains {
        builder = builder.domain_config(DomainConfig::new(host).with_ssl(!args.no_ssl));
    }
    for service in &args.services {
        builder = match service.split_once('=') {
            Some((kind, version)) => builder.service(kind.parse::<ServiceKind>()?, version),
            None => builder.enable(service.parse::<ServiceKind>()?),
        };
    }

    let config = builder.build();
    let warnings = config.validate()?;
    std::fs::write(&file, config.to_toml()?).with_context(|| format!("cannot write {}", file.display()))?;

    println!("Wrote {}", file.display());
    print_issues("warning", &warnings);
    Ok(ExitCode::SUCCESS)
}

async fn run_command(config: &ProjectConfig, name: &str, args: &[String]) -> anyhow::Result<ExitCode> {
    let Some(command) = config.commands.get(name) else {
        let known: Vec<&str> = config.commands.keys().map(String::as_str).collect();
        bail!(
            "no command '{}' in {}; available: {}",
            name,
            DESCRIPTOR_FILE,
            if known.is_empty() { "none".to_string() } else { known.join(", ") }
        );
    };

    // Extra arguments reach the command line as "$@"
    let spec = CommandSpec::new("sh")
        .args(["-c".to_string(), format!("{} \"$@\"", command.run()), name.to_string()])
        .args(args.iter().cloned())
        .cwd(&config.path);
    let status = SystemRunner::new(None).run_interactive(&spec).await?;
    Ok(ExitCode::from(u8::try_from(status).unwrap_or(1)))
}

fn library(paths: &Paths, command: LibraryCommand) -> anyhow::Result<()> {
    let library = TemplateLibrary::new(paths);
    match command {
        LibraryCommand::List => {
            for entry in library.list() {
                match entry.source {
                    TemplateSource::Builtin => println!("{:<24} built-in", entry.name),
                    TemplateSource::Override(path) => {
                        println!("{:<24} {}", entry.name, path.display())
                    }
                }
            }
        }
        LibraryCommand::Show { name } => print!("{}", library.get(&name)?),
    }
    Ok(())
}

async fn system_ini(reconciler: &Reconciler, command: SystemIniCommand) -> anyhow::Result<()> {
    let arbiter = reconciler.system_ini();
    match command {
        SystemIniCommand::Show { version } => {
            match arbiter.current_owner(&version)? {
                Some(owner) => {
                    println!(
                        "PHP {} host-global settings owned by {} ({}), updated {}",
                        version,
                        owner.project_name,
                        owner.project_path.display(),
                        owner.updated_at.to_rfc3339()
                    );
                    for (name, value) in &owner.settings {
                        println!("  {} = {}", name, value);
                    }
                }
                None => println!("PHP {}: no project has claimed host-global settings", version),
            }
            let state = match arbiter.activation_state(&version) {
                ActivationState::Inactive => "inactive".to_string(),
                ActivationState::Active { stale: false } => "active".to_string(),
                ActivationState::Active { stale: true } => {
                    "active, out of date with staged settings".to_string()
                }
                ActivationState::Foreign { target } => format!(
                    "occupied by something else{}",
                    target.map(|t| format!(" ({})", t.display())).unwrap_or_default()
                ),
            };
            println!("Activation: {}", state);
            println!("Enable:  {}", arbiter.enable_command(&version));
            println!("Disable: {}", arbiter.disable_command(&version));
        }
        SystemIniCommand::Enable { version } => {
            reconciler.enable_system_ini(&version).await?;
            println!("Activated host-global settings for PHP {}", version);
        }
        SystemIniCommand::Disable { version } => {
            if reconciler.disable_system_ini(&version).await? {
                println!("Deactivated host-global settings for PHP {}", version);
            } else {
                println!("Host-global settings for PHP {} were not active", version);
            }
        }
        SystemIniCommand::Clear { version } => {
            if arbiter.clear(&version)? {
                println!("Cleared host-global settings ownership for PHP {}", version);
            } else {
                println!("Nothing to clear for PHP {}", version);
            }
        }
    }
    Ok(())
}

fn print_issues(label: &str, issues: &[Issue]) {
    for issue in issues {
        println!("  {} {}", label, issue);
    }
}

/// Print start results; false when any project was rejected outright
fn report_starts(results: &[StartResult]) -> bool {
    for result in results {
        let status = if result.aborted() {
            "not started"
        } else if result.has_errors() {
            "started with errors"
        } else {
            "started"
        };
        println!("{} (php {}): {}", result.project, result.php_version, status);
        for domain in &result.domains {
            println!("  domain  {}", domain);
        }
        for service in &result.services {
            println!("  service {} on 127.0.0.1:{}", service.service_name(), service.port);
        }
        print_issues("warning", &result.warnings);
        print_issues("error", &result.errors);
    }
    results.iter().all(|r| !r.aborted())
}

fn report_stops(results: &[StopResult]) {
    for result in results {
        let status = match (result.dry_run, result.has_errors()) {
            (true, _) => "would stop",
            (false, true) => "stopped with errors",
            (false, false) => "stopped",
        };
        println!("{}: {}", result.project, status);
        for path in &result.removed {
            println!("  remove  {}", path.display());
        }
        for service in &result.stopped_services {
            println!("  stop    {}", service);
        }
        for service in &result.kept_services {
            println!("  keep    {} (still used)", service);
        }
        print_issues("warning", &result.warnings);
        print_issues("error", &result.errors);
    }
}

fn print_check(report: &CheckReport) {
    if let Some(project) = &report.project {
        let state = match (project.materialized, project.drifted) {
            (false, _) => "not started",
            (true, true) => "started, descriptor changed since (restart to apply)",
            (true, false) => "started",
        };
        println!("{}: {}", project.name, state);
        for domain in &project.missing_certificates {
            println!("  missing certificate for {}", domain);
        }
    }

    let projects = if report.projects.is_empty() {
        "none".to_string()
    } else {
        report.projects.join(", ")
    };
    println!("Projects: {}", projects);
    for service in &report.services {
        let running = match service.running {
            Some(true) => "running",
            Some(false) => "stopped",
            None => "unknown",
        };
        println!(
            "  {:<20} 127.0.0.1:{:<6} {:<8} used by {}",
            service.service,
            service.port,
            running,
            service.users.join(", ")
        );
    }
    for ini in &report.system_ini {
        let owner = ini
            .owner
            .as_ref()
            .map_or("nobody".to_string(), |o| o.project_name.clone());
        println!(
            "PHP {} host-global settings: owner {}, {:?}",
            ini.php_version, owner, ini.activation
        );
    }
    print_issues("warning", &report.warnings);
    print_issues("error", &report.errors);
}
