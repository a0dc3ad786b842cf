mod config;
mod context;
mod engine;
mod error;
mod logging;
mod runner;
mod setup;
mod shell;
mod ssh;
mod uris;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use config::{resolve_config_path, Config, SaveOutcome};
use context::{DeploymentContext, Locality, TerminalPrompter};
use dialoguer::console::style;
use engine::{connect_engine, ContainerResolver, EngineTransport, LocalFiles, TunnelTransport};
use error::{ErrorDetails, IslectlError};
use runner::{render_command, run_on_session, runner_for, CommandRunner, Echo, ExecutionResult, LocalRunner};
use serde::Serialize;
use serde_json::json;
use shell::{shell_join, shell_quote};
use ssh::RemoteSession;
use std::env;
use std::path::PathBuf;
use std::process::Command;

const DEFAULT_SEQUEL_ACE_PATH: &str = "/Applications/Sequel Ace.app/Contents/MacOS/Sequel Ace";
const COMPOSE_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];
const COMPOSE_COMMANDS: &[&str] = &[
    "attach", "build", "commit", "config", "cp", "create", "down", "events", "exec", "export",
    "images", "kill", "logs", "ls", "pause", "port", "ps", "pull", "push", "restart", "rm", "run",
    "scale", "start", "stats", "stop", "top", "unpause", "up", "version", "wait", "watch", "-h",
    "--help",
];
const BACKUP_TABLES: &str = "cache,cache_*,watchdog";

#[derive(Parser, Debug)]
#[command(
    name = "islectl",
    version,
    about = "Manage ISLE docker compose sites on local and remote contexts"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Context to operate on instead of the current one.
    #[arg(long, global = true)]
    context: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run docker compose in the context's project directory.
    Compose {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Create a new ISLE site and register it as a context.
    Create {
        #[command(subcommand)]
        command: CreateCommand,
    },
    /// Run a command in a compose service (docker compose exec).
    Exec {
        service: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run drush in the drupal service.
    Drush {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print a one-time login link.
    Login {
        #[arg(long, default_value_t = 1)]
        uid: u32,
        #[arg(long)]
        uri: Option<String>,
    },
    Drupal {
        #[command(subcommand)]
        command: DrupalCommand,
    },
    /// Print the database URI and SSH tunnel parameters.
    DbUri,
    /// Open the site database in Sequel Ace (macOS only).
    Sequelace {
        #[arg(long, default_value = DEFAULT_SEQUEL_ACE_PATH)]
        sequel_ace_path: String,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    View,
    CurrentContext,
    GetContexts,
    /// Create or update a context. Only the flags given are changed.
    SetContext(SetContextArgs),
    UseContext {
        name: String,
    },
    DeleteContext {
        name: String,
    },
}

#[derive(Args, Debug, Default)]
struct SetContextArgs {
    name: String,
    #[command(flatten)]
    flags: ContextFlags,
    /// Make this the current context.
    #[arg(long)]
    default: bool,
    /// The site already runs on the remote host; changes the prompt wording.
    #[arg(long)]
    existing_site: bool,
}

#[derive(Subcommand, Debug)]
enum CreateCommand {
    /// Download and run the ISLE site template installer, then save the context.
    Context(CreateContextArgs),
}

#[derive(Args, Debug)]
struct CreateContextArgs {
    name: String,
    #[command(flatten)]
    flags: ContextFlags,
    /// isle-buildkit tag to install.
    #[arg(long, default_value = "main")]
    buildkit_tag: String,
    /// Starter site branch to install.
    #[arg(long, default_value = "main")]
    starter_site: String,
    /// Skip prompts and confirmation.
    #[arg(long)]
    yes: bool,
    #[arg(long)]
    default: bool,
}

#[derive(Args, Debug, Default)]
struct ContextFlags {
    #[arg(long = "type", value_enum)]
    locality: Option<Locality>,
    #[arg(long)]
    docker_socket: Option<String>,
    #[arg(long)]
    project_name: Option<String>,
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    project_dir: Option<String>,
    #[arg(long)]
    site: Option<String>,
    #[arg(long)]
    env_file: Vec<String>,
    #[arg(long)]
    sudo: Option<bool>,
    #[arg(long)]
    ssh_hostname: Option<String>,
    #[arg(long)]
    ssh_port: Option<u16>,
    #[arg(long)]
    ssh_user: Option<String>,
    #[arg(long)]
    ssh_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum DrupalCommand {
    /// Run a command in the drupal container (default: bash).
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Dump the site database inside the drupal container.
    Backup {
        #[arg(long)]
        result_file: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone)]
struct App {
    config_path: PathBuf,
    context: Option<String>,
    json: bool,
}

fn main() -> Result<(), IslectlError> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);
    let app = App {
        config_path: resolve_config_path(cli.config.as_ref()),
        context: cli.context.clone(),
        json: cli.json,
    };
    tracing::debug!(config = %app.config_path.display(), "loaded cli");

    let result = match cli.command {
        Commands::Config { command } => handle_config(&app, command),
        Commands::Compose { args } => handle_compose(&app, &args),
        Commands::Create {
            command: CreateCommand::Context(args),
        } => handle_create_context(&app, args),
        Commands::Exec { service, command } => handle_exec(&app, &service, &command),
        Commands::Drush { args } => handle_drush(&app, &args),
        Commands::Login { uid, uri } => handle_login(&app, uid, uri.as_deref()),
        Commands::Drupal { command } => handle_drupal(&app, command),
        Commands::DbUri => handle_db_uri(&app),
        Commands::Sequelace { sequel_ace_path } => handle_sequelace(&app, &sequel_ace_path),
        Commands::Doctor => handle_doctor(&app),
    };

    if let Err(err) = result {
        if app.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(err.details()),
            };
            print_json(&payload)?;
        } else {
            let message = err.to_string();
            eprintln!("{} {message}", style("error:").red().bold());
            if let Some(hint) = err.hint().filter(|hint| !message.contains(hint.as_str())) {
                eprintln!("{} {hint}", style("hint:").yellow());
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn load_context(app: &App) -> Result<DeploymentContext, IslectlError> {
    let cfg = Config::load(&app.config_path)?;
    let ctx = cfg.context(app.context.as_deref())?;
    ctx.validate()?;
    tracing::debug!(context = %ctx.name, locality = %ctx.locality, "using context");
    Ok(ctx)
}

fn handle_config(app: &App, command: ConfigCommand) -> Result<(), IslectlError> {
    match command {
        ConfigCommand::View => {
            let cfg = Config::load(&app.config_path)?;
            if app.json {
                return output(app, serde_json::to_value(&cfg)?, "");
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
        ConfigCommand::CurrentContext => {
            let cfg = Config::load(&app.config_path)?;
            if cfg.current_context.is_empty() {
                return Err(IslectlError::Config(
                    "no current context set. Have you run `islectl config set-context`?".to_string(),
                ));
            }
            output(
                app,
                json!({ "current_context": cfg.current_context }),
                &cfg.current_context,
            )
        }
        ConfigCommand::GetContexts => {
            let cfg = Config::load(&app.config_path)?;
            if app.json {
                let contexts: Vec<serde_json::Value> = cfg
                    .contexts
                    .iter()
                    .map(|ctx| {
                        json!({
                            "name": ctx.name,
                            "type": ctx.locality,
                            "profile": ctx.profile,
                            "project_dir": ctx.project_dir,
                            "current": ctx.name == cfg.current_context,
                        })
                    })
                    .collect();
                return output(app, json!({ "contexts": contexts }), "");
            }
            println!("{:<8} {:<20} {:<8} {:<10} PROJECT-DIR", "CURRENT", "NAME", "TYPE", "PROFILE");
            for ctx in &cfg.contexts {
                let marker = if ctx.name == cfg.current_context { "*" } else { "" };
                println!(
                    "{:<8} {:<20} {:<8} {:<10} {}",
                    marker, ctx.name, ctx.locality, ctx.profile, ctx.project_dir
                );
            }
            Ok(())
        }
        ConfigCommand::SetContext(args) => handle_set_context(app, args),
        ConfigCommand::UseContext { name } => {
            let mut cfg = Config::load(&app.config_path)?;
            cfg.use_context(&name)?;
            cfg.save(&app.config_path)?;
            output(
                app,
                json!({ "current_context": name }),
                &format!("Switched to context: {name}"),
            )
        }
        ConfigCommand::DeleteContext { name } => {
            let mut cfg = Config::load(&app.config_path)?;
            cfg.delete_context(&name)?;
            cfg.save(&app.config_path)?;
            output(
                app,
                json!({ "deleted": name }),
                &format!("Deleted context: {name}"),
            )
        }
    }
}

/// Starts from the stored context (or a fresh one) and applies only the
/// flags the operator passed.
fn apply_context_flags(existing: Option<&DeploymentContext>, name: &str, args: ContextFlags) -> DeploymentContext {
    let mut ctx = match existing {
        Some(existing) => existing.clone(),
        None => DeploymentContext {
            name: name.to_string(),
            project_dir: env::current_dir()
                .map(|dir| dir.to_string_lossy().to_string())
                .unwrap_or_default(),
            ..DeploymentContext::default()
        },
    };
    if let Some(locality) = args.locality {
        ctx.locality = locality;
    }
    let overrides = [
        (args.docker_socket, &mut ctx.docker_socket),
        (args.project_name, &mut ctx.project_name),
        (args.profile, &mut ctx.profile),
        (args.project_dir, &mut ctx.project_dir),
        (args.site, &mut ctx.site),
        (args.ssh_hostname, &mut ctx.ssh_hostname),
        (args.ssh_user, &mut ctx.ssh_user),
        (args.ssh_key, &mut ctx.ssh_key_path),
    ];
    for (value, field) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    if !args.env_file.is_empty() {
        ctx.env_file = args.env_file;
    }
    if let Some(sudo) = args.sudo {
        ctx.sudo = sudo;
    }
    if let Some(port) = args.ssh_port {
        ctx.ssh_port = port;
    }
    if !ctx.is_remote() {
        ctx.ssh_key_path.clear();
    }
    ctx
}

fn handle_set_context(app: &App, args: SetContextArgs) -> Result<(), IslectlError> {
    let mut cfg = Config::load(&app.config_path)?;
    let set_default = args.default;
    let existing_site = args.existing_site;
    let mut ctx = apply_context_flags(cfg.find(&args.name), &args.name, args.flags);

    let dir_checked = if ctx.is_remote() {
        let verification = context::verify_remote_context(
            &mut ctx,
            &cfg.placeholders,
            existing_site,
            &TerminalPrompter,
            |candidate| RemoteSession::open(candidate).map(|_| ()),
        )?;
        if verification.prompted {
            tracing::info!(context = %ctx.name, "remote context updated from prompts");
        }
        verification.tested_ssh
    } else {
        match engine::find_local_socket(&ctx.docker_socket) {
            Ok(socket) => ctx.docker_socket = socket,
            Err(err) => tracing::warn!(err = %err, "keeping configured docker socket"),
        }
        true
    };
    if dir_checked && !context_project_dir_exists(&ctx)? {
        tracing::warn!(project_dir = %ctx.project_dir, context = %ctx.name, "project directory does not exist");
    }

    let name = ctx.name.clone();
    let outcome = cfg.save_context(ctx, set_default)?;
    cfg.save(&app.config_path)?;
    let action = match outcome {
        SaveOutcome::Added => "added",
        SaveOutcome::Updated => "updated",
    };
    let message = match outcome {
        SaveOutcome::Added => format!("Added new context: {name}"),
        SaveOutcome::Updated => format!("Updated context: {name}"),
    };
    output(
        app,
        json!({
            "context": name,
            "action": action,
            "current": cfg.current_context == name,
        }),
        &message,
    )
}

fn context_project_dir_exists(ctx: &DeploymentContext) -> Result<bool, IslectlError> {
    if ctx.is_remote() {
        let session = RemoteSession::open(ctx)?;
        return session.path_exists(ctx.project_dir());
    }
    Ok(ctx.project_dir().exists())
}

fn ensure_local_compose_file(ctx: &DeploymentContext) -> Result<(), IslectlError> {
    if ctx.is_remote() {
        return Ok(());
    }
    if COMPOSE_FILES
        .iter()
        .any(|file| ctx.project_dir().join(file).exists())
    {
        return Ok(());
    }
    Err(IslectlError::Config(format!(
        "docker-compose.yml not found in {}",
        ctx.project_dir().display()
    )))
}

fn compose_prefix(ctx: &DeploymentContext) -> Vec<String> {
    let mut argv = vec!["docker".to_string(), "compose".to_string()];
    if !ctx.profile.is_empty() {
        argv.push("--profile".to_string());
        argv.push(ctx.profile.clone());
    }
    for env_file in &ctx.env_file {
        argv.push("--env-file".to_string());
        argv.push(env_file.clone());
    }
    argv
}

fn compose_argv(ctx: &DeploymentContext, args: &[String]) -> Result<Vec<String>, IslectlError> {
    let subcommand = args
        .first()
        .ok_or_else(|| IslectlError::Config("missing docker compose command".to_string()))?;
    if !COMPOSE_COMMANDS.contains(&subcommand.as_str()) {
        return Err(IslectlError::Config(format!(
            "unknown docker compose command: {subcommand}"
        )));
    }
    let has = |flag: &str| args.iter().any(|arg| arg == flag);
    let mut argv = compose_prefix(ctx);
    argv.extend(args.iter().cloned());
    if subcommand == "up" && !has("-d") && !has("--detach") {
        argv.push("-d".to_string());
        argv.push("--remove-orphans".to_string());
    }
    if subcommand == "build" && !has("--pull") {
        argv.push("--pull".to_string());
    }
    Ok(argv)
}

fn drush_argv(ctx: &DeploymentContext, args: &[String]) -> Vec<String> {
    let has_uri = args
        .iter()
        .any(|arg| arg == "--uri" || arg == "-l" || arg.starts_with("--uri="));
    let mut script = "drush".to_string();
    if !has_uri {
        script.push_str(" --uri $DRUPAL_DRUSH_URI");
    }
    if !args.is_empty() {
        script.push(' ');
        script.push_str(&shell_join(args));
    }
    vec![
        "docker".to_string(),
        "compose".to_string(),
        "exec".to_string(),
        ctx.compose_service("drupal"),
        "bash".to_string(),
        "-c".to_string(),
        script,
    ]
}

fn login_argv(ctx: &DeploymentContext, uid: u32, uri: Option<&str>) -> Vec<String> {
    let uri = uri
        .map(shell_quote)
        .unwrap_or_else(|| "$DRUPAL_DRUSH_URI".to_string());
    let mut argv = compose_prefix(ctx);
    argv.extend([
        "exec".to_string(),
        ctx.compose_service("drupal"),
        "bash".to_string(),
        "-c".to_string(),
        format!("drush uli --uri={uri} --uid={uid}"),
    ]);
    argv
}

fn service_exec_argv(ctx: &DeploymentContext, service: &str, command: &[String]) -> Vec<String> {
    let mut argv = compose_prefix(ctx);
    argv.push("exec".to_string());
    argv.push(ctx.compose_service(service));
    argv.extend(command.iter().cloned());
    argv
}

fn drupal_exec_argv(container: &str, args: &[String]) -> Vec<String> {
    let mut argv = vec!["docker".to_string(), "exec".to_string(), "-i".to_string(), container.to_string()];
    if args.is_empty() {
        argv.push("bash".to_string());
    } else {
        argv.extend(args.iter().cloned());
    }
    argv
}

fn backup_result_file(site: &str, now: DateTime<Utc>) -> String {
    format!("/tmp/{}-{}.sql.gz", site, now.format("%Y%m%d-%H%M%S"))
}

fn backup_argv(container: &str, result_file: &str) -> Vec<String> {
    vec![
        "docker".to_string(),
        "exec".to_string(),
        container.to_string(),
        "drush".to_string(),
        "sql-dump".to_string(),
        "-y".to_string(),
        format!("--skip-tables-list={BACKUP_TABLES}"),
        format!("--structure-tables-list={BACKUP_TABLES}"),
        "--debug".to_string(),
        "--gzip".to_string(),
        format!("--result-file={result_file}"),
    ]
}

fn run_passthrough(app: &App, ctx: &DeploymentContext, argv: &[String]) -> Result<ExecutionResult, IslectlError> {
    tracing::info!(context = %ctx.name, cmd = %render_command(argv), "running");
    let result = runner_for(ctx, Echo::for_json(app.json)).run(argv)?;
    if app.json {
        print_json(&JsonResult {
            ok: true,
            result: Some(json!({ "command": render_command(argv), "output": result.output })),
            error: None,
            error_details: None,
        })?;
    }
    Ok(result)
}

fn handle_compose(app: &App, args: &[String]) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    let argv = compose_argv(&ctx, args)?;
    ensure_local_compose_file(&ctx)?;
    run_passthrough(app, &ctx, &argv).map(|_| ())
}

fn handle_exec(app: &App, service: &str, command: &[String]) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    ensure_local_compose_file(&ctx)?;
    run_passthrough(app, &ctx, &service_exec_argv(&ctx, service, command)).map(|_| ())
}

fn handle_create_context(app: &App, args: CreateContextArgs) -> Result<(), IslectlError> {
    let mut cfg = Config::load(&app.config_path)?;
    if args.name.trim().is_empty() {
        return Err(IslectlError::Config("context name must not be empty".to_string()));
    }
    if cfg.find(&args.name).is_some() {
        return Err(IslectlError::Config(format!(
            "context '{}' already exists; use `islectl config set-context` to change it",
            args.name
        )));
    }
    let mut ctx = apply_context_flags(None, &args.name, args.flags);
    if ctx.is_remote() && !args.yes {
        context::verify_remote_context(
            &mut ctx,
            &cfg.placeholders,
            false,
            &TerminalPrompter,
            |candidate| RemoteSession::open(candidate).map(|_| ()),
        )?;
    }
    ctx.validate()?;
    if context_project_dir_exists(&ctx)? {
        return Err(IslectlError::Config(format!(
            "project directory {} already exists; choose a new --project-dir",
            ctx.project_dir
        )));
    }

    let options = setup::SiteOptions {
        buildkit_tag: args.buildkit_tag,
        starter_site: args.starter_site,
    };
    let flags = options.flags(&ctx);
    if !app.json {
        println!("\nHere is the context that will be created");
        print!("{}", serde_yaml::to_string(&ctx)?);
        println!("\nAnd these buildkit/starter site flags");
        for flag in &flags {
            println!("{flag}");
        }
    }
    if !args.yes {
        let proceed = dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .with_prompt("Are you sure you want to proceed creating the site?")
            .default(false)
            .interact()?;
        if !proceed {
            return Err(IslectlError::Config("cancelling install operation".to_string()));
        }
    }

    let script = setup::setup_script_path();
    setup::download_setup_script(setup::SETUP_SCRIPT_URL, &script)?;
    let echo = Echo::for_json(app.json);
    let installed = setup::install_site(&ctx, &options, &setup::ContextHost::new(&ctx, echo), &script);
    if let Err(err) = std::fs::remove_file(&script) {
        tracing::debug!(file = %script.display(), err = %err, "leaving setup script behind");
    }
    installed?;

    let name = ctx.name.clone();
    cfg.save_context(ctx, args.default)?;
    cfg.save(&app.config_path)?;
    output(
        app,
        json!({
            "context": name,
            "action": "created",
            "flags": flags,
            "current": cfg.current_context == name,
        }),
        &format!("Site created! You may want to run `islectl compose up --context {name}`"),
    )
}

fn handle_drush(app: &App, args: &[String]) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    run_passthrough(app, &ctx, &drush_argv(&ctx, args)).map(|_| ())
}

fn handle_login(app: &App, uid: u32, uri: Option<&str>) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    let argv = login_argv(&ctx, uid, uri);
    let result = runner_for(&ctx, Echo::for_json(app.json)).run(&argv)?;
    let link = result.last_non_empty_line().ok_or_else(|| IslectlError::Command {
        command: render_command(&argv),
        cause: "drush uli printed no login link".to_string(),
        output: result.output.clone(),
    })?;
    output(app, json!({ "url": link, "uid": uid }), &format!("Login link: {link}"))
}

/// Resolves `service` to its running container, then runs the command built
/// from the container name over the same connection.
fn run_in_service<F>(
    ctx: &DeploymentContext,
    service: &str,
    echo: Echo,
    build: F,
) -> Result<ExecutionResult, IslectlError>
where
    F: FnOnce(&str) -> Vec<String>,
{
    if ctx.is_remote() {
        let session = RemoteSession::open(ctx)?;
        let engine = TunnelTransport::new(&session, &ctx.docker_socket);
        let resolver = ContainerResolver::new(ctx, &engine, &session);
        let resolved = resolver.resolve_container(service, false)?;
        tracing::debug!(service = %resolved.service, container = %resolved.container, "running in service");
        run_on_session(ctx, &session, &build(&resolved.container), echo)
    } else {
        let engine = connect_engine(ctx, None)?;
        let resolver = ContainerResolver::new(ctx, engine.as_ref(), &LocalFiles);
        let resolved = resolver.resolve_container(service, false)?;
        tracing::debug!(service = %resolved.service, container = %resolved.container, "running in service");
        LocalRunner::new(ctx, echo).run(&build(&resolved.container))
    }
}

fn handle_drupal(app: &App, command: DrupalCommand) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    match command {
        DrupalCommand::Exec { args } => {
            ensure_local_compose_file(&ctx)?;
            let echo = Echo::for_json(app.json);
            let result = run_in_service(&ctx, "drupal", echo, |container| drupal_exec_argv(container, &args))?;
            if app.json {
                return output(app, json!({ "output": result.output }), "");
            }
            Ok(())
        }
        DrupalCommand::Backup { result_file } => {
            let result_file = result_file.unwrap_or_else(|| backup_result_file(&ctx.site, Utc::now()));
            let mut used_container = String::new();
            run_in_service(&ctx, "drupal", Echo::for_json(app.json), |container| {
                used_container = container.to_string();
                backup_argv(container, &result_file)
            })?;
            output(
                app,
                json!({ "container": used_container, "result_file": result_file }),
                &format!("Database dump written to {result_file} in {used_container}"),
            )
        }
    }
}

fn handle_db_uri(app: &App) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    let uris = uris::build_database_uris(&ctx)?;
    output(
        app,
        json!({
            "database_uri": uris.database_uri,
            "tunnel_params": uris.tunnel_params,
            "combined": uris.combined(),
        }),
        &format!("{}\n{}", uris.database_uri, uris.tunnel_params),
    )
}

fn handle_sequelace(app: &App, sequel_ace_path: &str) -> Result<(), IslectlError> {
    if !cfg!(target_os = "macos") {
        return Err(IslectlError::Config(
            "sequelace is only supported on macOS".to_string(),
        ));
    }
    let ctx = load_context(app)?;
    let uris = uris::build_database_uris(&ctx)?;
    let argv = vec![
        "open".to_string(),
        uris.combined(),
        "-a".to_string(),
        sequel_ace_path.to_string(),
    ];
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .map_err(|err| IslectlError::Command {
            command: "open -a Sequel Ace".to_string(),
            cause: format!("could not open Sequel Ace: {err}"),
            output: Vec::new(),
        })?;
    if !status.success() {
        return Err(IslectlError::Command {
            command: "open -a Sequel Ace".to_string(),
            cause: status.to_string(),
            output: Vec::new(),
        });
    }
    output(app, json!({ "opened": true }), "")
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    message: String,
}

fn doctor_check(id: &str, ok: bool, message: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        message: message.into(),
    }
}

fn collect_local_checks(ctx: &DeploymentContext) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    match which::which("docker") {
        Ok(path) => checks.push(doctor_check("docker_binary", true, path.display().to_string())),
        Err(err) => checks.push(doctor_check("docker_binary", false, format!("docker not found on PATH: {err}"))),
    }
    match connect_engine(ctx, None) {
        Ok(engine) => checks.push(ping_check(engine.as_ref())),
        Err(err) => checks.push(doctor_check("docker_socket", false, err.to_string())),
    }
    checks.push(project_dir_check(ctx, ctx.project_dir().exists()));
    checks.push(match ensure_local_compose_file(ctx) {
        Ok(()) => doctor_check("compose_file", true, "compose file present"),
        Err(err) => doctor_check("compose_file", false, err.to_string()),
    });
    checks
}

fn collect_remote_checks(ctx: &DeploymentContext) -> Vec<DoctorCheck> {
    let session = match RemoteSession::open(ctx) {
        Ok(session) => session,
        Err(err) => return vec![doctor_check("ssh", false, err.to_string())],
    };
    let mut checks = vec![doctor_check(
        "ssh",
        true,
        format!("connected to {} as {}", session.host(), ctx.ssh_user),
    )];
    checks.push(match session.exec_capture("command -v docker") {
        Ok((0, path)) => doctor_check("docker_binary", true, path.trim().to_string()),
        Ok((status, _)) => doctor_check("docker_binary", false, format!("docker not found on remote PATH (exit {status})")),
        Err(err) => doctor_check("docker_binary", false, err.to_string()),
    });
    checks.push(ping_check(&TunnelTransport::new(&session, &ctx.docker_socket)));
    checks.push(match session.path_exists(ctx.project_dir()) {
        Ok(exists) => project_dir_check(ctx, exists),
        Err(err) => doctor_check("project_dir", false, err.to_string()),
    });
    checks
}

fn ping_check(engine: &dyn EngineTransport) -> DoctorCheck {
    match engine.round_trip("GET", "/_ping") {
        Ok(response) if response.status == 200 => {
            let message = match response.headers.get("api-version") {
                Some(version) => format!("{} reachable (API {version})", engine.describe()),
                None => format!("{} reachable", engine.describe()),
            };
            doctor_check("docker_socket", true, message)
        }
        Ok(response) => doctor_check(
            "docker_socket",
            false,
            format!("{} answered HTTP {}", engine.describe(), response.status),
        ),
        Err(err) => doctor_check("docker_socket", false, err.to_string()),
    }
}

fn project_dir_check(ctx: &DeploymentContext, exists: bool) -> DoctorCheck {
    let message = if exists {
        format!("{} exists", ctx.project_dir)
    } else {
        format!("{} does not exist", ctx.project_dir)
    };
    doctor_check("project_dir", exists, message)
}

fn handle_doctor(app: &App) -> Result<(), IslectlError> {
    let ctx = load_context(app)?;
    let checks = if ctx.is_remote() {
        collect_remote_checks(&ctx)
    } else {
        collect_local_checks(&ctx)
    };
    let failed = checks.iter().find(|check| !check.ok).cloned();

    if app.json {
        print_json(&JsonResult {
            ok: failed.is_none(),
            result: Some(json!({ "context": ctx.name, "checks": checks })),
            error: failed.as_ref().map(|check| check.message.clone()),
            error_details: None,
        })?;
        if failed.is_some() {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok {
            style("ok").green()
        } else {
            style("fail").red()
        };
        println!("[{}] {} - {}", state, check.id, check.message);
    }
    match failed {
        Some(check) => Err(IslectlError::Config(format!(
            "doctor check '{}' failed: {}",
            check.id, check.message
        ))),
        None => Ok(()),
    }
}

fn output(app: &App, payload: serde_json::Value, human: &str) -> Result<(), IslectlError> {
    if app.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else if !human.is_empty() {
        println!("{human}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), IslectlError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn context() -> DeploymentContext {
        DeploymentContext {
            name: "prod".to_string(),
            project_name: "site".to_string(),
            profile: "prod".to_string(),
            project_dir: "/opt/site".to_string(),
            env_file: vec![".env.prod".to_string()],
            ..DeploymentContext::default()
        }
    }

    #[test]
    fn compose_up_is_detached_by_default() {
        let argv = compose_argv(&context(), &args(&["up"])).unwrap();
        assert_eq!(
            argv,
            args(&[
                "docker", "compose", "--profile", "prod", "--env-file", ".env.prod", "up", "-d",
                "--remove-orphans"
            ])
        );
        let argv = compose_argv(&context(), &args(&["up", "--detach"])).unwrap();
        assert!(!argv.contains(&"--remove-orphans".to_string()));
    }

    #[test]
    fn compose_build_pulls_once() {
        let argv = compose_argv(&context(), &args(&["build", "--pull"])).unwrap();
        assert_eq!(argv.iter().filter(|arg| *arg == "--pull").count(), 1);
        let argv = compose_argv(&context(), &args(&["build"])).unwrap();
        assert_eq!(argv.last().map(String::as_str), Some("--pull"));
    }

    #[test]
    fn compose_rejects_unknown_or_missing_subcommand() {
        assert!(compose_argv(&context(), &args(&["frobnicate"])).is_err());
        assert!(compose_argv(&context(), &[]).is_err());
    }

    #[test]
    fn compose_skips_profile_flag_when_unset() {
        let mut ctx = context();
        ctx.profile.clear();
        ctx.env_file.clear();
        assert_eq!(
            compose_argv(&ctx, &args(&["ps"])).unwrap(),
            args(&["docker", "compose", "ps"])
        );
    }

    #[test]
    fn drush_injects_uri_unless_given() {
        let argv = drush_argv(&context(), &args(&["sqlq", "SHOW TABLES"]));
        assert_eq!(
            argv,
            args(&[
                "docker",
                "compose",
                "exec",
                "drupal-prod",
                "bash",
                "-c",
                "drush --uri $DRUPAL_DRUSH_URI sqlq 'SHOW TABLES'"
            ])
        );
        let argv = drush_argv(&context(), &args(&["-l", "https://x.org", "cr"]));
        assert_eq!(argv.last().map(String::as_str), Some("drush -l https://x.org cr"));
    }

    #[test]
    fn login_defaults_to_site_uri() {
        let argv = login_argv(&context(), 1, None);
        assert_eq!(
            argv.last().map(String::as_str),
            Some("drush uli --uri=$DRUPAL_DRUSH_URI --uid=1")
        );
        let argv = login_argv(&context(), 2, Some("https://example.com/a b"));
        assert_eq!(
            argv.last().map(String::as_str),
            Some("drush uli --uri='https://example.com/a b' --uid=2")
        );
        assert_eq!(argv[..4], args(&["docker", "compose", "--profile", "prod"])[..]);
    }

    #[test]
    fn drupal_exec_defaults_to_bash() {
        assert_eq!(
            drupal_exec_argv("site-drupal-prod-1", &[]),
            args(&["docker", "exec", "-i", "site-drupal-prod-1", "bash"])
        );
        assert_eq!(
            drupal_exec_argv("site-drupal-prod-1", &args(&["ls", "-la"])),
            args(&["docker", "exec", "-i", "site-drupal-prod-1", "ls", "-la"])
        );
    }

    #[test]
    fn service_exec_targets_profiled_service() {
        assert_eq!(
            service_exec_argv(&context(), "solr", &args(&["ls", "-la", "/opt/solr"])),
            args(&[
                "docker", "compose", "--profile", "prod", "--env-file", ".env.prod", "exec", "solr-prod",
                "ls", "-la", "/opt/solr"
            ])
        );
    }

    #[test]
    fn exec_requires_a_command_after_the_service() {
        assert!(Cli::try_parse_from(["islectl", "exec", "drupal"]).is_err());
        let cli = Cli::try_parse_from(["islectl", "exec", "drupal", "drush", "-y", "cr"]).unwrap();
        match cli.command {
            Commands::Exec { service, command } => {
                assert_eq!(service, "drupal");
                assert_eq!(command, args(&["drush", "-y", "cr"]));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn create_context_defaults_to_main_branches() {
        let cli = Cli::try_parse_from([
            "islectl",
            "create",
            "context",
            "dev",
            "--project-dir",
            "/home/x/new-site",
            "--yes",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                command: CreateCommand::Context(create),
            } => {
                assert_eq!(create.name, "dev");
                assert_eq!(create.buildkit_tag, "main");
                assert_eq!(create.starter_site, "main");
                assert!(create.yes);
                assert_eq!(create.flags.project_dir.as_deref(), Some("/home/x/new-site"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn backup_dumps_to_timestamped_file() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let file = backup_result_file("default", now);
        assert_eq!(file, "/tmp/default-20250304-050607.sql.gz");
        let argv = backup_argv("site-drupal-prod-1", &file);
        assert_eq!(&argv[..5], &args(&["docker", "exec", "site-drupal-prod-1", "drush", "sql-dump"])[..]);
        assert!(argv.contains(&"--skip-tables-list=cache,cache_*,watchdog".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("--result-file=/tmp/default-20250304-050607.sql.gz"));
    }

    #[test]
    fn set_context_only_changes_given_flags() {
        let existing = context();
        let updated = apply_context_flags(
            Some(&existing),
            "prod",
            ContextFlags {
                profile: Some("staging".to_string()),
                sudo: Some(true),
                ..ContextFlags::default()
            },
        );
        assert_eq!(updated.profile, "staging");
        assert!(updated.sudo);
        assert_eq!(updated.project_dir, existing.project_dir);
        assert_eq!(updated.env_file, existing.env_file);
    }

    #[test]
    fn new_remote_context_keeps_placeholders_for_prompting() {
        let ctx = apply_context_flags(
            None,
            "prod",
            ContextFlags {
                locality: Some(Locality::Remote),
                ..ContextFlags::default()
            },
        );
        assert!(ctx.is_remote());
        assert_eq!(ctx.name, "prod");
        let pending = context::pending_remote_inputs(&ctx, &context::Placeholders::default());
        assert_eq!(pending.first(), Some(&context::ContextField::SshHostname));
    }

    #[test]
    fn local_context_drops_ssh_key() {
        let ctx = apply_context_flags(
            None,
            "dev",
            ContextFlags {
                ssh_key: Some("/home/x/.ssh/id_rsa".to_string()),
                ..ContextFlags::default()
            },
        );
        assert!(ctx.ssh_key_path.is_empty());
    }

    #[test]
    fn missing_compose_file_is_reported_for_local_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context();
        ctx.project_dir = dir.path().to_string_lossy().to_string();
        assert!(ensure_local_compose_file(&ctx).is_err());
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        assert!(ensure_local_compose_file(&ctx).is_ok());
        assert!(context_project_dir_exists(&ctx).unwrap());
    }

    #[test]
    fn cli_keeps_passthrough_flags() {
        let cli = Cli::try_parse_from(["islectl", "--context", "prod", "drush", "uli", "--uid=2"]).unwrap();
        assert_eq!(cli.context.as_deref(), Some("prod"));
        match cli.command {
            Commands::Drush { args: passed } => assert_eq!(passed, args(&["uli", "--uid=2"])),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
