mod auth;
mod config;
mod contact;
mod error;
mod etags;
mod remote;
mod repo;
mod sync;
mod vdir;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};

use auth::GoogleOAuth2;
use config::{Config, ConfigOverrides};
use contact::VCARD_EXTENSION;
use remote::google::GoogleApi;
use repo::{GitVaultRepo, SnapshotLog};
use sync::SyncEngine;

const APP_NAME: &str = "gcardvault";

/// Incrementally export Google Contacts as vCard files into a git-backed vault.
#[derive(Parser, Debug)]
#[command(name = "gcardvault", version, about, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download changed contacts and commit them to the vault
    Sync(UserArg),
    /// Authorize access to the account and save the token
    Login(UserArg),
    /// Authorize on this machine and print a token to paste into a headless one
    Authorize(UserArg),
    /// Create the configuration and output directories, then exit
    Noop(UserArg),
}

#[derive(Args, Debug)]
struct UserArg {
    /// Google account email address
    #[arg(value_name = "USER")]
    user: String,
}

#[derive(Args, Debug)]
struct Options {
    /// Write vCard files without creating or using a git repository
    #[arg(short = 'e', long, global = true)]
    export_only: bool,

    /// Remove files for contacts that no longer exist
    #[arg(short = 'f', long, global = true)]
    clean: bool,

    /// Configuration directory [default: ~/.gcardvault]
    #[arg(short = 'c', long, global = true, env = "GCARDVAULT_CONF_DIR", value_name = "DIR")]
    conf_dir: Option<PathBuf>,

    /// Output directory [default: ./gcardvault]
    #[arg(
        short = 'o',
        long,
        visible_alias = "vault-dir",
        global = true,
        env = "GCARDVAULT_OUTPUT_DIR",
        value_name = "DIR"
    )]
    output_dir: Option<PathBuf>,

    /// OAuth2 client id
    #[arg(long, global = true, env = "GCARDVAULT_CLIENT_ID", hide_env_values = true)]
    client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, global = true, env = "GCARDVAULT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logger(cli.options.verbose);

    match cli.command {
        Command::Sync(arg) => handle_sync(&load_config(&arg.user, cli.options)?),
        Command::Login(arg) => handle_login(&load_config(&arg.user, cli.options)?),
        Command::Authorize(arg) => handle_authorize(&load_config(&arg.user, cli.options)?),
        Command::Noop(arg) => {
            load_config(&arg.user, cli.options)?;
            Ok(())
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Resolve the configuration and create its directories.
fn load_config(user: &str, options: Options) -> Result<Config> {
    let config = config::load(ConfigOverrides {
        user: user.to_string(),
        conf_dir: options.conf_dir,
        output_dir: options.output_dir,
        client_id: options.client_id,
        client_secret: options.client_secret,
        export_only: options.export_only,
        clean: options.clean,
    })?;
    if config.user.is_empty() {
        anyhow::bail!("<user> argument must not be empty");
    }
    config.ensure_dirs()?;
    log::debug!(
        "conf dir {}, output dir {}",
        config.conf_dir.display(),
        config.output_dir.display()
    );
    Ok(config)
}

fn oauth(config: &Config) -> Result<GoogleOAuth2> {
    GoogleOAuth2::new(
        config.endpoints.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
    )
}

fn handle_sync(config: &Config) -> Result<()> {
    let (credentials, _) = oauth(config)?.get_credentials(&config.token_file_path(), &config.user)?;

    let mut repo = if config.export_only {
        None
    } else {
        Some(GitVaultRepo::open(APP_NAME, &config.output_dir, &[VCARD_EXTENSION])?)
    };
    if repo.as_ref().is_some_and(GitVaultRepo::is_dry_run) {
        log::debug!("repository in {} is not a vault, running as a dry run", config.output_dir.display());
    }

    let remote = GoogleApi::new(config.endpoints.clone())?;
    let mut engine = SyncEngine::new(
        config,
        &remote,
        repo.as_mut().map(|repo| repo as &mut dyn SnapshotLog),
    );
    let result = engine.sync(&credentials.token)?;

    log::info!(
        "sync finished: {} remote, {} saved, {} renamed, {} removed, {} committed",
        result.remote_count,
        result.saved_count,
        result.renamed_count,
        result.removed_count,
        result.committed_count
    );
    Ok(())
}

fn handle_login(config: &Config) -> Result<()> {
    oauth(config)?.authorize_and_save(&config.token_file_path(), &config.user)?;
    Ok(())
}

fn handle_authorize(config: &Config) -> Result<()> {
    oauth(config)?.authorize_and_export(&config.user)?;
    Ok(())
}
