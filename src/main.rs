use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, LevelFilter};

use speck::{
    auth::{AuthManager, SystemBrowser, TokenEndpoint},
    config::Config,
    signal,
    store::FileStore,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// TOML file overriding any of the built-in settings.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<String>,

    /// Credential store directory
    ///
    /// Ensure that this directory is kept private, as it contains tokens
    /// that grant access to your account.
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value_t = String::from(".speck"))]
    store: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Subcommand)]
enum Command {
    /// Log in through the browser
    Login {
        /// Seconds to wait for the browser to come back
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },

    /// Erase the stored credential
    Logout,

    /// Show whether a credential is stored and when it expires
    Status,

    /// Refresh the stored credential if it is about to expire
    Refresh,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("speck", level);
    }

    logger.init();
}

/// Runs the requested command.
///
/// # Errors
///
/// Returns an error when the configuration or store cannot be opened, when
/// the command itself fails, or when interrupted by a signal.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let store = Arc::new(FileStore::new(&args.store)?);
    let exchanger = Arc::new(TokenEndpoint::new(&config)?);
    let auth = AuthManager::new(config, store, exchanger, Arc::new(SystemBrowser));

    match args.command {
        Command::Login { timeout } => {
            let timeout = timeout.map_or(auth.config().listener_timeout, Duration::from_secs);
            let mut signals = signal::Handler::new()?;

            tokio::select! {
                biased;

                signal = signals.recv() => {
                    // Dropping the attempt releases the redirect port.
                    info!("received {signal}; login aborted");
                    return Err(format!("interrupted by {signal}").into());
                }

                result = auth.authorize_with_timeout(timeout) => result?,
            }

            if let Some(expires_at) = auth.expires_at() {
                let expires_at = time_left(expires_at);
                info!("logged in; access token valid for {expires_at}");
            }
        }

        Command::Logout => {
            auth.deauthorize()?;
        }

        Command::Status => {
            if auth.expires_at().is_none() {
                println!("not logged in");
            } else if auth.is_authorized() {
                let expires_at = auth.expires_at().map(time_left).unwrap_or_default();
                println!("logged in; access token valid for {expires_at}");
                println!("scopes: {}", auth.scopes().into_iter().collect::<Vec<_>>().join(" "));
            } else {
                println!("logged in; access token expired");
            }
        }

        Command::Refresh => {
            auth.refresh_if_needed().await?;
            info!("credential is current");
        }
    }

    Ok(())
}

/// Formats the time left until `at` in whole seconds.
fn time_left(at: std::time::SystemTime) -> String {
    let left = at
        .duration_since(std::time::SystemTime::now())
        .unwrap_or_default();
    format!("{}s", left.as_secs())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the requested command.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
