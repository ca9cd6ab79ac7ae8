use btcr_client::config::{
    AppConfig,
    CliOverrides,
    ENV_CONTRACT_ADDRESS,
    ENV_RPC_URLS,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use std::path::PathBuf;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod client;
mod ui;

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: btcr-client [--config <path>] [--rpc-url <url>]... [--contract <address>]\n\
         [--wallet <name>]... [--wallet-dir <path>] [--wallet-rpc-url <url>] [--no-wallet]\n\
         [--log-dir <path>]\n\
         \n\
         Flags:\n\
           --config <path>          JSON config file\n\
           --rpc-url <url>          Public read endpoint; repeat to add fallbacks\n\
           --contract <address>     Mining contract address (default {})\n\
           --wallet <name>          Keystore to unlock; repeat for several accounts\n\
           --wallet-dir <path>      Keystore directory (defaults to ~/.btcr/keystore)\n\
           --wallet-rpc-url <url>   RPC endpoint used for signing (defaults to the first --rpc-url)\n\
           --no-wallet              Run read-only without unlocking keystores\n\
           --log-dir <path>         Directory for the rolling log file (defaults to ./logs)\n\
         \n\
         Environment:\n\
           {}    Comma-separated read endpoints\n\
           {}  Mining contract address\n\
           RUST_LOG                 Log filter (defaults to info)",
        btcr_client::DEFAULT_CONTRACT_ADDRESS,
        ENV_RPC_URLS,
        ENV_CONTRACT_ADDRESS,
    );
    std::process::exit(0);
}

fn parse_cli_args() -> Result<CliOverrides> {
    parse_args(std::env::args().skip(1))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliOverrides> {
    let mut args = args.into_iter();
    let mut cli = CliOverrides::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| eyre!("--config requires a path argument"))?;
                if cli.config_path.is_some() {
                    return Err(eyre!("--config may only be specified once"));
                }
                cli.config_path = Some(PathBuf::from(path));
            }
            "--rpc-url" => {
                let url = args
                    .next()
                    .ok_or_else(|| eyre!("--rpc-url requires a URL argument"))?;
                cli.rpc_urls.push(url);
            }
            "--contract" => {
                let address = args
                    .next()
                    .ok_or_else(|| eyre!("--contract requires an address argument"))?;
                if cli.contract_address.is_some() {
                    return Err(eyre!("--contract may only be specified once"));
                }
                cli.contract_address = Some(address);
            }
            "--wallet" => {
                let name = args
                    .next()
                    .ok_or_else(|| eyre!("--wallet requires a keystore name"))?;
                cli.wallet_names.push(name);
            }
            "--wallet-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| eyre!("--wallet-dir requires a path argument"))?;
                if cli.wallet_dir.is_some() {
                    return Err(eyre!("--wallet-dir may only be specified once"));
                }
                cli.wallet_dir = Some(dir);
            }
            "--wallet-rpc-url" => {
                let url = args
                    .next()
                    .ok_or_else(|| eyre!("--wallet-rpc-url requires a URL argument"))?;
                if cli.wallet_rpc_url.is_some() {
                    return Err(eyre!("--wallet-rpc-url may only be specified once"));
                }
                cli.wallet_rpc_url = Some(url);
            }
            "--no-wallet" => cli.no_wallet = true,
            "--log-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| eyre!("--log-dir requires a path argument"))?;
                if cli.log_dir.is_some() {
                    return Err(eyre!("--log-dir may only be specified once"));
                }
                cli.log_dir = Some(dir);
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    if cli.no_wallet && !cli.wallet_names.is_empty() {
        return Err(eyre!("--no-wallet cannot be combined with --wallet"));
    }
    Ok(cli)
}

/// Logs go to a daily file; the terminal belongs to the UI.
fn init_logging(config: &AppConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;
    let appender = rolling::daily(&config.log_dir, "btcr-client.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|err| eyre!("failed to install log subscriber: {err}"))?;
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = parse_cli_args()?;
    let config = AppConfig::load(&cli)?;
    let _guard = init_logging(&config)?;
    tracing::info!(endpoints = ?config.rpc_urls, contract = ?config.contract_address, "starting btcr client");
    client::run_app(config).await
}
