use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "gmconnect", version, about = "Connect a Gmail account for ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ~/.gmconnect/config.json when present)
    #[arg(long, global = true, env = "GMC_CONFIG")]
    config: Option<PathBuf>,

    /// Token-management API base URL
    #[arg(long, global = true)]
    api_base: Option<Url>,

    /// Ingestion service base URL
    #[arg(long, global = true)]
    ingestion_host: Option<Url>,

    /// Identity provider id token of the signed-in user
    #[arg(long, global = true, env = "GMC_ID_TOKEN", hide_env_values = true)]
    id_token: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show whether a Gmail account is connected
    Status,
    /// Start the consent flow and wait for the callback
    Connect(ConnectArgs),
    /// Complete the flow from a pasted callback URL
    Callback { url: Url },
    /// Ask the ingestion service to fetch mail now
    Sync(SyncArgs),
    /// Revoke the stored Gmail credentials
    Disconnect,
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Address for the local callback listener (defaults to the app origin's port on loopback)
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Pull historical mail instead of the latest batch
    #[arg(long, default_value_t = false)]
    backfill: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use anyhow::{bail, Context, Result};
    use url::Url;

    use gmconnect::config::{ConnectConfig, ConsentStrategy};
    use gmconnect::connection::GmailConnection;
    use gmconnect::error::ConnectError;
    use gmconnect::handshake::{settings_location, CallbackListener, CallbackParams, Navigator};
    use gmconnect::identity::LocalIdentity;
    use gmconnect::output::{self, OutputFormat};
    use gmconnect::sync::SyncMode;

    use super::{Cli, Commands, ConnectArgs, SyncArgs};

    /// Terminal stand-in for a browser navigation.
    struct PrintNavigator;

    impl Navigator for PrintNavigator {
        fn navigate(&self, url: &Url) -> Result<(), ConnectError> {
            eprintln!("Open this URL in a browser to grant Gmail access:\n\n  {url}\n");
            Ok(())
        }
    }

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        let config = load_config(&cli)?;
        let connection = open_connection(config, cli.id_token.as_deref())?;

        match cli.command {
            Commands::Status => handle_status(&connection, format).await,
            Commands::Connect(args) => handle_connect(&connection, args, format).await,
            Commands::Callback { url } => handle_callback(&connection, &url, format).await,
            Commands::Sync(args) => handle_sync(&connection, args, format).await,
            Commands::Disconnect => handle_disconnect(&connection).await,
        }
    }

    fn load_config(cli: &Cli) -> Result<ConnectConfig> {
        let mut config =
            ConnectConfig::load(cli.config.as_deref()).context("load gmconnect configuration")?;
        if let Some(api_base) = &cli.api_base {
            config.api_base = api_base.clone();
        }
        if let Some(ingestion_host) = &cli.ingestion_host {
            config.ingestion_host = ingestion_host.clone();
        }
        Ok(config)
    }

    fn open_connection(config: ConnectConfig, id_token: Option<&str>) -> Result<GmailConnection> {
        let identity = Arc::new(LocalIdentity::new());
        if let Some(raw) = id_token {
            let session = identity
                .sign_in_with_id_token(raw)
                .context("sign in with id token")?;
            tracing::debug!(user_id = %session.user_id, "signed in");
        }
        Ok(GmailConnection::over_http(config, identity)?)
    }

    async fn handle_status(connection: &GmailConnection, format: OutputFormat) -> Result<()> {
        let status = connection.refresh_status().await;
        if let Some(error) = connection.last_status_error() {
            eprintln!("warning: status check failed: {error}");
        }
        println!("{}", output::format_status(format, &status)?);
        Ok(())
    }

    async fn handle_connect(
        connection: &GmailConnection,
        args: ConnectArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let coordinator = connection.coordinator();
        let config = coordinator.config();
        if config.strategy == ConsentStrategy::Popup {
            bail!("popup consent needs a windowed host; set strategy to \"redirect\" for the CLI");
        }

        let addr = match args.listen {
            Some(addr) => addr,
            None => default_listen_addr(&config.app_origin)?,
        };
        let listener = CallbackListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "waiting for gmail callback");

        coordinator.begin_redirect(&PrintNavigator).await?;
        let outcome = match tokio::time::timeout(config.popup_timeout, listener.receive(coordinator))
            .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                coordinator.reset();
                return Err(ConnectError::Timeout.into());
            }
        };
        println!("{}", output::format_outcome(format, &outcome)?);
        Ok(())
    }

    async fn handle_callback(
        connection: &GmailConnection,
        url: &Url,
        format: OutputFormat,
    ) -> Result<()> {
        let coordinator = connection.coordinator();
        let outcome = coordinator
            .handle_callback(&CallbackParams::from_url(url))
            .await;
        if let Some(location) = settings_location(coordinator.config(), &outcome) {
            tracing::info!(%location, "settings location");
        }
        println!("{}", output::format_outcome(format, &outcome?)?);
        Ok(())
    }

    async fn handle_sync(
        connection: &GmailConnection,
        args: SyncArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let mode = if args.backfill {
            SyncMode::Backfill
        } else {
            SyncMode::Incremental
        };
        let report = connection.sync_now(mode).await?;
        println!("{}", output::format_fetch_report(format, &report)?);
        Ok(())
    }

    async fn handle_disconnect(connection: &GmailConnection) -> Result<()> {
        connection.disconnect().await?;
        println!("Gmail account disconnected.");
        Ok(())
    }

    fn default_listen_addr(app_origin: &Url) -> Result<SocketAddr> {
        let port = app_origin
            .port_or_known_default()
            .with_context(|| format!("app origin {app_origin} has no port"))?;
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}
