use clap::{Parser, Subcommand};
use peril::prelude::*;
use tracing::info;

type BoxError = Box<dyn std::error::Error>;

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "peril-pause")]
#[command(about = "Publish or follow Peril pause state over the broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Overrides the broker address from `PERIL_AMQP_URI`.
    #[arg(long, global = true)]
    amqp_uri: Option<String>,

    #[arg(long, global = true, help = "Enable debug logging")]
    verbose: bool,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Declare the exchanges, publish a pause, wait for ctrl+c.
    Server,
    /// Subscribe to pause state as `username`, wait for ctrl+c.
    Client {
        #[arg(value_parser = parse_username)]
        username: String,
    },
}

fn parse_username(raw: &str) -> Result<String, String> {
    let username = raw.trim();
    if username.is_empty() {
        return Err("username must not be blank".into());
    }
    Ok(username.to_string())
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

async fn run_server(config: PubSubConfig, conn: AmqpConnection) -> Result<(), BoxError> {
    let topology = Topology::new(config);
    topology
        .declare_exchange(&conn, routing::EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct)
        .await?;
    topology
        .declare_exchange(&conn, routing::EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic)
        .await?;
    topology.declare_dead_letter_route(&conn).await?;

    let publisher = Publisher::open(&conn).await?;
    publisher
        .publish_json(
            routing::EXCHANGE_PERIL_DIRECT,
            routing::PAUSE_KEY,
            &PlayingState { is_paused: true },
        )
        .await?;
    info!("pause published, ctrl+c to exit");

    tokio::signal::ctrl_c().await?;
    publisher.close().await?;
    Ok(())
}

async fn run_client(
    config: PubSubConfig,
    conn: AmqpConnection,
    username: &str,
) -> Result<(), BoxError> {
    let engine = ConsumerEngine::new(config);
    let binding = Binding::new(
        routing::EXCHANGE_PERIL_DIRECT,
        routing::pause_queue(username),
        routing::PAUSE_KEY,
        QueueClass::Transient,
    );
    let mut handle = engine
        .subscribe(&conn, binding, JsonCodec, |state: PlayingState| {
            if state.is_paused {
                info!("game paused");
            } else {
                info!("game resumed");
            }
            AckType::Ack
        })
        .await?;
    info!(queue = handle.queue(), "waiting for pause state, ctrl+c to exit");

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            true
        }
        state = handle.wait_for(SubscriptionState::Closed) => {
            info!(%state, "subscription ended");
            false
        }
    };
    if interrupted {
        handle.cancel();
    }
    let end = handle.join().await?;
    info!(?end, "client stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    peril::logging::init(if cli.verbose { "debug" } else { "info" });

    let mut config = PubSubConfig::from_env()?;
    if let Some(uri) = cli.amqp_uri {
        config.amqp_uri = uri;
    }
    let conn = AmqpConnection::connect(&config.amqp_uri).await?;
    info!(uri = %config.amqp_uri, "connected to broker");

    match cli.command {
        Command::Server => run_server(config, conn.clone()).await?,
        Command::Client { username } => run_client(config, conn.clone(), &username).await?,
    }

    info!("closing connection");
    conn.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn test_parse_server() {
        let cli = Cli::try_parse_from(["peril-pause", "server"]).unwrap();
        assert_eq!(cli.command, Command::Server);
        assert_eq!(cli.amqp_uri, None);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_client_with_username() {
        let cli = Cli::try_parse_from(["peril-pause", "client", " lincoln "]).unwrap();
        assert_eq!(
            cli.command,
            Command::Client {
                username: "lincoln".into()
            }
        );
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "peril-pause",
            "client",
            "grant",
            "--verbose",
            "--amqp-uri",
            "amqp://rabbit:5672/",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.amqp_uri.as_deref(), Some("amqp://rabbit:5672/"));
    }

    #[test]
    fn test_parse_rejects_missing_username() {
        assert!(Cli::try_parse_from(["peril-pause", "client"]).is_err());

        let err = Cli::try_parse_from(["peril-pause", "client", "  "]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_parse_requires_a_mode() {
        assert!(Cli::try_parse_from(["peril-pause"]).is_err());
        assert!(Cli::try_parse_from(["peril-pause", "observer"]).is_err());
    }
}
