//! Command-line front end for courier
//!
//! - `courier verify` checks that the relay is reachable and accepts our
//!   credentials
//! - `courier send` dispatches a single notification and reports the outcome

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use courier::{Courier, CourierConfig, find_config_file};
use courier_common::logging;
use courier_dispatch::{SendOutcome, SendRequest};

/// Send notifications through the configured SMTP relay
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Resilient notification dispatch", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $COURIER_CONFIG, then
    /// ./courier.config.ron, then /etc/courier/courier.config.ron)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the relay, authenticate and disconnect
    Verify,
    /// Send one message
    Send {
        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        /// Plain-text body
        #[arg(long)]
        text: Option<String>,

        /// HTML body
        #[arg(long)]
        html: Option<String>,

        /// Retries after the first attempt (overrides the configuration)
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config = CourierConfig::load(&path)?;
    let courier = Courier::new(config)?;

    let result = match cli.command {
        Commands::Verify => verify(&courier).await,
        Commands::Send {
            to,
            subject,
            text,
            html,
            max_retries,
        } => {
            let mut request = SendRequest::new(to, subject);
            request.text = text;
            request.html = html;
            send(&courier, &request, max_retries).await
        }
    };

    courier.close().await;
    result
}

async fn verify(courier: &Courier) -> anyhow::Result<()> {
    courier
        .verify()
        .await
        .map_err(|e| anyhow::anyhow!("Relay {} is not usable: {e}", courier.relay()))?;

    println!("Relay {} is reachable and accepted the connection", courier.relay());
    Ok(())
}

async fn send(
    courier: &Courier,
    request: &SendRequest,
    max_retries: Option<u32>,
) -> anyhow::Result<()> {
    if request.text.is_none() && request.html.is_none() {
        anyhow::bail!("At least one of --text or --html is required");
    }

    let outcome = match max_retries {
        Some(retries) => courier.send_with_retries(request, retries).await,
        None => courier.send(request).await,
    };

    match outcome {
        SendOutcome::Success(delivery) => {
            println!("Delivered after {} attempt(s)", delivery.attempts);
            println!("  Message-ID: {}", delivery.message_id);
            println!("  Email-ID:   {}", delivery.email_id);
            println!("  Accepted:   {}", delivery.accepted.join(", "));
            if !delivery.rejected.is_empty() {
                println!("  Rejected:   {}", delivery.rejected.join(", "));
            }
            println!("  Response:   {}", delivery.response);
            Ok(())
        }
        SendOutcome::Failure(failure) => {
            eprintln!("Not delivered ({})", failure.kind);
            eprintln!("  Email-ID:   {}", failure.email_id);
            if let Some(code) = failure.code {
                eprintln!("  SMTP code:  {code}");
            }
            Err(failure.into())
        }
    }
}
