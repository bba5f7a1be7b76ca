use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnelctl_core::orchestrator::{LifecycleOrchestrator, StartOptions};
use tunnelctl_core::ConfigStore;

struct Args {
    port: u16,
    domain: Option<String>,
    skip_auth: bool,
    non_interactive: bool,
}

fn parse_args() -> Result<Args> {
    let mut argv = std::env::args().skip(1);
    let port = argv
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: tunnelctl <port> [--domain <host>] [--skip-auth] [--non-interactive]"))?
        .parse::<u16>()?;

    let mut domain = None;
    let mut skip_auth = false;
    let mut non_interactive = false;
    let mut rest: Vec<String> = argv.collect();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--domain" => {
                if i + 1 >= rest.len() {
                    bail!("--domain requires a value");
                }
                domain = Some(rest.remove(i + 1));
                rest.remove(i);
            }
            "--skip-auth" => {
                skip_auth = true;
                rest.remove(i);
            }
            "--non-interactive" => {
                non_interactive = true;
                rest.remove(i);
            }
            other => bail!("unrecognized argument: {other}"),
        }
    }

    Ok(Args {
        port,
        domain,
        skip_auth,
        non_interactive,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelctl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(4);
        }
    };

    let config_store = ConfigStore::new().unwrap_or_default();
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelctl")
        .join("tunnels");

    let orchestrator = LifecycleOrchestrator::new("cloudflared", config_dir, config_store);
    let options = StartOptions {
        domain: args.domain,
        skip_auth: args.skip_auth,
        interactive: !args.non_interactive,
    };

    let (outcome, mut active) = match orchestrator.start(args.port, options).await {
        Ok(result) => result,
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    info!("tunnel ready at {}", outcome.url);
    println!("{}", outcome.url);

    tokio::signal::ctrl_c().await?;
    info!("received interrupt, stopping tunnel");
    orchestrator.stop(&mut active, false).await?;

    Ok(())
}
