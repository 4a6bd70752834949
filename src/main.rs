use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use buxtehude::{Client, ClientPreferences, MSG_DISCONNECT, MSG_YOU, Message, MessageFormat, Server};

mod cli;
use cli::{BrokerArgs, Cli, ClientArgs, Command};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    if let Err(err) = buxtehude::init() {
        warn!("{err}");
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => run_broker(args).await?,
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(args.port).await?;
    // Plain banner so wrappers can scrape the bound address.
    println!("broker listening on {addr}");
    if let Some(path) = &args.unix {
        server.listen_unix(path)?;
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    server.close().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut prefs = ClientPreferences::new(&args.team);
    if args.msgpack {
        prefs = prefs.format(MessageFormat::Msgpack);
    }

    let client = match &args.unix {
        Some(path) => Client::connect_unix(path, prefs).await?,
        None => Client::connect_tcp(&args.host, args.port, prefs).await?,
    };
    println!("*** connected as {}", args.team);

    client.add_handler("chat", |_, message| {
        println!(
            "<{}> {}",
            message.src,
            message.content.as_str().unwrap_or_default()
        );
    });
    client.add_handler(MSG_DISCONNECT, |_, message| {
        let who = message
            .content
            .get("who")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if who == MSG_YOU {
            let reason = message
                .content
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("disconnected");
            println!("*** disconnected by broker: {reason}");
        } else {
            println!("*** {who} left the bus");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text.eq_ignore_ascii_case("/quit") {
                    break;
                }
                client.write(Message {
                    ty: "chat".into(),
                    dest: args.dest.clone(),
                    content: text.into(),
                    ..Message::default()
                })?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(?err, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.close().await;
    println!("*** left the bus");
    Ok(())
}
