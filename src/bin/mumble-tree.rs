use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mumble_client::{ConnectionConfig, MumbleClient, MumbleEvent};
use tracing_subscriber::{fmt, EnvFilter};

/// Print the channel tree with users in each channel.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file; flags below override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Target host to connect to
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short = 'p', long)]
    port: Option<u16>,
    #[arg(short = 'u', long)]
    username: Option<String>,
    /// Keep running and print events for this many seconds (0 = exit after the tree)
    #[arg(short = 'w', long = "watch", default_value_t = 0)]
    watch_secs: u64,
    /// Verify the server certificate instead of accepting any
    #[arg(long)]
    verify: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();

    let mut config = match &args.config {
        Some(path) => ConnectionConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => {
            let mut config = ConnectionConfig::new("127.0.0.1");
            config.accept_invalid_certs = true;
            if let Ok(username) = std::env::var("MUMBLE_USERNAME") {
                config.username = username;
            }
            if let Ok(password) = std::env::var("MUMBLE_PASSWORD") {
                config.password = Some(password);
            }
            config
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(username) = args.username {
        config.username = username;
    }
    if args.verify {
        config.accept_invalid_certs = false;
    }

    let client = MumbleClient::connect_tls(config).await?;
    if let Some(version) = client.info().await.server_version {
        println!(
            "Connected. Server version: {}",
            version.release.as_deref().unwrap_or("unknown")
        );
    }

    println!("Channel Tree:");
    print_channel_tree(&client, 0, 0).await;

    if args.watch_secs > 0 {
        let mut events = client.subscribe_events();
        let watch = async {
            while let Ok(event) = events.recv().await {
                match event {
                    MumbleEvent::UserConnected(user) => println!("+ {}", user.name),
                    MumbleEvent::UserDisconnected { user, .. } => println!("- {}", user.name),
                    MumbleEvent::UserMoved { session, to, .. } => {
                        let name = client.user_by_session(session).await.map(|u| u.name);
                        let path = client.channel_path(to).await.unwrap_or_default();
                        println!("> {} -> /{}", name.unwrap_or_default(), path);
                    }
                    MumbleEvent::TextMessage(msg) => println!("# {}", msg.message),
                    MumbleEvent::Disconnected => break,
                    _ => {}
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(args.watch_secs), watch).await;
    }

    client.disconnect().await?;
    Ok(())
}

async fn print_channel_tree(client: &MumbleClient, channel_id: u32, depth: usize) {
    let mut stack = vec![(channel_id, depth)];
    while let Some((id, depth)) = stack.pop() {
        let Some(view) = client.channel_by_id(id).await else {
            continue;
        };
        let indent = "  ".repeat(depth);
        let name = if view.channel.name.is_empty() {
            "Unnamed Channel"
        } else {
            view.channel.name.as_str()
        };
        println!("{indent}{name}");
        if !view.users.is_empty() {
            let names: Vec<&str> = view.users.iter().map(|u| u.name.as_str()).collect();
            println!("{indent}  Users: {}", names.join(", "));
        }
        let children = client.children(id).await;
        for child in children.iter().rev() {
            stack.push((child.id, depth + 1));
        }
    }
}
