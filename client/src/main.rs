use clap::Parser;
use client::network::Client;
use log::info;
use shared::Priority;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:43594")]
    server: String,

    /// Client revision sent in the handshake
    #[arg(short = 'r', long)]
    revision: u32,

    /// Number of version keys the server sends
    #[arg(short = 'i', long, default_value = "0")]
    indices: usize,

    /// Send urgent requests instead of prefetch requests
    #[arg(short = 'u', long)]
    urgent: bool,

    /// Entries to download, as index:entry
    #[arg(required = true, value_parser = parse_entry)]
    entries: Vec<(u8, u16)>,
}

fn parse_entry(value: &str) -> Result<(u8, u16), String> {
    let (index, entry) = value
        .split_once(':')
        .ok_or_else(|| format!("expected index:entry, got {}", value))?;
    let index = index
        .parse()
        .map_err(|e| format!("invalid index {}: {}", index, e))?;
    let entry = entry
        .parse()
        .map_err(|e| format!("invalid entry {}: {}", entry, e))?;
    Ok((index, entry))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let priority = if args.urgent {
        Priority::Urgent
    } else {
        Priority::Normal
    };

    info!("Connecting to: {}", args.server);
    let mut client = Client::connect(args.server.as_str(), args.revision, args.indices).await?;
    for (index, key) in client.version_table().iter().enumerate() {
        info!("Index {}: {:#010x}", index, key);
    }

    for (index, entry) in &args.entries {
        client.request(*index, *entry, priority).await?;
    }

    for _ in &args.entries {
        let response = client.next_response().await?;
        if response.is_missing() {
            info!("{}/{}: not available", response.index, response.entry);
        } else {
            info!(
                "{}/{}: {} bytes, {:?}, crc {:#010x}",
                response.index,
                response.entry,
                response.container.len(),
                response.compression,
                crc32fast::hash(&response.container)
            );
        }
    }

    client.disconnect().await?;
    Ok(())
}
