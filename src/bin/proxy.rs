//! Interpose Proxy Binary
//!
//! Usage: interpose-proxy [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate new proxy configuration
//!   -h, --help           Print help information

use std::env;
use std::path::Path;
use std::sync::Arc;

use interpose::codec::{Catalogue, Codec, Definition};
use interpose::proxy::ProxyServer;
use interpose::{ProxyConfig, ProxyConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_proxy(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Interpose - intercepting game proxy

USAGE:
    interpose-proxy [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Generate new proxy configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a new configuration:
        interpose-proxy --generate > proxy.toml

    Run the proxy:
        interpose-proxy --config proxy.toml

The configured data_dir must contain an `opcodes.txt` map
(`NAME <opcode> [padded]` per line) and a `defs/` directory of
`NAME.<version>.def` message definitions.
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let mut config = ProxyConfig::new("127.0.0.1", 7801, "game.example.com", 7800);
    config.data_dir = Some("./data".to_string());

    let config_file = ProxyConfigFile::from_config(&config);

    println!("# Interpose proxy configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

/// Load the opcode map and message definitions from the data directory.
fn load_protocol_data(data_dir: &str) -> anyhow::Result<(Arc<Catalogue>, Arc<Codec>)> {
    let catalogue = Catalogue::new();
    let codec = Codec::new();

    let map_path = Path::new(data_dir).join("opcodes.txt");
    let map_text = std::fs::read_to_string(&map_path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", map_path.display(), e))?;
    let mapped = catalogue.parse_map(&map_text)?;
    tracing::info!(mapped, "opcode map loaded");

    let defs_dir = Path::new(data_dir).join("defs");
    let mut loaded = 0;
    if defs_dir.is_dir() {
        for entry in std::fs::read_dir(&defs_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // NAME.<version>.def
            let mut parts = file_name.rsplitn(3, '.');
            let (Some("def"), Some(version), Some(name)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let version: u16 = version
                .parse()
                .map_err(|_| anyhow::anyhow!("bad definition version in {}", file_name))?;

            let text = std::fs::read_to_string(&path)?;
            let def = Definition::parse(&text)
                .map_err(|e| anyhow::anyhow!("{}: {}", file_name, e))?;
            codec.add_definition(name, version, def, false)?;
            loaded += 1;
        }
    }
    tracing::info!(loaded, "message definitions loaded");

    catalogue.refresh_latest(&codec);
    Ok((Arc::new(catalogue), Arc::new(codec)))
}

async fn run_proxy(config_path: &str) -> anyhow::Result<()> {
    let config_content = std::fs::read_to_string(config_path)?;
    let config_file: ProxyConfigFile = toml::from_str(&config_content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    config.validate().map_err(|e: String| anyhow::anyhow!(e))?;

    let data_dir = config
        .data_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("data_dir must be set to run the proxy"))?;
    let (catalogue, codec) = load_protocol_data(&data_dir)?;

    tracing::info!(
        generation = config.generation,
        platform = ?config.platform,
        "starting interpose proxy"
    );

    let server = ProxyServer::new(config, catalogue, codec);
    server.run().await?;

    Ok(())
}
