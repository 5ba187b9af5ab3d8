//! HDS Server Binary
//!
//! Usage: hds-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate new server configuration
//!   -h, --help           Print help information

use std::collections::HashSet;
use std::env;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use hds::server::{Server, ServerConfig, ServerConfigFile};
use hds::transport::ControllerSetupParams;
use hds::{DataStreamDelegate, DataStreamId, DataStreamRequest, HapSession, StreamControl};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug
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
            let setup = match args.get(3).map(String::as_str) {
                None => None,
                Some("--setup") => {
                    if args.len() < 6 {
                        eprintln!("Error: --setup requires <SECRET_HEX> <SALT_HEX>");
                        return Ok(());
                    }
                    Some(parse_setup(&args[4], &args[5])?)
                }
                Some(other) => {
                    eprintln!("Unknown option: {}", other);
                    print_usage();
                    return Ok(());
                }
            };
            run_server(&args[2], setup).await?;
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
        r#"HDS Server - HomeKit Data Stream echo accessory

USAGE:
    hds-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>                     Path to configuration file
        --setup <SECRET_HEX> <SALT_HEX>     After --config: register one TCP setup request
                                            for a controller with this shared secret and key salt
    -g, --generate                          Generate new server configuration
    -h, --help                              Print help information

EXAMPLES:
    Generate a new configuration:
        hds-server --generate > server.toml

    Run the server and accept one controller:
        hds-server --config server.toml --setup <64 hex chars> <64 hex chars>
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = ServerConfigFile::from_config(&ServerConfig::default());

    println!("# HDS Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config_file.to_toml().map_err(|e: String| anyhow::anyhow!(e))?);

    Ok(())
}

/// Shared secret and controller key salt of the HAP session to set up for.
struct SetupRequest {
    shared_secret: [u8; 32],
    controller_key_salt: [u8; 32],
}

fn parse_hex_32(name: &str, text: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(text).map_err(|e| anyhow::anyhow!("Invalid hex {}: {}", name, e))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} must be 32 bytes, got {}", name, bytes.len()))
}

fn parse_setup(secret_hex: &str, salt_hex: &str) -> anyhow::Result<SetupRequest> {
    Ok(SetupRequest {
        shared_secret: parse_hex_32("secret", secret_hex)?,
        controller_key_salt: parse_hex_32("salt", salt_hex)?,
    })
}

async fn run_server(config_path: &str, setup: Option<SetupRequest>) -> anyhow::Result<()> {
    let config_content = std::fs::read_to_string(config_path)?;
    let config_file = ServerConfigFile::from_toml(&config_content).map_err(|e: String| anyhow::anyhow!(e))?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    tracing::info!("Starting HDS server on {}:{}", config.listen_addr, config.listen_port);
    tracing::info!("Transport: {}", config.transport);
    tracing::info!("Max streams: {}", config.data_stream.max_streams);

    let mut server = Server::new(config, Box::new(EchoDelegate::default()))?;

    // Keeps the HAP session of the setup alive while the server runs.
    let _session = match setup {
        Some(setup) => {
            let session = Arc::new(HapSession::new(hds::stream::TransportType::Ip, 0, setup.shared_secret));
            let data_stream = server.data_stream();
            let mut data_stream = data_stream.lock();
            data_stream.setup_begin(
                0,
                &session,
                &ControllerSetupParams {
                    controller_key_salt: Some(setup.controller_key_salt),
                },
            )?;
            let params = data_stream.setup_complete()?;
            println!("Listening port: {}", params.listener_port.unwrap_or_default());
            if let Some(salt) = params.accessory_key_salt {
                println!("Accessory key salt (hex): {}", hex::encode(salt));
            }
            Some(session)
        }
        None => None,
    };

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to wait for Ctrl-C: {}", e);
            }
        })
        .await?;

    Ok(())
}

/// Receives every frame whole and sends it back.
#[derive(Default)]
struct EchoDelegate {
    /// Streams with an echo in flight
    sending: Arc<Mutex<HashSet<DataStreamId>>>,
}

impl DataStreamDelegate for EchoDelegate {
    fn handle_accept(&mut self, stream: &mut StreamControl<'_>) {
        tracing::info!("[{}] Accepted ({:?}).", stream.id(), stream.request().transport_type);
    }

    fn handle_data(&mut self, stream: &mut StreamControl<'_>, total_data_bytes: usize) {
        let sending = self.sending.clone();
        stream.receive_data(
            vec![0u8; total_data_bytes],
            Box::new(move |stream, completion| {
                if let Err(e) = completion.result {
                    tracing::warn!("[{}] Receive failed: {}", stream.id(), e);
                    return;
                }
                let Some(frame) = completion.buffer.into_vec() else {
                    return;
                };
                if !sending.lock().insert(stream.id()) {
                    tracing::warn!("[{}] Dropping echo of {} bytes (send in flight).", stream.id(), frame.len());
                    return;
                }
                echo(stream, Bytes::from(frame), sending);
            }),
        );
    }

    fn handle_invalidate(&mut self, _request: &DataStreamRequest, id: DataStreamId) {
        self.sending.lock().remove(&id);
        tracing::info!("[{}] Invalidated.", id);
    }
}

fn echo(stream: &mut StreamControl<'_>, frame: Bytes, sending: Arc<Mutex<HashSet<DataStreamId>>>) {
    stream.prepare_data(
        frame.len(),
        Box::new(move |stream, completion| {
            if completion.result.is_err() {
                sending.lock().remove(&stream.id());
                return;
            }
            stream.send_data(
                frame,
                Box::new(move |stream, completion| {
                    if completion.result.is_err() || completion.is_complete {
                        sending.lock().remove(&stream.id());
                    }
                }),
            );
        }),
    );
}
