#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::Write;
use std::sync::Arc;

use log::{debug, error};
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

use quictun::config::{self, ForwardConfig, ValidatedConfig};
use quictun::direct_handler::DirectHandler;
use quictun::forward::{ProxyClient, start_tcp_forward, start_udp_forward};
use quictun::hysteria2::{Hysteria2Client, Hysteria2Server};
use quictun::server_handler::ServerHandler;
use quictun::tuic::{TuicClient, TuicServer};
use quictun::uuid_util::generate_uuid;

async fn start_forwards(
    forwards: Vec<ForwardConfig>,
    client: Arc<dyn ProxyClient>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut join_handles = Vec::with_capacity(forwards.len() * 2);
    for forward in forwards {
        let bind_address = forward.bind.resolve().await?;
        let (_, handle) =
            start_tcp_forward(bind_address, forward.target.clone(), client.clone()).await?;
        join_handles.push(handle);
        if forward.udp {
            let (_, handle) =
                start_udp_forward(bind_address, forward.target, client.clone()).await?;
            join_handles.push(handle);
        }
    }
    Ok(join_handles)
}

async fn start_config(
    config: ValidatedConfig,
    handler: Arc<dyn ServerHandler>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    match config {
        ValidatedConfig::TuicServer {
            bind,
            tls,
            settings,
        } => {
            let bind_address = bind.resolve().await?;
            let server = TuicServer::bind(bind_address, tls, settings, handler)?;
            Ok(vec![tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("TuicV5 server on {bind_address} stopped: {e}");
                }
            })])
        }
        ValidatedConfig::Hysteria2Server {
            bind,
            tls,
            settings,
        } => {
            let bind_address = bind.resolve().await?;
            let server = Hysteria2Server::bind(bind_address, tls, settings, handler)?;
            Ok(vec![tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Hysteria2 server on {bind_address} stopped: {e}");
                }
            })])
        }
        ValidatedConfig::TuicClient {
            tls,
            settings,
            forwards,
        } => {
            let client = Arc::new(TuicClient::new(settings, tls)?);
            start_forwards(forwards, client).await
        }
        ValidatedConfig::Hysteria2Client {
            tls,
            settings,
            forwards,
        } => {
            let client = Arc::new(Hysteria2Client::new(settings, tls));
            start_forwards(forwards, client).await
        }
    }
}

fn print_usage_and_exit(arg0: String) {
    eprintln!(
        "Usage: {arg0} [--threads/-t N] [--dry-run/-d] <config filename> [config filename] [..]"
    );
    eprintln!("       {arg0} generate-uuid");
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut dry_run = false;

    while !args.is_empty() && args[0].starts_with("-") {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--dry-run" || args[0] == "-d" {
            args.remove(0);
            dry_run = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.iter().any(|s| s == "generate-uuid") {
        println!("{}", generate_uuid());
        return;
    }

    if args.is_empty() {
        println!("No config specified, assuming loading from file config.quictun.yaml");
        args.push("config.quictun.yaml".to_string())
    }

    if dry_run {
        println!("Starting dry run.");
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {num_threads}");
    } else {
        println!("Using custom thread count ({num_threads})");
    }

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        mt.worker_threads(num_threads);
        mt
    };

    let runtime = match builder.enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let configs = match config::load_configs(&args).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load configs: {e}\n");
                print_usage_and_exit(arg0);
                return;
            }
        };

        for config in configs.iter() {
            debug!("================================================================================");
            debug!("{config:#?}");
        }
        debug!("================================================================================");

        let validated_configs = match config::create_server_configs(configs).await {
            Ok(c) => c,
            Err(e) => {
                if dry_run {
                    eprintln!("Dry run failed, could not create server configs: {e}\n");
                    std::process::exit(1);
                }
                eprintln!("Failed to create server configs: {e}\n");
                print_usage_and_exit(arg0);
                return;
            }
        };

        if dry_run {
            println!("Finishing dry run, config parsed successfully.");
            return;
        }

        println!("\nStarting {} config(s)..", validated_configs.len());

        let handler: Arc<dyn ServerHandler> = Arc::new(DirectHandler);
        let mut join_handles = vec![];
        for validated_config in validated_configs {
            let description = validated_config.to_string();
            match start_config(validated_config, handler.clone()).await {
                Ok(handles) => join_handles.extend(handles),
                Err(e) => {
                    eprintln!("Failed to start {description}: {e}");
                    for join_handle in join_handles {
                        join_handle.abort();
                    }
                    std::process::exit(1);
                }
            }
        }

        futures::future::pending::<()>().await;
    });
}
