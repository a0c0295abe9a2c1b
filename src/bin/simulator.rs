use clap::{App, Arg};
use tracing::{error, info};
use vcluster::{ClusterEngine, ClusterServer, EngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("vcluster-simulator")
        .version("0.1.0")
        .about("☸️  Virtual cluster engine - simulated resources and synthetic telemetry")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("YAML engine configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDRESS")
                .help("Address to listen on (overrides the config file)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for reproducible runs")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(bind) = matches.value_of("bind") {
        config.server.bind_address = bind.to_string();
    }
    if let Some(seed) = matches.value_of("seed") {
        config.seed = Some(seed.parse()?);
    }

    println!("☸️  Virtual Cluster Engine");
    println!("=========================");

    let bind_address = config.server.bind_address.clone();
    let engine = ClusterEngine::new(config)?;
    engine.start()?;

    let server = ClusterServer::bind(engine.clone(), &bind_address).await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("TCP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    engine.shutdown();
    server_task.abort();
    let aborted = engine.abort_pending();
    if aborted > 0 {
        info!("Cancelled {} pending completions", aborted);
    }
    println!("☸️  Virtual Cluster Engine stopped");

    Ok(())
}
