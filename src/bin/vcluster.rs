use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use vcluster::protocol::{CommandResponse, CommandType, ProtocolHandler, ResponseStatus};
use vcluster::sla::SlaWindow;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Target<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("vcluster")
        .version("0.1.0")
        .about("☸️  Virtual cluster engine client")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Engine host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Engine port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Check the engine is responsive"))
        .subcommand(SubCommand::with_name("status").about("📊 Engine status"))
        .subcommand(
            SubCommand::with_name("deploy")
                .about("🚀 Deploy a YAML manifest")
                .arg(Arg::with_name("file").help("Manifest file").required(true)),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("📋 List resources")
                .arg(Arg::with_name("kind").help("Filter by kind"))
                .arg(namespace_arg()),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("🗑️  Delete a resource")
                .arg(Arg::with_name("name").help("Resource name").required(true))
                .arg(namespace_arg())
                .arg(
                    Arg::with_name("kind")
                        .short("k")
                        .long("kind")
                        .value_name("KIND")
                        .help("Resource kind")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("snapshot").about("📈 Latest metric snapshot"))
        .subcommand(
            SubCommand::with_name("history")
                .about("🕑 Snapshots from a recent window")
                .arg(
                    Arg::with_name("minutes")
                        .short("m")
                        .long("minutes")
                        .value_name("MINUTES")
                        .takes_value(true)
                        .default_value("5")
                        .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "minutes must be a number".to_string())),
                ),
        )
        .subcommand(
            SubCommand::with_name("sla")
                .about("🎯 Availability against the SLA target")
                .arg(
                    Arg::with_name("window")
                        .short("w")
                        .long("window")
                        .takes_value(true)
                        .possible_values(&["recent", "hour"])
                        .default_value("recent"),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("👀 Stream snapshots as they are produced")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N snapshots")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("incident")
                .about("💥 Incident control")
                .subcommand(
                    SubCommand::with_name("inject")
                        .about("Start a scenario on a service")
                        .arg(Arg::with_name("service").required(true))
                        .arg(Arg::with_name("scenario").required(true)),
                )
                .subcommand(
                    SubCommand::with_name("clear")
                        .about("Clear incidents (all services if none given)")
                        .arg(Arg::with_name("service")),
                )
                .subcommand(SubCommand::with_name("enable").about("Enable random incidents"))
                .subcommand(SubCommand::with_name("disable").about("Disable random incidents"))
                .subcommand(SubCommand::with_name("list").about("Active incidents and statistics")),
        )
        .get_matches();

    let target = Target {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?,
        format: matches.value_of("format").unwrap_or("table"),
    };

    match matches.subcommand() {
        ("ping", _) => run(&target, CommandType::Ping, print_message).await?,
        ("status", _) => run(&target, CommandType::Status, print_status).await?,
        ("deploy", Some(sub)) => {
            let path = sub.value_of("file").unwrap_or_default();
            let manifest = std::fs::read_to_string(path)?;
            run(&target, CommandType::Deploy { manifest }, print_deploy).await?
        }
        ("get", Some(sub)) => {
            let command = CommandType::ListResources {
                namespace: sub.value_of("namespace").map(str::to_string),
                kind: sub.value_of("kind").map(str::to_string),
            };
            run(&target, command, print_resources).await?
        }
        ("delete", Some(sub)) => {
            let command = CommandType::DeleteResource {
                name: sub.value_of("name").unwrap_or_default().to_string(),
                namespace: sub.value_of("namespace").map(str::to_string),
                kind: sub.value_of("kind").map(str::to_string),
            };
            run(&target, command, print_message).await?
        }
        ("snapshot", _) => run(&target, CommandType::GetSnapshot, print_snapshot).await?,
        ("history", Some(sub)) => {
            let window_minutes = sub.value_of("minutes").unwrap_or("5").parse()?;
            run(&target, CommandType::GetHistory { window_minutes }, print_history).await?
        }
        ("sla", Some(sub)) => {
            let window = SlaWindow::parse(sub.value_of("window").unwrap_or("recent")).unwrap_or_default();
            run(&target, CommandType::GetSla { window }, print_sla).await?
        }
        ("watch", Some(sub)) => {
            let count = sub.value_of("count").map(str::parse::<usize>).transpose()?;
            watch(&target, count).await?
        }
        ("incident", Some(sub)) => handle_incident(&target, sub).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the engine", "vcluster-simulator".bright_cyan());
            println!("  {} Deploy a manifest", "vcluster deploy app.yaml".bright_cyan());
            println!("  {} Watch telemetry", "vcluster watch".bright_cyan());
        }
    }

    Ok(())
}

fn namespace_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("namespace")
        .short("n")
        .long("namespace")
        .value_name("NAMESPACE")
        .help("Namespace")
        .takes_value(true)
}

async fn handle_incident(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult<()> {
    let command = match matches.subcommand() {
        ("inject", Some(sub)) => CommandType::InjectIncident {
            service: sub.value_of("service").unwrap_or_default().to_string(),
            scenario: sub.value_of("scenario").unwrap_or_default().to_string(),
        },
        ("clear", Some(sub)) => CommandType::ClearIncidents {
            service: sub.value_of("service").map(str::to_string),
        },
        ("enable", _) => CommandType::SetIncidentInjection { enabled: true },
        ("disable", _) => CommandType::SetIncidentInjection { enabled: false },
        ("list", _) => CommandType::GetIncidents,
        _ => {
            println!("{}", "Incident subcommand required. Use 'vcluster incident --help' for options.".yellow());
            return Ok(());
        }
    };
    let printer: fn(&CommandResponse) = if matches!(command, CommandType::GetIncidents) {
        print_incidents
    } else {
        print_message
    };
    run(target, command, printer).await
}

async fn connect(target: &Target<'_>) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", target.host, target.port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to engine at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "vcluster-simulator".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

async fn send_command(target: &Target<'_>, command_type: CommandType) -> CliResult<(String, CommandResponse)> {
    let mut protocol = ProtocolHandler::default();
    let command = protocol.create_command(command_type);
    let line = protocol.serialize_command(&command)?;
    let stream = connect(target).await?;

    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut lines = BufReader::new(reader).lines();
        match lines.next_line().await? {
            Some(raw) => Ok::<String, std::io::Error>(raw),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Server closed connection",
            )),
        }
    };

    match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
        Ok(raw) => {
            let raw = raw?;
            let response = protocol.parse_response(&raw)?;
            Ok((raw, response))
        }
        Err(_) => {
            eprintln!("{} Command timed out after {:?}", "⏰".yellow(), COMMAND_TIMEOUT);
            Err("Command timeout".into())
        }
    }
}

async fn run(target: &Target<'_>, command: CommandType, print: fn(&CommandResponse)) -> CliResult<()> {
    let (raw, response) = send_command(target, command).await?;
    if target.format == "json" {
        println!("{}", raw);
    } else if response.status == ResponseStatus::Success {
        print(&response);
    } else {
        print_failure(&response);
    }
    Ok(())
}

async fn watch(target: &Target<'_>, count: Option<usize>) -> CliResult<()> {
    let mut protocol = ProtocolHandler::default();
    let command = protocol.create_command(CommandType::Subscribe);
    let line = protocol.serialize_command(&command)?;
    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    if target.format != "json" {
        println!("{}", "📡 Watching cluster telemetry (Press Ctrl+C to stop)...".bright_blue().bold());
    }

    let mut lines = BufReader::new(reader).lines();
    let mut seen = 0;
    while let Some(raw) = lines.next_line().await? {
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if target.format == "json" {
            if value["type"] == "snapshot" {
                println!("{}", raw);
            }
        } else {
            match value["type"].as_str() {
                Some("connected") => println!(
                    "{} subscribed as #{}",
                    "🔗".green(),
                    value["subscriber_id"].to_string().bright_white()
                ),
                Some("snapshot") => print_snapshot_value(&value),
                Some("closed") => {
                    eprintln!("{} stream closed by the server", "⚠️".yellow());
                    return Ok(());
                }
                _ if value["status"].is_string() && value["status"] != "success" => {
                    eprintln!("{} {}", "❌".red(), value["message"].as_str().unwrap_or("subscribe failed"));
                    return Ok(());
                }
                _ => {}
            }
        }
        if value["type"] == "snapshot" {
            seen += 1;
            if count.is_some_and(|limit| seen >= limit) {
                break;
            }
        }
    }
    Ok(())
}

fn print_failure(response: &CommandResponse) {
    let status = serde_json::to_value(response.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    println!(
        "{} {} {}",
        "❌".red(),
        status.bright_red(),
        response.message.as_deref().unwrap_or_default()
    );
}

fn print_message(response: &CommandResponse) {
    println!("{} {}", "✅".green(), response.message.as_deref().unwrap_or("ok").bright_green());
}

fn data(response: &CommandResponse) -> &Value {
    response.data.as_ref().unwrap_or(&Value::Null)
}

fn print_status(response: &CommandResponse) {
    let d = data(response);
    println!("{} {}", "📊".bright_blue(), "Engine Status".bright_blue().bold());
    let running = d["driver_running"].as_bool().unwrap_or(false);
    println!(
        "{:<22} {}",
        "Driver:".bright_white(),
        if running { "running".bright_green() } else { "stopped".bright_red() }
    );
    println!("{:<22} {}s", "Uptime:".bright_white(), d["uptime_seconds"]);
    println!("{:<22} {}", "Ticks:".bright_white(), d["ticks"]);
    let r = &d["resources"];
    println!(
        "{:<22} {} total, {} pending, {} running, {} failed",
        "Resources:".bright_white(),
        r["total"],
        r["pending"].to_string().yellow(),
        r["running"].to_string().green(),
        r["failed"].to_string().red()
    );
    println!("{:<22} {}", "Monitored services:".bright_white(), d["monitored_services"]);
    println!(
        "{:<22} {} (random injection {})",
        "Active incidents:".bright_white(),
        d["active_incidents"],
        if d["incident_injection_enabled"].as_bool().unwrap_or(false) { "on" } else { "off" }
    );
    println!("{:<22} {}", "Subscribers:".bright_white(), d["hub"]["active"]);
}

fn print_deploy(response: &CommandResponse) {
    print_message(response);
    if let Some(resources) = data(response)["initial_resources"].as_array() {
        for resource in resources {
            println!(
                "  {} {}/{} {}",
                "•".dimmed(),
                resource["kind"].as_str().unwrap_or("?"),
                resource["name"].as_str().unwrap_or("?"),
                "Pending".yellow()
            );
        }
    }
}

fn colored_status(status: &str) -> ColoredString {
    match status {
        "Running" => status.green(),
        "Failed" => status.red(),
        _ => status.yellow(),
    }
}

fn print_resources(response: &CommandResponse) {
    let resources = data(response).as_array().cloned().unwrap_or_default();
    if resources.is_empty() {
        println!("{}", "No resources found.".dimmed());
        return;
    }
    println!(
        "{}",
        format!("{:<16} {:<14} {:<28} {:<10} {}", "NAMESPACE", "KIND", "NAME", "STATUS", "READY").bold()
    );
    for r in &resources {
        let status = r["status"].as_str().unwrap_or("?");
        let details = &r["details"];
        let ready = match details["type"].as_str() {
            Some("workload") => format!("{}/{}", details["ready_replicas"], details["desired_replicas"]),
            Some("pod") => details["node_assignment"].as_str().unwrap_or("-").to_string(),
            Some("service") => details["cluster_ip"].as_str().unwrap_or("-").to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<16} {:<14} {:<28} {:<10} {}",
            r["namespace"].as_str().unwrap_or("?"),
            r["kind"].as_str().unwrap_or("?"),
            r["name"].as_str().unwrap_or("?"),
            colored_status(status),
            ready
        );
        if let Some(reason) = r["failure_reason"].as_str() {
            println!("  {} {}", "↳".dimmed(), reason.red());
        }
    }
}

fn colored_health(health: &str) -> ColoredString {
    match health {
        "healthy" => health.green(),
        "warning" => health.yellow(),
        _ => health.red(),
    }
}

fn print_snapshot(response: &CommandResponse) {
    print_snapshot_value(data(response));
}

fn print_snapshot_value(snapshot: &Value) {
    let summary = &snapshot["summary"];
    println!(
        "{} {} {} | {} services | cpu {:.1}% | mem {:.1}% | {:.1} rps | errors {:.2}% | sla {:.1}%",
        "🕒".dimmed(),
        snapshot["timestamp"].as_str().unwrap_or("?").dimmed(),
        colored_health(summary["overall_health"].as_str().unwrap_or("?")),
        summary["total_services"],
        summary["avg_cpu_percent"].as_f64().unwrap_or(0.0),
        summary["avg_memory_percent"].as_f64().unwrap_or(0.0),
        summary["total_requests_per_second"].as_f64().unwrap_or(0.0),
        summary["error_rate_percent"].as_f64().unwrap_or(0.0),
        summary["sla_percentage"].as_f64().unwrap_or(0.0),
    );
    if let Some(services) = snapshot["services"].as_object() {
        for (name, m) in services {
            let incidents = m["incidents"]
                .as_array()
                .map(|list| list.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            println!(
                "  {:<28} {:<8} cpu {:>5.1}% mem {:>5.1}% rps {:>8.1} err {:>5.2}% rt {:>6.1}ms {}",
                name,
                colored_health(m["health"].as_str().unwrap_or("?")),
                m["cpu"]["usage_percent"].as_f64().unwrap_or(0.0),
                m["memory"]["usage_percent"].as_f64().unwrap_or(0.0),
                m["requests"]["requests_per_second"].as_f64().unwrap_or(0.0),
                m["requests"]["error_rate_percent"].as_f64().unwrap_or(0.0),
                m["requests"]["response_time_ms"].as_f64().unwrap_or(0.0),
                incidents.bright_red()
            );
        }
    }
}

fn print_history(response: &CommandResponse) {
    let snapshots = data(response).as_array().cloned().unwrap_or_default();
    if snapshots.is_empty() {
        println!("{}", "No snapshots in window.".dimmed());
    }
    for snapshot in &snapshots {
        let summary = &snapshot["summary"];
        println!(
            "{} {:<8} services {:>3} cpu {:>5.1}% err {:>5.2}%",
            snapshot["timestamp"].as_str().unwrap_or("?").dimmed(),
            colored_health(summary["overall_health"].as_str().unwrap_or("?")),
            summary["total_services"],
            summary["avg_cpu_percent"].as_f64().unwrap_or(0.0),
            summary["error_rate_percent"].as_f64().unwrap_or(0.0),
        );
    }
}

fn print_sla(response: &CommandResponse) {
    let d = data(response);
    let status = d["status"].as_str().unwrap_or("?");
    let colored = match status {
        "meeting" => status.green(),
        "at_risk" => status.yellow(),
        "breached" => status.red(),
        _ => status.dimmed(),
    };
    println!("{} {}", "🎯".bright_blue(), "SLA".bright_blue().bold());
    println!("{:<16} {}", "Status:".bright_white(), colored);
    println!(
        "{:<16} {:.2}% (target {:.1}%)",
        "Availability:".bright_white(),
        d["availability_percent"].as_f64().unwrap_or(0.0),
        d["target_percent"].as_f64().unwrap_or(0.0)
    );
    println!(
        "{:<16} {}/{} available ({} window)",
        "Samples:".bright_white(),
        d["healthy_sample_count"],
        d["sample_count"],
        d["window"].as_str().unwrap_or("?")
    );
}

fn print_incidents(response: &CommandResponse) {
    let d = data(response);
    println!(
        "{} {} (random injection {})",
        "💥".bright_red(),
        "Incidents".bright_blue().bold(),
        if d["enabled"].as_bool().unwrap_or(false) { "on".green() } else { "off".red() }
    );
    match d["active"].as_array() {
        Some(active) if !active.is_empty() => {
            for incident in active {
                println!(
                    "  #{} {:<16} on {:<24} until {}",
                    incident["id"],
                    incident["scenario"].as_str().unwrap_or("?").bright_red(),
                    incident["service"].as_str().unwrap_or("?"),
                    incident["expires_at"].as_str().unwrap_or("?").dimmed()
                );
            }
        }
        _ => println!("  {}", "No active incidents.".dimmed()),
    }
    let stats = &d["stats"];
    println!(
        "  triggered {} | injected {} | expired {} | cleared {}",
        stats["total_triggered"], stats["manually_injected"], stats["expired"], stats["cleared"]
    );
}
