// CLI entry point: connect to a relay backend and report what happens.
//
// `relay-probe` walks the full hop sequence (name tier, master tier, and,
// with `--room`, a game tier) over TCP and prints every notification. Useful
// for checking a deployment's addresses, regions, and app id before pointing
// a real client at it. Set `RUST_LOG=debug` to see the state machine.
//
// Usage:
//   relay-probe [OPTIONS]
//     --config <FILE>        JSON client config (fields default if absent)
//     --name-server <ADDR>   Name tier address (default: 127.0.0.1:5058)
//     --master <ADDR>        Skip the name tier and go straight to a master
//     --app-id <ID>          Application id
//     --region <CODE>        Region to authenticate for
//     --room <NAME>          Join (or create) this room once on the master
//     --seconds <N>          How long to stay connected (default: 10)

use std::time::{Duration, Instant};

use log::{info, warn};
use tierlink_client::{ClientConfig, ClientState, Notification, Peer, RoomOptions, TcpTransport};

const TICK: Duration = Duration::from_millis(20);

struct ProbeArgs {
    config: ClientConfig,
    room: Option<String>,
    seconds: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args();

    let mut peer = Peer::new(args.config, TcpTransport::new());
    peer.subscribe(|n: &Notification| match n {
        Notification::StateChanged { .. } => {}
        other => println!("{other:?}"),
    });
    if let Err(e) = peer.connect_using_settings() {
        eprintln!("Cannot start: {e}");
        std::process::exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut room_requested = false;
    let mut region_chosen = false;
    while Instant::now() < deadline {
        peer.service();
        match peer.state() {
            ClientState::Disconnected => break,
            ClientState::ConnectedToNameServer if !region_chosen && !peer.regions().is_empty() => {
                // No region configured: take the first one offered.
                region_chosen = true;
                let code = peer.regions()[0].code.clone();
                println!("Selecting region {code}");
                if let Err(e) = peer.select_region(&code) {
                    warn!("cannot select {code}: {e}");
                }
            }
            state if state.is_on_master() && !room_requested => {
                if let Some(room) = &args.room {
                    room_requested = true;
                    if let Err(e) = peer.join_or_create_room(room, RoomOptions::default()) {
                        warn!("cannot enter {room}: {e}");
                    }
                }
            }
            _ => {}
        }
        std::thread::sleep(TICK);
    }

    if let Some(room) = peer.room() {
        println!(
            "In room {} as {:?}: {} player(s), master {:?}",
            room.name,
            peer.local_actor(),
            room.player_count(),
            room.master_client_id
        );
    }
    shutdown(&mut peer);
}

/// Disconnect and wait (briefly) for the transport to confirm.
fn shutdown(peer: &mut Peer<TcpTransport>) {
    if peer.state() == ClientState::Disconnected {
        return;
    }
    info!("disconnecting");
    peer.disconnect();
    let deadline = Instant::now() + Duration::from_secs(2);
    while peer.state() != ClientState::Disconnected && Instant::now() < deadline {
        peer.service();
        std::thread::sleep(TICK);
    }
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> ProbeArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();
    let mut room = None;
    let mut seconds = 10;
    let mut i = 1;

    // A config file is the base; flags override it regardless of order.
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args.get(pos + 1).unwrap_or_else(|| {
            eprintln!("--config requires a file path");
            std::process::exit(1);
        });
        let json = std::fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("Cannot read {path}: {e}");
            std::process::exit(1);
        });
        config = ClientConfig::from_json(&json).unwrap_or_else(|e| {
            eprintln!("Invalid config {path}: {e}");
            std::process::exit(1);
        });
    }

    while i < args.len() {
        match args[i].as_str() {
            "--config" => i += 1,
            "--name-server" => {
                i += 1;
                config.name_server_address = value(&args, i, "--name-server");
            }
            "--master" => {
                i += 1;
                config.master_server_address = Some(value(&args, i, "--master"));
                config.use_name_server = false;
            }
            "--app-id" => {
                i += 1;
                config.app_id = value(&args, i, "--app-id");
            }
            "--region" => {
                i += 1;
                config.region = Some(value(&args, i, "--region"));
            }
            "--room" => {
                i += 1;
                room = Some(value(&args, i, "--room"));
            }
            "--seconds" => {
                i += 1;
                seconds = value(&args, i, "--seconds").parse().unwrap_or_else(|_| {
                    eprintln!("--seconds requires a number");
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    ProbeArgs {
        config,
        room,
        seconds,
    }
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: relay-probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <FILE>        JSON client config");
    println!("  --name-server <ADDR>   Name tier address (default: 127.0.0.1:5058)");
    println!("  --master <ADDR>        Connect straight to a master tier");
    println!("  --app-id <ID>          Application id");
    println!("  --region <CODE>        Region to authenticate for");
    println!("  --room <NAME>          Join or create this room");
    println!("  --seconds <N>          How long to stay connected (default: 10)");
    println!("  --help, -h             Show this help");
}
