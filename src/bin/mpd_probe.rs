//! MPD Probe CLI
//!
//! Connects to a server, prints its version and detected capabilities, then
//! runs the given commands and prints their raw responses.
//!
//! Usage:
//!   mpd-probe <host[:port]> [--password <pw>] [command...]
//!   mpd-probe caps <host[:port]> [--password <pw>]
//!
//! Without commands, `status` is sent.

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::process;

use mpd_link::protocol::{parser, MpdError, Transport, TransportTimeouts, DEFAULT_PORT};

struct Options {
    host: String,
    port: u16,
    password: Option<String>,
    commands: Vec<String>,
    caps_only: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut rest = args.iter();
    let mut caps_only = false;
    let mut address = rest.next().ok_or_else(|| anyhow!("missing host"))?;
    if address == "caps" {
        caps_only = true;
        address = rest.next().ok_or_else(|| anyhow!("missing host"))?;
    }

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .with_context(|| format!("invalid port '{}'", port))?,
        ),
        None => (address.clone(), DEFAULT_PORT),
    };
    if host.is_empty() {
        bail!("empty host");
    }

    let mut password = None;
    let mut commands = Vec::new();
    while let Some(arg) = rest.next() {
        if arg == "--password" {
            password = Some(
                rest.next()
                    .ok_or_else(|| anyhow!("--password needs a value"))?
                    .clone(),
            );
        } else {
            commands.push(arg.clone());
        }
    }
    if commands.is_empty() {
        commands.push("status".to_string());
    }

    Ok(Options {
        host,
        port,
        password,
        commands,
        caps_only,
    })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || matches!(args[0].as_str(), "help" | "--help" | "-h") {
        print_usage();
        process::exit(if args.is_empty() { 1 } else { 0 });
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = run(options).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(options: Options) -> Result<()> {
    let mut transport = Transport::new(TransportTimeouts::default());
    transport
        .connect(&options.host, options.password.as_deref(), options.port)
        .await
        .with_context(|| format!("connecting to {}:{}", options.host, options.port))?;

    let caps = transport.capabilities().clone();
    println!("MPD {}", caps.version);
    println!("  idle:                 {}", caps.has_idle);
    println!("  ranged playlistinfo:  {}", caps.has_ranged_current_playlist);
    println!("  searchadd:            {}", caps.has_search_add);
    println!("  list group:           {}", caps.has_list_group);
    println!("  list filtering:       {}", caps.has_list_filtering);
    println!("  musicbrainz tags:     {}", caps.has_musicbrainz_tags);
    println!("  albumartist tag:      {}", caps.has_tag_albumartist);
    println!("  delete range:         {}", caps.has_current_playlist_remove_range);
    println!("  commands:             {}", caps.commands.len());
    println!("  tag types:            {}", caps.tag_types.join(", "));

    if !options.caps_only {
        for command in &options.commands {
            println!();
            println!("> {}", command);
            match transport.command(command).await {
                Ok(lines) => {
                    for line in &lines {
                        println!("{}", line);
                    }
                    println!("OK ({} lines)", lines.len());
                    if command == "status" {
                        let status = parser::parse_status(&lines);
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    }
                }
                Err(MpdError::Server(e)) => {
                    if transport.capabilities_mut().observe_error(&e.message) {
                        println!("(Mopidy detected)");
                    }
                    println!("ACK {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    transport.send_close().await;
    Ok(())
}

fn print_usage() {
    eprintln!("MPD Probe - Inspect an MPD server");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  mpd-probe <host[:port]> [--password <pw>] [command...]");
    eprintln!("  mpd-probe caps <host[:port]> [--password <pw>]");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  mpd-probe localhost");
    eprintln!("  mpd-probe music.lan:6601 --password secret currentsong outputs");
    eprintln!("  mpd-probe caps 192.168.1.20");
}
