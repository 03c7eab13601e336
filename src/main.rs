mod packet;
mod session;
mod transport;
mod util;

use colored::*;

use clap::{App, AppSettings, Arg};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use packet::{DecodeError, ProbeResult, ECHO_PACKET_LEN};
use session::{Report, Session, SessionConfig};
use transport::RawSocket;

/// Renders per-probe outcomes on the console, one line each, in the
/// traditional ping format.
struct ConsoleReport;

impl Report for ConsoleReport {
    fn probe(&mut self, result: &ProbeResult) {
        let hostname = dns_lookup::lookup_addr(&result.source)
            .unwrap_or_else(|_| result.source.to_string());

        println!(
            "{} bytes from {} ({}): icmp_seq={} ttl={} time={}ms",
            result.size,
            hostname.yellow(),
            result.source,
            result.sequence.to_string().bold(),
            result.ttl.to_string().bold(),
            format!("{:.2}", result.rtt_ms).bold()
        );
    }

    fn discard(&mut self, sequence: u16, reason: &DecodeError) {
        println!("icmp_seq={} {}: {}", sequence, "discarded".dimmed(), reason);
    }

    fn timeout(&mut self, sequence: u16) {
        println!("icmp_seq={} {}", sequence, "timed out".red());
    }

    fn transport_error(&mut self, err: &io::Error) {
        eprintln!("Transport error: {}", err);
    }
}

fn main() {
    let matches = App::new("rping")
        .setting(AppSettings::ColoredHelp)
        .version("v0.1")
        .about("An ICMP echo (`ping`) utility: sends echo requests over a raw socket,\nmatches the replies back to this session and reports per-probe round-trip\ntimes plus a final loss summary.")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IP address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("count")
            .help("Number of echo requests to send (Default 5)")
            .short("c")
            .takes_value(true))
        .arg(Arg::with_name("timeout")
            .help("Set how long to wait for each reply before timing out (Default 5s)")
            .short("W")
            .takes_value(true))
        .arg(Arg::with_name("interval")
            .help("Set how long to wait in between probes (Default 1s)")
            .short("I")
            .takes_value(true))
        .arg(Arg::with_name("ttl")
            .help("Set ttl on outgoing packets")
            .short("t")
            .takes_value(true))
        .arg(Arg::with_name("count-unvalidated")
            .help("Count every inbound datagram as received, before validation (the historical ping behavior)")
            .long("count-unvalidated"))
        .get_matches();

    let destination_host = matches.value_of("DESTINATION").unwrap();
    let destination = util::resolve_dest(destination_host).expect("Error resolving destination");

    let count = matches.value_of("count").unwrap_or("5");
    let count = count.parse::<u32>().expect("Invalid count (ex: 5) : ");

    let timeout = matches.value_of("timeout").unwrap_or("5s");
    let timeout = humantime::parse_duration(timeout).expect("Invalid duration for timeout (ex: 1s, 400ms, 1m) : ");

    let interval = matches.value_of("interval").unwrap_or("1s");
    let interval = humantime::parse_duration(interval).expect("Invalid duration for interval (ex: 1s, 400ms, 1m) : ");

    let ttl = matches.value_of("ttl").map(|ttl| ttl.parse::<u32>().expect("Invalid ttl: (ex: 64) : "));

    let socket = RawSocket::new(destination).expect("Error opening raw socket : ");
    if let Some(t) = ttl {
        socket.set_ttl(t).expect("Error setting ttl : ");
    }

    println!("{} {} ({}) : {} bytes of data", "PING".cyan(), destination_host.bold(), destination, ECHO_PACKET_LEN);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    // Replies carry this in their identifier word; anything else on the
    // shared raw socket belongs to another pinger on this host.
    let identifier = (std::process::id() & 0xFFFF) as u16;

    let config = SessionConfig {
        count,
        interval,
        timeout,
        count_unvalidated: matches.is_present("count-unvalidated"),
    };

    let mut session = Session::new(socket, identifier, config, running);
    let stats = session.run(&mut ConsoleReport, thread::sleep);

    println!(""); // New line
    println!("{} {} {} {}", "===".yellow(), destination_host.bold(), "ping statistics".cyan(), "===".yellow());
    println!("{} packets transmitted, {} received, {}% packet loss",
        stats.transmitted.to_string().bold(),
        stats.received.to_string().bold(),
        stats.loss_percent().to_string().bold());
}
