//! Example Host (Client)
//!
//! Attaches to a shared OpenTPU device, sends one message and waits for the
//! emulator's reply.
//!
//! Usage: host [device] <message>
//!        host [device] --hold <secs>   (keep the device open to see Busy)

use opentpu_channel::{Channel, ChannelConfig, Session};
use std::thread;
use std::time::{Duration, Instant};

const REPLY_PREFIX: &[u8] = b"ack:";

fn open_with_retry(channel: &Channel, timeout: Duration) -> Option<Session<&Channel>> {
    let start = Instant::now();
    let mut backoff = Duration::from_millis(1);

    loop {
        match channel.open() {
            Ok(s) => return Some(s),
            Err(e) if e.is_retryable() && start.elapsed() < timeout => {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(100));
            }
            Err(e) => {
                eprintln!("[Host] Open failed: {}", e);
                return None;
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = ChannelConfig::from_env().unwrap_or_default();

    let rest = match args.as_slice() {
        [] => {
            eprintln!("Usage: host [device] <message> | host [device] --hold <secs>");
            std::process::exit(2);
        }
        [msg] => vec![msg.clone()],
        [first, tail @ ..] if first != "--hold" => {
            config.name = first.clone();
            tail.to_vec()
        }
        all => all.to_vec(),
    };

    println!("[Host] Attaching to device: {}", config.name);

    let channel = match Channel::attach(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Host] Failed to attach: {}", e);
            eprintln!("[Host] Make sure the device example is running first!");
            std::process::exit(1);
        }
    };

    if rest.first().map(String::as_str) == Some("--hold") {
        let secs: u64 = rest.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);
        match channel.open() {
            Ok(_session) => {
                println!("[Host] Holding the device for {}s", secs);
                thread::sleep(Duration::from_secs(secs));
                println!("[Host] Released");
            }
            Err(e) => eprintln!("[Host] {}", e),
        }
        return;
    }

    let message = rest.join(" ");
    let timeout = Duration::from_secs(5);

    let Some(mut session) = open_with_retry(&channel, timeout) else {
        std::process::exit(1);
    };
    match session.write_message(message.as_bytes()) {
        Ok(outcome) => println!("[Host] Sent {} bytes", outcome.accepted),
        Err(e) => {
            eprintln!("[Host] Write failed: {}", e);
            std::process::exit(1);
        }
    }
    session.close();

    let start = Instant::now();
    while start.elapsed() < timeout {
        thread::sleep(Duration::from_millis(20));

        let Some(mut session) = open_with_retry(&channel, timeout) else {
            break;
        };
        if session.pending() == 0 {
            continue;
        }

        let msg = match session.read_message() {
            Ok(msg) => msg,
            Err(e) => {
                eprintln!("[Host] Read failed: {}", e);
                std::process::exit(1);
            }
        };
        if let Some(reply) = msg.strip_prefix(REPLY_PREFIX) {
            println!(
                "[Host] Reply after {:?}: {}",
                start.elapsed(),
                String::from_utf8_lossy(reply)
            );
            return;
        }

        // Our request is still waiting for the emulator
        let _ = session.write_message(&msg);
    }

    eprintln!("[Host] No reply within {:?}", timeout);
    std::process::exit(1);
}
