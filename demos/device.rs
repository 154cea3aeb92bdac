//! Example Device (Emulator side)
//!
//! Creates a shared OpenTPU device and plays the emulator: every request a
//! host leaves in the channel is answered with an `ack:` reply.

use opentpu_channel::{Channel, ChannelConfig, ChannelError};
use std::thread;
use std::time::Duration;

const REPLY_PREFIX: &[u8] = b"ack:";

fn main() {
    let mut config = match ChannelConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Device] Bad configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(name) = std::env::args().nth(1) {
        config.name = name;
    }

    println!("╔══════════════════════════════════════════════════╗");
    println!("║          OpenTPU Device (Emulator side)          ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();
    println!("[Device] Creating device: {}", config.name);
    println!("[Device] Emulator: {}", config.emulator);

    let channel = match Channel::create(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Device] Failed to create device: {}", e);
            std::process::exit(1);
        }
    };

    println!("[Device] Waiting for requests... (Ctrl+C to quit)");
    println!();

    let mut served = 0u64;

    loop {
        thread::sleep(Duration::from_millis(50));

        let mut session = match channel.open() {
            Ok(s) => s,
            Err(ChannelError::Busy) => continue,
            Err(e) => {
                eprintln!("[Device] Open failed: {}", e);
                break;
            }
        };

        if session.pending() == 0 {
            continue;
        }

        let request = match session.read_message() {
            Ok(request) => request,
            Err(e) => {
                eprintln!("[Device] Read failed: {}", e);
                continue;
            }
        };
        if request.starts_with(REPLY_PREFIX) {
            // Reply not collected yet, leave it for the host
            let _ = session.write_message(&request);
            continue;
        }

        served += 1;
        println!(
            "[Device] Request #{}: {}",
            served,
            String::from_utf8_lossy(&request)
        );

        let mut reply = REPLY_PREFIX.to_vec();
        reply.extend_from_slice(&request);
        reply.truncate(opentpu_channel::MESSAGE_CAPACITY);

        if let Err(e) = session.write_message(&reply) {
            eprintln!("[Device] Reply failed: {}", e);
        }
    }

    println!();
    println!("[Device] Served {} requests", served);
}
