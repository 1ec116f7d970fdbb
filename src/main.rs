//! Minimal line-oriented chat over the MUSCLE message protocol.
//!
//! Run `muscle accept` in one shell and `muscle localhost --port <n>` in
//! another; lines typed into either end appear on the other.

use std::io::{self, BufRead};
use std::os::unix::io::AsRawFd;

use clap::Parser;
use color_eyre::Result;
use nix::poll::{poll, PollFd, PollFlags};

use muscle::{Event, Message, Transceiver};

const CHAT_WHAT: u32 = 666;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// "accept" to wait for an incoming connection, or a hostname to
    /// connect to
    host: String,

    /// TCP port to connect to or accept on (0 picks one in accept mode)
    #[clap(short, long, default_value_t = 2960)]
    port: u16,

    /// Prefer IPv6 over IPv4
    #[clap(long)]
    ipv6: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let mut mtt = if args.host == "accept" {
        let mtt = Transceiver::new_passive(args.port, None, args.ipv6)?;
        println!("accepting connections on port {}", mtt.port());
        mtt
    } else {
        let mtt = Transceiver::new_active(&args.host, args.port, args.ipv6)?;
        println!("connecting to {}:{} ...", args.host, args.port);
        mtt
    };
    mtt.start()?;

    let stdin = io::stdin();
    'chat: loop {
        let mut fds = [
            PollFd::new(stdin.as_raw_fd(), PollFlags::POLLIN),
            PollFd::new(mtt.notification_socket().as_raw_fd(), PollFlags::POLLIN),
        ];
        poll(&mut fds, -1).map_err(io::Error::from)?;

        if fds[1].revents().map_or(false, |r| !r.is_empty()) {
            let mut drained = [0u8; 64];
            let _ = mtt.notification_socket().recv(&mut drained);
            while let Some(event) = mtt.next_event(false) {
                match event {
                    Event::Connected => println!("[connected]"),
                    Event::Disconnected => {
                        println!("[disconnected]");
                        if args.host != "accept" {
                            break 'chat;
                        }
                    }
                    Event::Received(msg) => println!("peer: {}", msg.get_string("chat", 0)),
                }
            }
        }

        if fds[0].revents().map_or(false, |r| !r.is_empty()) {
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break; // EOF
            }
            let line = line.trim_end();
            if line == "q" {
                break;
            }
            let mut msg = Message::new(CHAT_WHAT);
            msg.put_string("chat", line);
            mtt.send(msg)?;
        }
    }

    mtt.destroy();
    println!("bye!");
    Ok(())
}
