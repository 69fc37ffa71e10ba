//! Minimal echo server on the riptide engine.
//!
//! Run with `cargo run --example echo`, then `nc 127.0.0.1 9000`.

use std::net::{IpAddr, Ipv4Addr};

use riptide_config::logging::{init_logging, LogLevel};
use riptide_reactor::{EpollServer, Event};

fn main() -> anyhow::Result<()> {
    init_logging(LogLevel::Info);

    let server = EpollServer::new()?;
    let addr = server.listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)?;
    server.start_auto(false)?;
    println!("echo server on {addr}");

    while let Some(event) = server.recv() {
        match event {
            Event::Accepted { fd } => println!("client {fd} connected"),
            Event::Received { fd, bytes } => server.send(fd, &bytes),
            Event::ClientClosed { fd } => println!("client {fd} closed"),
            Event::Debug { message } => eprintln!("debug: {message}"),
        }
    }

    Ok(())
}
