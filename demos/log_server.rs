//! A loopback server that logs everything its peers send.
//!
//! Run with `cargo run --example log-server`, then poke it with
//! `nc 127.0.0.1 7878`.

use std::io;

use woodpeckers::{Reactor, ServerDescriptor};

fn main() -> io::Result<()> {
    tracing_subscriber::fmt().init();

    let mut reactor = Reactor::new()?;
    reactor.add_server(
        ServerDescriptor::new(1, 7878)
            .did_accept(|_, server, peer, remote| {
                println!("server {server}: peer {peer} connected from {remote}");
            })
            .did_receive_data(|_, _, peer, bytes| {
                println!("peer {peer}: {}", String::from_utf8_lossy(bytes).trim_end());
            })
            .peer_did_disconnect(|_, _, peer| {
                println!("peer {peer} disconnected");
            }),
    )?;

    reactor.run()
}
