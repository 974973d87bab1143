/*!
 * Echo Demo
 *
 * Starts an echo service on a loopback port, then runs a client loop that
 * sends a few lines and prints what comes back. Run with
 * `RUST_LOG=debug cargo run --example echo` to watch the engine work.
 */

use anyhow::Result;
use std::time::Duration;
use weft::{Application, Client, Error, Loop, LoopScope};

fn echo(s: &mut LoopScope) -> weft::Result<()> {
    loop {
        match s.until_eol() {
            Ok(line) => s.send(line)?,
            Err(Error::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug
    env_logger::init();

    let mut app = Application::new()?;
    let addr = app.add_service("127.0.0.1:0".parse()?, echo)?;
    println!("echo service on {addr}");

    app.add_loop(
        Loop::new(move |s| {
            let mut client =
                Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
            for word in ["one", "two", "three"] {
                let line = client.call(s, |s| {
                    s.send(format!("{word}\r\n"))?;
                    s.until_eol()
                })?;
                println!("echoed: {}", String::from_utf8_lossy(&line).trim_end());
            }
            client.close(s)?;
            s.halt()
        })
        .with_label("demo-client"),
    );

    app.run()?;
    Ok(())
}
