use crossbeam::channel::unbounded;
use mio::net::TcpStream;
use mio::Interest;
use std::io;
use std::time::{Duration, Instant};
use weft::{
    Application, Client, Error, Handshake, HandshakeStep, Loop, LoopScope, Transport,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn connect_refused_surfaces_as_connect_error() {
    init_logs();
    // Bind then drop a listener so the port is very likely closed.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    app.add_loop(Loop::new(move |s| {
        let started = Instant::now();
        let outcome = Client::connect(s, "127.0.0.1", port, Some(Duration::from_secs(2)));
        let tag = match outcome {
            Err(Error::Connect(_)) => "refused",
            Err(Error::ConnectTimeout) => "timeout",
            Err(_) => "other-error",
            Ok(_) => "connected",
        };
        tx.send((tag, started.elapsed())).unwrap();
        Ok(())
    }));
    app.run().unwrap();
    let (tag, elapsed) = rx.try_recv().unwrap();
    assert_eq!(tag, "refused");
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
}

#[test]
fn connect_timeout_fires_within_bounds() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    app.add_loop(Loop::new(move |s| {
        let started = Instant::now();
        // 10.255.255.1 is normally black-holed, which exercises the
        // timeout path; a network that answers with an unreachable
        // surfaces as a prompt connect error instead.
        let outcome = Client::connect(s, "10.255.255.1", 65000, Some(Duration::from_millis(150)));
        let tag = match outcome {
            Err(Error::ConnectTimeout) | Err(Error::Connect(_)) => "failed",
            Err(_) => "other-error",
            Ok(_) => "connected",
        };
        tx.send((tag, started.elapsed())).unwrap();
        Ok(())
    }));
    app.run().unwrap();
    let (tag, elapsed) = rx.try_recv().unwrap();
    assert_eq!(tag, "failed");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn queued_data_flushes_before_close() {
    init_logs();
    // Large enough to force partial sends and pushback on loopback.
    const PAYLOAD: usize = 1 << 20;
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), move |s: &mut LoopScope| {
            let body = s.receive(PAYLOAD)?;
            s.fire("received", body.len())?;
            Ok(())
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
        client.call(s, |s| s.send(vec![0x5au8; PAYLOAD]))?;
        client.close(s)?;
        let got = s.wait("received")?;
        tx.send(*got.downcast::<usize>().ok().unwrap()).unwrap();
        s.halt()
    }));
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap(), PAYLOAD);
}

/// Handshake double that completes immediately, standing in for a TLS
/// provider to exercise the handshake path of connect.
struct Passthrough;

impl Handshake for Passthrough {
    fn drive(&mut self, stream: TcpStream) -> HandshakeStep {
        HandshakeStep::Done(Box::new(stream) as Box<dyn Transport>)
    }
}

/// Handshake double that asks for one more writable edge first.
struct SlowStart {
    stepped: bool,
}

impl Handshake for SlowStart {
    fn drive(&mut self, stream: TcpStream) -> HandshakeStep {
        if self.stepped {
            HandshakeStep::Done(Box::new(stream) as Box<dyn Transport>)
        } else {
            self.stepped = true;
            HandshakeStep::Pending {
                stream,
                interest: Interest::WRITABLE,
            }
        }
    }
}

/// Handshake double that always fails.
struct Refusenik;

impl Handshake for Refusenik {
    fn drive(&mut self, _stream: TcpStream) -> HandshakeStep {
        HandshakeStep::Failed {
            error: io::Error::new(io::ErrorKind::InvalidData, "bad certificate"),
        }
    }
}

#[test]
fn handshake_paths_complete_and_fail() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            match s.until_eol() {
                Ok(line) => s.send(line),
                Err(Error::ConnectionClosed(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        for (name, handshake) in [
            ("passthrough", Box::new(Passthrough) as Box<dyn Handshake>),
            ("slow-start", Box::new(SlowStart { stepped: false })),
        ] {
            let mut client = Client::connect_with(
                s,
                "127.0.0.1",
                addr.port(),
                Some(Duration::from_secs(5)),
                handshake,
            )?;
            let line = client.call(s, |s| {
                s.send("ping\r\n")?;
                s.until_eol()
            })?;
            assert_eq!(line.as_ref(), b"ping\r\n");
            client.close(s)?;
            tx.send(name).unwrap();
        }
        let failed = Client::connect_with(
            s,
            "127.0.0.1",
            addr.port(),
            Some(Duration::from_secs(5)),
            Box::new(Refusenik),
        );
        assert!(matches!(failed, Err(Error::Connect(_))));
        tx.send("refused").unwrap();
        s.halt()
    }));
    app.run().unwrap();
    let got: Vec<&str> = rx.try_iter().collect();
    assert_eq!(got, ["passthrough", "slow-start", "refused"]);
}
