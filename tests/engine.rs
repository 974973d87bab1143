use crossbeam::channel::unbounded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{Application, Client, Error, FirstOf, Loop, LoopScope};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn echo_handler(s: &mut LoopScope) -> weft::Result<()> {
    loop {
        match s.until_eol() {
            Ok(line) => s.send(line)?,
            Err(Error::ConnectionClosed(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

#[test]
fn echo_roundtrip() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), echo_handler)
        .unwrap();
    app.add_loop(
        Loop::new(move |s| {
            let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
            let line = client.call(s, |s| {
                s.send("hi\r\n")?;
                s.until_eol()
            })?;
            tx.send(line).unwrap();
            client.close(s)?;
            s.halt()
        })
        .with_label("echo-client"),
    );
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap().as_ref(), b"hi\r\n");
}

#[test]
fn receive_returns_exact_byte_counts() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            s.send("abc")?;
            s.send("def")?;
            match s.until_eol() {
                Err(Error::ConnectionClosed(_)) | Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
        let (four, two) = client.call(s, |s| Ok((s.receive(4)?, s.receive(2)?)))?;
        tx.send((four, two)).unwrap();
        client.close(s)?;
        s.halt()
    }));
    app.run().unwrap();
    let (four, two) = rx.try_recv().unwrap();
    assert_eq!(four.as_ref(), b"abcd");
    assert_eq!(two.as_ref(), b"ef");
}

#[test]
fn send_priority_orders_the_wire() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            // All queued before the loop suspends, so priority decides.
            s.send_priority("third.", 9)?;
            s.send_priority("first.", 1)?;
            s.send("second.")?;
            match s.until_eol() {
                Err(Error::ConnectionClosed(_)) | Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
        let wire = client.call(s, |s| s.receive("first.second.third.".len()))?;
        tx.send(wire).unwrap();
        client.close(s)?;
        s.halt()
    }));
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap().as_ref(), b"first.second.third.");
}

#[test]
fn fire_fans_out_to_current_waiters_only() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    for name in ["w1", "w2"] {
        let tx = tx.clone();
        app.add_loop(Loop::new(move |s| {
            let value = s.wait("x")?;
            tx.send((name, *value.downcast::<i32>().ok().unwrap())).unwrap();
            Ok(())
        }));
    }
    app.add_loop(Loop::new(move |s| {
        s.sleep(Duration::from_millis(50))?;
        s.fire("x", 7i32)
    }));
    // Registers after the fire: must resume via its sleep, not the event.
    let late_tx = tx.clone();
    app.add_loop(Loop::new(move |s| {
        s.sleep(Duration::from_millis(150))?;
        let got = s.first().sleep(Duration::from_millis(200)).wait("x").dispatch()?;
        let tag = match got {
            FirstOf::Sleep => ("late-sleep", 0),
            FirstOf::Wait(_, _) => ("late-wait", -1),
            _ => ("late-other", -2),
        };
        late_tx.send(tag).unwrap();
        Ok(())
    }));
    app.run().unwrap();
    let mut got: Vec<(&str, i32)> = rx.try_iter().collect();
    got.sort();
    assert_eq!(got, vec![("late-sleep", 0), ("w1", 7), ("w2", 7)]);
}

#[test]
fn first_wait_wins_and_late_input_stays_silenced() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            s.wait("send-newline")?;
            s.send("\n")?;
            match s.until("\n") {
                Err(Error::ConnectionClosed(_)) | Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .unwrap();
    {
        let tx = tx.clone();
        app.add_loop(Loop::new(move |s| {
            let mut client =
                Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
            client.call(s, |s| {
                let got = s
                    .first()
                    .sleep(Duration::from_secs(1))
                    .wait("go")
                    .until("\n")
                    .dispatch()?;
                match got {
                    FirstOf::Wait(name, value) => {
                        tx.send(("wait", *value.downcast::<i32>().ok().unwrap())).unwrap();
                        assert_eq!(name, "go");
                    }
                    other => panic!("unexpected first outcome: {other:?}"),
                }
                // Ask the peer for a newline while nothing is armed; its
                // arrival must not disturb the next sleep.
                s.fire("send-newline", ())?;
                s.sleep(Duration::from_millis(200))?;
                tx.send(("sleep", 0)).unwrap();
                // The newline is sitting in the buffer by now.
                let line = s.until("\n")?;
                tx.send(("line", line.len() as i32)).unwrap();
                Ok(())
            })?;
            client.close(s)?;
            s.halt()
        }));
    }
    app.add_loop(Loop::new(move |s| {
        s.sleep(Duration::from_millis(100))?;
        s.fire("go", 42i32)
    }));
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap(), ("wait", 42));
    assert_eq!(rx.try_recv().unwrap(), ("sleep", 0));
    assert_eq!(rx.try_recv().unwrap(), ("line", 1));
}

#[test]
fn until_satisfied_from_buffer_is_synchronous() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            s.send("one\r\ntwo\r\n")?;
            match s.until_eol() {
                Err(Error::ConnectionClosed(_)) | Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
        let (one, two) = client.call(s, |s| Ok((s.until_eol()?, s.until_eol()?)))?;
        tx.send((one, two)).unwrap();
        client.close(s)?;
        s.halt()
    }));
    app.run().unwrap();
    let (one, two) = rx.try_recv().unwrap();
    assert_eq!(one.as_ref(), b"one\r\n");
    assert_eq!(two.as_ref(), b"two\r\n");
}

#[test]
fn sleep_zero_yields_one_turn() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    for name in ["a", "b"] {
        let tx = tx.clone();
        app.add_loop(Loop::new(move |s| {
            tx.send(format!("{name}1")).unwrap();
            s.sleep(Duration::ZERO)?;
            tx.send(format!("{name}2")).unwrap();
            Ok(())
        }));
    }
    app.run().unwrap();
    let order: Vec<String> = rx.try_iter().collect();
    assert_eq!(order, ["a1", "b1", "a2", "b2"]);
}

#[test]
fn thread_offloads_and_resumes_with_result() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    app.add_loop(Loop::new(move |s| {
        s.label("offload")?;
        let sum: i32 = s.thread(|| (1..=100).sum())?;
        let crashed = s.thread(|| -> i32 { panic!("kaboom") });
        assert!(matches!(crashed, Err(Error::Panicked(_))));
        tx.send(sum).unwrap();
        Ok(())
    }));
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap(), 5050);
}

#[test]
fn parent_death_reaches_running_child() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    app.add_loop(Loop::new(move |s| {
        let tx = tx.clone();
        s.fork_child(move |s| match s.sleep(Duration::from_secs(10)) {
            Err(Error::ParentDied) => {
                tx.send("parent-died").unwrap();
                Ok(())
            }
            _ => {
                tx.send("unexpected").unwrap();
                Ok(())
            }
        })?;
        // Give the child a turn to start and suspend before returning.
        s.sleep(Duration::from_millis(100))
    }));
    app.run().unwrap();
    assert_eq!(rx.try_recv().unwrap(), "parent-died");
}

#[test]
fn keep_alive_loop_restarts_after_crash() {
    init_logs();
    let (tx, rx) = unbounded();
    let attempts = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let mut app = Application::new().unwrap();
    {
        let attempts = Arc::clone(&attempts);
        app.add_loop(
            Loop::new(move |s| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("synthetic crash");
                }
                tx.send(started.elapsed()).unwrap();
                s.halt()
            })
            .with_label("flaky")
            .keep_alive(true),
        );
    }
    app.run().unwrap();
    let elapsed = rx.try_recv().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(
        elapsed >= Duration::from_millis(450),
        "restarted too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "restarted too late: {elapsed:?}"
    );
}

#[test]
fn remote_close_surfaces_residual_bytes() {
    init_logs();
    let (tx, rx) = unbounded();
    let mut app = Application::new().unwrap();
    let addr = app
        .add_service("127.0.0.1:0".parse().unwrap(), |s: &mut LoopScope| {
            // No newline, then the handler returns and the connection
            // flushes and closes.
            s.send("partial")
        })
        .unwrap();
    app.add_loop(Loop::new(move |s| {
        let mut client = Client::connect(s, "127.0.0.1", addr.port(), Some(Duration::from_secs(5)))?;
        let outcome = client.call(s, |s| s.until_eol());
        match outcome {
            Err(Error::ConnectionClosed(residual)) => tx.send(residual).unwrap(),
            other => panic!("expected remote close, got {other:?}"),
        }
        client.close(s)?;
        s.halt()
    }));
    app.run().unwrap();
    let residual = rx.try_recv().unwrap();
    assert_eq!(residual.unwrap().as_ref(), b"partial");
}
