use weft::{Buffer, Drained, Pipeline, Term};

#[test]
fn delimiter_matches_earliest_prefix() {
    let mut b = Buffer::new();
    b.set_term(Term::delimiter("X"));
    assert!(b.feed(b"a").is_none());
    assert_eq!(b.feed(b"XbXc").unwrap().as_ref(), b"aX");
    assert_eq!(b.check().unwrap().as_ref(), b"bX");
    assert!(b.check().is_none());
    assert_eq!(b.len(), 1);
}

#[test]
fn delimiter_includes_terminator() {
    let mut b = Buffer::new();
    b.feed(b"hello\r\nworld");
    b.set_term(Term::delimiter("\r\n"));
    assert_eq!(b.check().unwrap().as_ref(), b"hello\r\n");
    assert_eq!(b.len(), 5);
}

#[test]
fn term_after_feed_then_again_on_empty() {
    let mut b = Buffer::new();
    assert!(b.feed(b"abc").is_none());
    b.set_term(Term::delimiter("c"));
    assert_eq!(b.check().unwrap().as_ref(), b"abc");
    b.clear_term();
    b.set_term(Term::delimiter("c"));
    assert!(b.check().is_none());
}

#[test]
fn length_term_returns_exact_count() {
    let mut b = Buffer::new();
    b.set_term(Term::length(6));
    assert!(b.feed(b"abcd").is_none());
    assert_eq!(b.feed(b"efgh").unwrap().as_ref(), b"abcdef");
    assert_eq!(b.len(), 2);
}

#[test]
fn clear_term_keeps_bytes_and_pop_drains() {
    let mut b = Buffer::new();
    b.set_term(Term::length(100));
    b.feed(b"partial");
    b.clear_term();
    assert_eq!(b.len(), 7);
    assert_eq!(b.pop().as_ref(), b"partial");
    assert!(b.is_empty());
}

#[test]
#[should_panic]
fn conflicting_term_asserts() {
    let mut b = Buffer::new();
    b.set_term(Term::delimiter("\n"));
    b.set_term(Term::length(4));
}

#[test]
fn pipeline_orders_by_priority_then_insertion() {
    let mut p = Pipeline::new();
    p.add(&b"mid1-"[..], 5);
    p.add(&b"low-"[..], 9);
    p.add(&b"high-"[..], 1);
    p.add(&b"mid2"[..], 5);
    match p.read(1024) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b"high-mid1-mid2low-"),
        _ => panic!("expected data"),
    }
    assert!(p.is_empty());
}

#[test]
fn pipeline_splits_front_entry() {
    let mut p = Pipeline::new();
    p.add(&b"hello world"[..], 5);
    match p.read(5) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b"hello"),
        _ => panic!("expected data"),
    }
    match p.read(1024) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b" world"),
        _ => panic!("expected data"),
    }
}

#[test]
fn backup_comes_out_first() {
    let mut p = Pipeline::new();
    p.add(&b"second"[..], 5);
    p.backup(b"first-");
    match p.read(1024) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b"first-second"),
        _ => panic!("expected data"),
    }
}

#[test]
fn backup_prepends_to_earlier_backup() {
    let mut p = Pipeline::new();
    p.add(&b"tail"[..], 5);
    p.backup(b"-two-");
    p.backup(b"one");
    match p.read(1024) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b"one-two-tail"),
        _ => panic!("expected data"),
    }
}

#[test]
fn close_request_signals_after_drain() {
    let mut p = Pipeline::new();
    p.add(&b"flush me"[..], 5);
    p.close_request();
    match p.read(1024) {
        Drained::Data(d) => assert_eq!(d.as_ref(), b"flush me"),
        _ => panic!("expected data"),
    }
    assert!(matches!(p.read(1024), Drained::CloseRequested));
    // and it keeps signalling
    assert!(matches!(p.read(1024), Drained::CloseRequested));
}

#[test]
fn empty_without_close_request_is_just_empty() {
    let mut p = Pipeline::new();
    assert!(matches!(p.read(16), Drained::Empty));
}
