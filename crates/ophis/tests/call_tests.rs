//! Calls, starcalls, argument building and host-exposed functions.

use ophis::{PyRef, Result, Session};

fn py() -> Session {
    Session::new().expect("python3 must be available for integration tests")
}

/// `eval(source, {})` — a quick way to get a lambda to call.
fn eval(session: &Session, source: &str) -> PyRef {
    let globals = session.dict().unwrap();
    session
        .global("builtins.eval")
        .unwrap()
        .call(session.args().arg(source).arg(&globals))
        .unwrap()
}

#[test]
fn plain_positional_call() {
    let session = py();
    let spy = eval(&session, "lambda *args, **kwargs: repr(args) + repr(kwargs)");
    let result = spy.call(session.args().arg(1isize).arg(2isize).arg(3isize)).unwrap();
    assert_eq!(result.to_text().unwrap(), "(1, 2, 3){}");
}

#[test]
fn method_calls() {
    let session = py();
    let sep = session.str(" ").unwrap();
    let words = session.tuple(&[&session.str("hello").unwrap(), &session.str("world").unwrap()]).unwrap();
    let joined = sep.method1("join", words).unwrap();
    assert_eq!(joined.to_text().unwrap(), "hello world");
    assert_eq!(joined.method0("upper").unwrap().to_text().unwrap(), "HELLO WORLD");
}

#[test]
fn star_splats_expand_in_order() {
    let session = py();
    let spy = eval(&session, "lambda *args, **kwargs: repr(args) + repr(kwargs)");
    let letters = session.str("xyz").unwrap();
    let result = spy.call(session.args().star(&letters)).unwrap();
    assert_eq!(result.to_text().unwrap(), "('x', 'y', 'z'){}");

    let numbers = session
        .tuple(&[&session.int(1).unwrap(), &session.int(2).unwrap(), &session.int(3).unwrap()])
        .unwrap();
    let result = spy
        .call(session.args().arg("ab").star(&letters).arg("cd").star(&numbers).arg("ef"))
        .unwrap();
    assert_eq!(result.to_text().unwrap(), "('ab', 'x', 'y', 'z', 'cd', 1, 2, 3, 'ef'){}");
}

#[test]
fn keyword_arguments_keep_insertion_order() {
    let session = py();
    let spy = eval(&session, "lambda *args, **kwargs: repr(args) + repr(kwargs)");
    let result = spy
        .call(session.args().kw("a", 1isize).kw("c", 2isize).kw("b", 3isize))
        .unwrap();
    assert_eq!(result.to_text().unwrap(), "(){'a': 1, 'c': 2, 'b': 3}");
}

#[test]
fn mixed_starcall_matches_python_exactly() {
    let session = py();
    let spy = eval(&session, "lambda *args, **kwargs: repr(args) + repr(kwargs)");

    let letters = session.str("xyz").unwrap();
    let numbers = session
        .tuple(&[&session.int(1).unwrap(), &session.int(2).unwrap(), &session.int(3).unwrap()])
        .unwrap();
    let first_map = session.dict().unwrap();
    first_map.setitem("d", 3isize).unwrap();
    first_map.setitem("f", 2isize).unwrap();
    first_map.setitem("e", 1isize).unwrap();
    let second_map = session.dict().unwrap();
    second_map.setitem("g", 5isize).unwrap();

    let result = spy
        .call(
            session
                .args()
                .arg("ab")
                .star(&letters)
                .arg("cd")
                .star(&numbers)
                .arg("ef")
                .kw("a", 1isize)
                .star_star(&first_map)
                .kw("c", 2isize)
                .star_star(&second_map)
                .kw("b", 3isize),
        )
        .unwrap();
    assert_eq!(
        result.to_text().unwrap(),
        "('ab', 'x', 'y', 'z', 'cd', 1, 2, 3, 'ef')\
         {'a': 1, 'd': 3, 'f': 2, 'e': 1, 'c': 2, 'g': 5, 'b': 3}"
    );
}

#[test]
fn host_function_driven_by_remote_map() {
    let session = py();
    let square = session
        .function(|_session, args: Vec<PyRef>| args[0].mul(&args[0]))
        .unwrap();
    let range = session.global("builtins.range").unwrap().call1(5isize).unwrap();
    let mapped = session.global("builtins.map").unwrap().call(session.args().arg(square).arg(range)).unwrap();
    let result = session.global("builtins.list").unwrap().call1(mapped).unwrap();
    assert_eq!(result.str_().unwrap().to_text().unwrap(), "[0, 1, 4, 9, 16]");
}

#[test]
fn host_function_with_two_arguments() {
    let session = py();
    let backwards = session
        .function(|_session, args: Vec<PyRef>| args[1].add(&args[0]))
        .unwrap();
    let reduce = session.global("functools.reduce").unwrap();
    let result = reduce.call(session.args().arg(backwards).arg("sdrawkcab")).unwrap();
    assert_eq!(result.to_text().unwrap(), "backwards");
}

#[test]
fn host_function_returning_fresh_values() {
    let session = py();
    let greet = session
        .function(|session: &Session, args: Vec<PyRef>| {
            let name = args[0].to_text()?;
            session.str(&format!("hi {name}"))
        })
        .unwrap();
    let result = greet.call1("ada").unwrap();
    assert_eq!(result.to_text().unwrap(), "hi ada");
}

#[test]
fn reentrant_dispatch_nests_host_and_interpreter_frames() {
    let session = py();
    // add_one is an interpreter function backed by a host function.
    let add_one = session
        .function(|_session, args: Vec<PyRef>| args[0].add(1isize))
        .unwrap();
    // The outer host function calls back into the interpreter, which calls
    // add_one, which re-enters the host — all while the outer call frame
    // is still being serviced.
    let add_one_inner = add_one.dup().unwrap();
    let outer = session
        .function(move |_session, args: Vec<PyRef>| {
            let doubled = args[0].mul(2isize)?;
            add_one_inner.call1(doubled)
        })
        .unwrap();
    let range = session.global("builtins.range").unwrap().call1(3isize).unwrap();
    let mapped = session.global("builtins.map").unwrap().call(session.args().arg(outer).arg(range)).unwrap();
    let result = session.global("builtins.list").unwrap().call1(mapped).unwrap();
    assert_eq!(result.str_().unwrap().to_text().unwrap(), "[1, 3, 5]");
}

#[test]
fn each_nested_command_sees_its_own_reply() -> Result<()> {
    let session = py();
    // Three levels of host work per element, each issuing its own remote
    // commands whose replies must not leak across frames.
    let inner = session.function(|session: &Session, args: Vec<PyRef>| {
        let value = args[0].to_int()?;
        session.int(value * 10)
    })?;
    let inner_handle = inner.dup()?;
    let middle = session.function(move |_session, args: Vec<PyRef>| {
        let shifted = args[0].add(1isize)?;
        inner_handle.call1(shifted)
    })?;
    let middle_handle = middle.dup()?;
    let outer = session.function(move |_session, args: Vec<PyRef>| {
        let through = middle_handle.call1(&args[0])?;
        through.add(5isize)
    })?;
    let result = outer.call1(3isize)?;
    // ((3 + 1) * 10) + 5
    assert_eq!(result.to_int()?, 45);
    Ok(())
}

#[test]
fn bound_functions_survive_many_collections() {
    let session = py();
    // Repeatedly create short-lived interpreter functions so their host
    // slots are dropped and recycled by the free list.
    for round in 0..20isize {
        let constant = session
            .function(move |session: &Session, _args| session.int(round))
            .unwrap();
        assert_eq!(constant.call0().unwrap().to_int().unwrap(), round);
        drop(constant);
        // Nudge the collector so drop notifications actually flow.
        session.global("gc.collect").unwrap().call0().unwrap();
    }
    assert_eq!(session.int(1).unwrap().to_int().unwrap(), 1);
}
