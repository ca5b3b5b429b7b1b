//! Values, conversions, numerics, operators, attributes, items, iteration.

use ophis::{Error, Session};

fn py() -> Session {
    Session::new().expect("python3 must be available for integration tests")
}

#[test]
fn int_round_trip() {
    let session = py();
    for value in [0, 1, -1, 42, -42, isize::MAX, isize::MIN] {
        assert_eq!(session.int(value).unwrap().to_int().unwrap(), value);
    }
}

#[test]
fn str_round_trip_keeps_utf8() {
    let session = py();
    for text in ["", "hello", "héllo π", "snake: \u{1f40d}"] {
        let object = session.str(text).unwrap();
        assert_eq!(object.to_text().unwrap(), text);
        assert_eq!(object.len().unwrap(), text.chars().count() as isize);
    }
}

#[test]
fn bytes_round_trip_is_opaque() {
    let session = py();
    let data: &[u8] = &[0, 1, 0x9f, 0x92, 0x96, 0xff];
    let object = session.bytes(data).unwrap();
    assert_eq!(object.to_bytes().unwrap(), data);
    assert_eq!(object.type_().unwrap().getattr("__name__").unwrap().to_text().unwrap(), "bytes");
}

#[test]
fn bool_and_none_singletons() {
    let session = py();
    assert!(session.bool(true).unwrap().truthy().unwrap());
    assert!(!session.bool(false).unwrap().truthy().unwrap());
    let none = session.none().unwrap();
    let none_again = session.none().unwrap();
    assert!(none.is_(&none_again).unwrap());
    assert!(!none.truthy().unwrap());
}

#[test]
fn tuple_and_list_construction() {
    let session = py();
    let one = session.int(1).unwrap();
    let two = session.str("two").unwrap();
    let tuple = session.tuple(&[&one, &two]).unwrap();
    assert_eq!(tuple.len().unwrap(), 2);
    assert_eq!(tuple.getitem(0isize).unwrap().to_int().unwrap(), 1);
    assert_eq!(tuple.str_().unwrap().to_text().unwrap(), "(1, 'two')");

    let list = session.list(&[&one, &two]).unwrap();
    list.method1("append", 3isize).unwrap();
    assert_eq!(list.len().unwrap(), 3);
    assert_eq!(list.str_().unwrap().to_text().unwrap(), "[1, 'two', 3]");
}

#[test]
fn dict_items() {
    let session = py();
    let dict = session.dict().unwrap();
    dict.setitem("answer", 42isize).unwrap();
    assert!(dict.contains("answer").unwrap());
    assert_eq!(dict.getitem("answer").unwrap().to_int().unwrap(), 42);
    dict.delitem("answer").unwrap();
    assert!(!dict.contains("answer").unwrap());
    let error = dict.getitem("answer").unwrap_err();
    assert!(matches!(error, Error::Raised(_)));
}

#[test]
fn attributes_on_a_namespace() {
    let session = py();
    let namespace = session.global("types.SimpleNamespace").unwrap().call0().unwrap();
    assert!(!namespace.hasattr("x").unwrap());
    namespace.setattr("x", 5isize).unwrap();
    assert!(namespace.hasattr("x").unwrap());
    assert_eq!(namespace.getattr("x").unwrap().to_int().unwrap(), 5);
    namespace.delattr("x").unwrap();
    assert!(!namespace.hasattr("x").unwrap());
}

#[test]
fn float_round_trip_is_bit_exact() {
    let session = py();
    for value in [
        0.0,
        -0.0,
        1.0,
        1.1,
        -42.0,
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::MAX,
        f64::MIN_POSITIVE,
        5e-324,
    ] {
        let object = session.float(value).unwrap();
        assert_eq!(object.to_f64().unwrap().to_bits(), value.to_bits(), "{value}");
    }
    // The representable neighbourhood of 1.1.
    for offset in 0..3u64 {
        let value = f64::from_bits(1.1f64.to_bits() - 1 + offset);
        let object = session.float(value).unwrap();
        assert_eq!(object.to_f64().unwrap().to_bits(), value.to_bits());
    }
    let nan = session.float(f64::NAN).unwrap();
    assert!(nan.to_f64().unwrap().is_nan());
}

#[test]
fn floats_are_real_interpreter_floats() {
    let session = py();
    let half = session.float(0.5).unwrap();
    assert_eq!(half.type_().unwrap().getattr("__name__").unwrap().to_text().unwrap(), "float");
    assert_eq!(half.str_().unwrap().to_text().unwrap(), "0.5");
}

#[test]
fn integer_division_promotes_to_float() {
    let session = py();
    let one = session.int(1).unwrap();
    let half = one.truediv(2isize).unwrap();
    assert_eq!(half.type_().unwrap().getattr("__name__").unwrap().to_text().unwrap(), "float");
    assert_eq!(half.to_f64().unwrap(), 0.5);
}

#[test]
fn power_via_the_operator_table() {
    let session = py();
    let three = session.int(3).unwrap();
    let result = three.pow(4isize).unwrap();
    assert_eq!(result.type_().unwrap().getattr("__name__").unwrap().to_text().unwrap(), "int");
    assert_eq!(result.to_int().unwrap(), 81);
}

#[test]
fn arithmetic_and_comparisons() {
    let session = py();
    let two = session.int(2).unwrap();
    assert_eq!(two.add(3isize).unwrap().to_int().unwrap(), 5);
    assert_eq!(two.sub(7isize).unwrap().to_int().unwrap(), -5);
    assert_eq!(two.mul(21isize).unwrap().to_int().unwrap(), 42);
    assert_eq!(two.floordiv(2isize).unwrap().to_int().unwrap(), 1);
    assert_eq!(two.mod_(2isize).unwrap().to_int().unwrap(), 0);
    assert_eq!(two.lshift(4isize).unwrap().to_int().unwrap(), 32);
    assert_eq!(two.neg().unwrap().to_int().unwrap(), -2);
    assert!(two.lt(3isize).unwrap().truthy().unwrap());
    assert!(two.ge(2isize).unwrap().truthy().unwrap());
    assert!(two.eq_(2isize).unwrap().truthy().unwrap());
    assert!(two.ne_(3isize).unwrap().truthy().unwrap());
    assert!(two.not_().unwrap().is_(&session.bool(false).unwrap()).unwrap());
}

#[test]
fn string_operators() {
    let session = py();
    let text = session.str("ab").unwrap();
    assert_eq!(text.add("cd").unwrap().to_text().unwrap(), "abcd");
    assert_eq!(text.mul(3isize).unwrap().to_text().unwrap(), "ababab");
    assert_eq!(
        session.str("%s-%s").unwrap().mod_(session.tuple(&[&session.int(1).unwrap(), &session.int(2).unwrap()]).unwrap()).unwrap().to_text().unwrap(),
        "1-2"
    );
    assert!(text.contains("a").unwrap());
    assert!(!text.contains("z").unwrap());
}

#[test]
fn in_place_operators_rebind() {
    let session = py();
    let list = session.list(&[&session.int(1).unwrap()]).unwrap();
    let list = list.iadd(session.tuple(&[&session.int(2).unwrap()]).unwrap()).unwrap();
    assert_eq!(list.str_().unwrap().to_text().unwrap(), "[1, 2]");

    let counter = session.int(5).unwrap();
    let counter = counter.isub(2isize).unwrap();
    assert_eq!(counter.to_int().unwrap(), 3);
}

#[test]
fn iteration_stops_cleanly() {
    let session = py();
    let range = session.global("builtins.range").unwrap().call1(5isize).unwrap();
    let mut collected = Vec::new();
    for item in range.iter().unwrap() {
        collected.push(item.unwrap().to_int().unwrap());
    }
    assert_eq!(collected, [0, 1, 2, 3, 4]);

    let mut chars = Vec::new();
    for item in session.str("abc").unwrap().iter().unwrap() {
        chars.push(item.unwrap().to_text().unwrap());
    }
    assert_eq!(chars, ["a", "b", "c"]);
}

#[test]
fn exhausted_iterator_keeps_reporting_none() {
    let session = py();
    let range = session.global("builtins.range").unwrap().call1(1isize).unwrap();
    let mut iterator = range.iter().unwrap();
    assert!(iterator.next().is_some());
    assert!(iterator.next().is_none());
    assert!(iterator.next().is_none());
}

#[test]
fn big_integers_cross_as_text() {
    let session = py();
    let digits = "123456789012345678901234567890";
    let big = session.big_int(digits).unwrap();
    assert_eq!(big.str_().unwrap().to_text().unwrap(), digits);
    let bigger = big.add(1isize).unwrap();
    assert_eq!(bigger.str_().unwrap().to_text().unwrap(), "123456789012345678901234567891");
    // Too wide for the machine word: the read itself reports the overflow.
    let error = big.to_int().unwrap_err();
    assert!(matches!(error, Error::Raised(_)), "got {error:?}");
}

#[test]
fn reading_an_int_from_a_non_int_raises() {
    let session = py();
    let text = session.str("nope").unwrap();
    let error = text.to_int().unwrap_err();
    match error {
        Error::Raised(exception) => assert!(exception.summary().contains("TypeError"), "{}", exception.summary()),
        other => panic!("expected a raised exception, got {other:?}"),
    }
}

#[test]
fn dotted_global_lookup() {
    let session = py();
    let join = session.global("os.path.join").unwrap();
    let joined = join.call(session.args().arg("a").arg("b")).unwrap();
    assert_eq!(joined.to_text().unwrap(), "a/b");

    // Trailing `.*` names the module itself.
    let module = session.global("re.*").unwrap();
    assert_eq!(module.getattr("__name__").unwrap().to_text().unwrap(), "re");

    let error = session.global("no.such.module").unwrap_err();
    assert!(matches!(error, Error::Raised(_)));
}

#[test]
fn dup_is_the_same_object() {
    let session = py();
    let list = session.list(&[]).unwrap();
    let alias = list.dup().unwrap();
    assert!(list.is_(&alias).unwrap());
    alias.method1("append", 1isize).unwrap();
    assert_eq!(list.len().unwrap(), 1);
}

#[test]
fn to_object_conversions() {
    let session = py();
    assert_eq!(session.to_object(3isize).unwrap().to_int().unwrap(), 3);
    assert_eq!(session.to_object("text").unwrap().to_text().unwrap(), "text");
    assert_eq!(session.to_object(vec![1u8, 2]).unwrap().to_bytes().unwrap(), [1, 2]);
    assert!(session.to_object(true).unwrap().truthy().unwrap());
    assert_eq!(session.to_object(0.25f64).unwrap().to_f64().unwrap(), 0.25);

    // Borrowed proxies are duplicated into an independent handle of the
    // same object.
    let original = session.list(&[]).unwrap();
    let copy = session.to_object(&original).unwrap();
    assert!(original.is_(&copy).unwrap());
}
