use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
}

#[test]
fn decode_rejects_bad_integers() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i007e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn decode_byte_strings() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
}

#[test]
fn decode_rejects_overlong_string() {
    assert!(decode(b"10:short").is_err());
}

#[test]
fn decode_list() {
    let v = decode(b"l4:spami42ee").unwrap();
    let items = v.as_list().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_str(), Some("spam"));
    assert_eq!(items[1].as_int(), Some(42));
}

#[test]
fn decode_dict() {
    let v = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(v.get(b"cow").and_then(Value::as_str), Some("moo"));
    assert_eq!(v.get(b"spam").and_then(Value::as_str), Some("eggs"));
    assert_eq!(v.get(b"missing"), None);
}

#[test]
fn decode_rejects_integer_dict_key() {
    assert!(decode(b"di1e3:mooe").is_err());
}

#[test]
fn decode_rejects_trailing_data() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn decode_rejects_deep_nesting() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat(b'l').take(100));
    data.extend(std::iter::repeat(b'e').take(100));
    assert!(matches!(decode(&data), Err(BencodeError::TooDeep)));
}

#[test]
fn encode_scalars() {
    assert_eq!(encode(&Value::Int(42)).unwrap(), b"i42e");
    assert_eq!(encode(&Value::Int(-42)).unwrap(), b"i-42e");
    assert_eq!(encode(&Value::str("spam")).unwrap(), b"4:spam");
}

#[test]
fn encode_dict_sorts_keys() {
    let mut d = BTreeMap::new();
    d.insert(Bytes::from_static(b"zz"), Value::Int(1));
    d.insert(Bytes::from_static(b"aa"), Value::Int(2));
    assert_eq!(encode(&Value::Dict(d)).unwrap(), b"d2:aai2e2:zzi1ee");
}

#[test]
fn round_trip_nested() {
    let mut inner = BTreeMap::new();
    inner.insert(Bytes::from_static(b"id"), Value::bytes(&[0xAB; 20]));
    inner.insert(Bytes::from_static(b"port"), Value::Int(6881));
    let mut outer = BTreeMap::new();
    outer.insert(Bytes::from_static(b"a"), Value::Dict(inner));
    outer.insert(
        Bytes::from_static(b"l"),
        Value::List(vec![Value::str("x"), Value::Int(-1)]),
    );
    let original = Value::Dict(outer);

    let encoded = encode(&original).unwrap();
    assert_eq!(decode(&encoded).unwrap(), original);
}
