use serde_derive::Deserialize;

use super::decode_bytes;
use crate::value::Value;
use crate::Error;

#[test]
fn decode_to_num() {
    let r: i64 = decode_bytes(b"i666e").unwrap();
    assert_eq!(r, 666);

    let r: i64 = decode_bytes(b"i-42e").unwrap();
    assert_eq!(r, -42);
}

#[test]
fn decode_to_string() {
    let r: String = decode_bytes(b"3:yes").unwrap();
    assert_eq!(r, "yes");
}

#[test]
fn decode_to_struct() {
    let b = b"d1:xi1111e1:y3:dog1:z2:yoe";
    #[derive(PartialEq, Debug, Deserialize)]
    struct Fake {
        y: String,
        x: i64,
        #[serde(default)]
        z: Option<String>,
        #[serde(default)]
        a: Option<String>,
    }
    let r: Fake = decode_bytes(b).unwrap();
    assert_eq!(
        r,
        Fake { x: 1111, y: "dog".to_string(), z: Some("yo".to_string()), a: None },
    );
}

#[test]
fn decode_to_value() {
    let b = b"d1:xi1111e1:y3:doge";
    let r: Value = decode_bytes(b).unwrap();
    let dict = r.as_dict().unwrap();
    assert_eq!(dict.get(b"x".as_slice()).unwrap().as_int(), Some(1111));
    assert_eq!(dict.get(b"y".as_slice()).unwrap().as_bytes(), Some(b"dog".as_slice()));
}

#[test]
fn deserialize_to_vec() {
    let r: Vec<i64> = decode_bytes(b"li666ee").unwrap();
    assert_eq!(r, [666]);
}

#[test]
fn rejects_out_of_order_keys() {
    let err = decode_bytes::<Value>(b"d3:foo3:bar3:bazi1ee").unwrap_err();
    assert!(matches!(err, Error::UnsortedKeys(..)));
}

#[test]
fn rejects_duplicate_keys() {
    let err = decode_bytes::<Value>(b"d3:bari1e3:bari2ee").unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(..)));
}

#[test]
fn tolerant_mode_accepts_out_of_order_keys() {
    use super::{decode_bytes_with_config, DecoderConfig};
    let cfg = DecoderConfig { tolerant: true, ..Default::default() };
    let r: Value = decode_bytes_with_config(b"d3:foo3:bar3:bazi1ee", cfg).unwrap();
    assert!(r.as_dict().is_some());
}

#[test]
fn rejects_excessive_nesting() {
    let mut encoded = vec![b'l'; 64];
    encoded.extend(std::iter::repeat(b'e').take(64));
    let err = decode_bytes::<Value>(&encoded).unwrap_err();
    assert!(matches!(err, Error::NestingTooDeep(_)));
}
