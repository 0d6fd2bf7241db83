//! Trailer append/extract behaviour on real files.

use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;
use tracedrop_core::trailer::read_trailer;
use tracedrop_core::{append_trailer, extract_trailer, CryptoData, OperatorKey, TrailerError};

fn crypto_for(key: &OperatorKey, signature: &[u8]) -> CryptoData {
    CryptoData::from_signature(key.public_key_pem().unwrap(), signature)
}

#[test]
fn test_extract_restores_original_bytes() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pkg.tar.zst");
    let original = b"\x28\xb5\x2f\xfd compressed-ish bytes \n 123".to_vec();
    fs::write(&path, &original).unwrap();

    let data = crypto_for(&OperatorKey::generate(), b"0E\x02\x21sig");
    append_trailer(&path, &data).unwrap();
    assert!(fs::metadata(&path).unwrap().len() > original.len() as u64);

    let (peeked, offset) = read_trailer(&path).unwrap();
    assert_eq!(peeked, data);
    assert_eq!(offset, original.len() as u64);

    assert_eq!(extract_trailer(&path).unwrap(), data);
    assert_eq!(fs::read(&path).unwrap(), original);
}

#[test]
fn test_empty_package_roundtrips() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("empty");
    fs::write(&path, b"").unwrap();

    let data = crypto_for(&OperatorKey::generate(), b"s");
    append_trailer(&path, &data).unwrap();
    assert_eq!(extract_trailer(&path).unwrap(), data);
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
}

#[test]
fn test_truncated_length_field_is_corrupt() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pkg");
    fs::write(&path, b"archive").unwrap();
    append_trailer(&path, &crypto_for(&OperatorKey::generate(), b"s")).unwrap();

    // Cut the file right after the newline: zero-length length field.
    let bytes = fs::read(&path).unwrap();
    let newline = bytes.iter().rposition(|&b| b == b'\n').unwrap();
    fs::write(&path, &bytes[..=newline]).unwrap();

    let err = extract_trailer(&path).unwrap_err();
    assert!(err.is_corrupt(), "{err}");
    assert_eq!(err.exit_code(), 4);
    assert_eq!(fs::read(&path).unwrap(), &bytes[..=newline]);
}

#[test]
fn test_non_digit_before_newline_is_corrupt() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pkg");
    fs::write(&path, b"archive{\"a\":1}\n7x").unwrap();
    assert!(matches!(
        extract_trailer(&path),
        Err(TrailerError::Corrupt { .. })
    ));
}

#[test]
fn test_package_without_trailer_is_corrupt() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pkg");
    fs::write(&path, b"1234567890").unwrap();
    assert!(extract_trailer(&path).unwrap_err().is_corrupt());
}

#[test]
fn test_second_extract_does_not_silently_succeed() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pkg");
    fs::write(&path, b"opaque archive").unwrap();
    append_trailer(&path, &crypto_for(&OperatorKey::generate(), b"s")).unwrap();

    extract_trailer(&path).unwrap();
    assert!(extract_trailer(&path).is_err());
    assert_eq!(fs::read(&path).unwrap(), b"opaque archive");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_roundtrip_property(
        body in proptest::collection::vec(any::<u8>(), 0..10_000),
        signature in proptest::collection::vec(any::<u8>(), 1..72),
        public_key in "[A-Za-z0-9+/=\n -]{0,200}",
    ) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pkg");
        fs::write(&path, &body).unwrap();

        let data = CryptoData::from_signature(public_key, &signature);
        append_trailer(&path, &data).unwrap();
        prop_assert_eq!(extract_trailer(&path).unwrap(), data);
        prop_assert_eq!(fs::read(&path).unwrap(), body);
    }
}
