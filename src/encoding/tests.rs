use super::*;

#[test]
fn int_round_trips() {
    let mut buf = Vec::new();
    0xABu8.encode_to(&mut buf).unwrap();
    0xBEEFu16.encode_to(&mut buf).unwrap();
    0xDEAD_BEEFu32.encode_to(&mut buf).unwrap();
    u64::MAX.encode_to(&mut buf).unwrap();
    (-5i8).encode_to(&mut buf).unwrap();
    (-1234i16).encode_to(&mut buf).unwrap();
    i32::MIN.encode_to(&mut buf).unwrap();
    i64::MIN.encode_to(&mut buf).unwrap();

    let mut off = 0;
    let (a, n) = u8::decode_from(&buf[off..]).unwrap();
    off += n;
    let (b, n) = u16::decode_from(&buf[off..]).unwrap();
    off += n;
    let (c, n) = u32::decode_from(&buf[off..]).unwrap();
    off += n;
    let (d, n) = u64::decode_from(&buf[off..]).unwrap();
    off += n;
    let (e, n) = i8::decode_from(&buf[off..]).unwrap();
    off += n;
    let (f, n) = i16::decode_from(&buf[off..]).unwrap();
    off += n;
    let (g, n) = i32::decode_from(&buf[off..]).unwrap();
    off += n;
    let (h, n) = i64::decode_from(&buf[off..]).unwrap();
    off += n;

    assert_eq!(off, buf.len());
    assert_eq!(
        (a, b, c, d, e, f, g, h),
        (
            0xAB,
            0xBEEF,
            0xDEAD_BEEF,
            u64::MAX,
            -5,
            -1234,
            i32::MIN,
            i64::MIN
        )
    );
}

#[test]
fn integers_are_little_endian() {
    let bytes = encode_to_vec(&0x0102_0304u32).unwrap();
    assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn byte_vec_round_trip() {
    let data = vec![1u8, 2, 3, 4, 5];
    let bytes = encode_to_vec(&data).unwrap();
    assert_eq!(bytes.len(), 4 + data.len());

    let (decoded, consumed) = Vec::<u8>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, data);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn fixed_array_has_no_length_prefix() {
    let magic = *b"TSDF";
    let bytes = encode_to_vec(&magic).unwrap();
    assert_eq!(bytes, b"TSDF");

    let (decoded, consumed) = <[u8; 4]>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, magic);
    assert_eq!(consumed, 4);
}

#[test]
fn truncated_buffer_reports_eof() {
    let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
    let err = u32::decode_from(&bytes[..2]).unwrap_err();
    match err {
        EncodingError::UnexpectedEof { needed, available } => {
            assert_eq!(needed, 4);
            assert_eq!(available, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn oversized_byte_len_is_rejected() {
    let mut bytes = Vec::new();
    (MAX_BYTE_LEN + 1).encode_to(&mut bytes).unwrap();
    let err = Vec::<u8>::decode_from(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn struct_vec_round_trip() {
    let items = vec![1u64, 2, 3];
    let mut buf = Vec::new();
    encode_vec(&items, &mut buf).unwrap();

    let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, buf.len());
}
