//! Tests for value encoding and frame handling

use memlink_core::protocol::{
    decode_response, decode_value, encode_mem_write, encode_value, map_type_to_bit_width,
    BitWidth, ElementType, Response,
};
use pretty_assertions::assert_eq;

#[test]
fn test_integer_values_survive_the_wire() {
    let cases: &[(ElementType, &[f64])] = &[
        (ElementType::U8, &[0.0, 1.0, 127.0, 255.0]),
        (ElementType::I8, &[-128.0, -1.0, 0.0, 127.0]),
        (ElementType::U16, &[0.0, 42.0, 65535.0]),
        (ElementType::I16, &[-32768.0, -2.0, 32767.0]),
        (ElementType::U32, &[0.0, 4_294_967_295.0]),
        (ElementType::I32, &[-2_147_483_648.0, -5.0, 2_147_483_647.0]),
    ];

    for (element_type, values) in cases {
        for &value in *values {
            let text = encode_value(value, element_type.bit_width(), *element_type).unwrap();
            assert_eq!(
                text.len(),
                2 + element_type.bit_width().bits() as usize,
                "{} as {}",
                value,
                element_type
            );
            assert_eq!(decode_value(&text, *element_type).unwrap(), value);
        }
    }
}

#[test]
fn test_float_bit_patterns_are_exact() {
    for value in [0.0f32, -0.0, 1.5, -273.15, f32::MAX, f32::MIN_POSITIVE] {
        let text = encode_value(value as f64, BitWidth::W32, ElementType::F32).unwrap();
        let decoded = decode_value(&text, ElementType::F32).unwrap() as f32;
        assert_eq!(decoded.to_bits(), value.to_bits());
    }
    for value in [0.1f64, -1e300, std::f64::consts::PI] {
        let text = encode_value(value, BitWidth::W64, ElementType::F64).unwrap();
        assert_eq!(decode_value(&text, ElementType::F64).unwrap().to_bits(), value.to_bits());
    }
}

#[test]
fn test_out_of_range_values_clamp() {
    assert_eq!(
        encode_value(300.0, BitWidth::W8, ElementType::U8).unwrap(),
        "0b11111111"
    );
    assert_eq!(
        encode_value(-200.0, BitWidth::W8, ElementType::I8).unwrap(),
        "0b10000000"
    );
    assert_eq!(
        encode_value(-1.0, BitWidth::W16, ElementType::U16).unwrap(),
        "0b0000000000000000"
    );
}

#[test]
fn test_unknown_type_defaults_to_32_bits() {
    assert_eq!(map_type_to_bit_width("struct foo"), BitWidth::W32);
    assert_eq!(map_type_to_bit_width("Uint16_t"), BitWidth::W16);
    assert_eq!(map_type_to_bit_width("unsigned char"), BitWidth::W8);
    assert_eq!(map_type_to_bit_width("double"), BitWidth::W64);
}

#[test]
fn test_hex_and_decimal_values() {
    assert_eq!(decode_value("0x2A", ElementType::U8).unwrap(), 42.0);
    assert_eq!(decode_value("0xFFFF", ElementType::I16).unwrap(), -1.0);
    assert_eq!(decode_value("12.5", ElementType::U32).unwrap(), 12.5);
    assert!(decode_value("0bxyz", ElementType::U8).is_err());
}

#[test]
fn test_write_frame_round_trips_through_device_ack() {
    let frame = encode_mem_write(0x2000_0010, BitWidth::W32, -7.0, ElementType::I32).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(parsed["data"], "0b11111111111111111111111111111001");

    let ack = format!(
        r#"{{"res":"mem_read","add":"0x20000010","value":"{}"}}"#,
        parsed["data"].as_str().unwrap()
    );
    match decode_response(&ack) {
        Response::MemReadAck { address, value, .. } => {
            assert_eq!(address, 0x2000_0010);
            assert_eq!(value.decode(ElementType::I32).unwrap(), -7.0);
        }
        other => panic!("Expected mem_read ack, got {:?}", other),
    }
}
