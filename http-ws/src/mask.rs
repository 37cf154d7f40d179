/// XOR `payload` against the 4 byte masking key, index mod 4.
///
/// Masking is an involution: applying the same key twice restores the
/// original bytes.
pub fn apply_mask(key: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masking_twice_restores_payload() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, masked world! 0123456789".to_vec();

        let mut payload = original.clone();
        apply_mask(key, &mut payload);
        assert_ne!(payload, original);

        apply_mask(key, &mut payload);
        assert_eq!(payload, original);
    }

    #[test]
    fn known_masked_sample() {
        // "Hello" masked with the key of RFC 6455 section 5.7.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut payload = b"Hello".to_vec();
        apply_mask(key, &mut payload);
        assert_eq!(payload, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }
}
