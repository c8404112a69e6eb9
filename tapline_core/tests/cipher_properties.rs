use base64::{engine::general_purpose::STANDARD, Engine as _};
use proptest::prelude::*;
use tapline_core::crypto::{decrypt, encrypt, TunnelCipher, TunnelKey, MIN_ENVELOPE_SIZE, TAG_SIZE};
use tapline_core::TunnelError;

proptest! {
    #[test]
    fn envelope_roundtrip(key in proptest::array::uniform32(any::<u8>()),
                          frame in proptest::collection::vec(any::<u8>(), 0..=4096)) {
        let envelope = encrypt(&frame, &key).unwrap();
        prop_assert!(envelope.is_ascii());
        prop_assert_eq!(decrypt(envelope.as_bytes(), &key).unwrap(), frame);
    }

    #[test]
    fn envelope_length_is_predictable(len in 0usize..2048) {
        let cipher = TunnelCipher::new(TunnelKey::generate());
        let raw = STANDARD.decode(cipher.encrypt(&vec![0xAB; len]).unwrap()).unwrap();
        let padded = (len / 16 + 1) * 16;
        prop_assert_eq!(raw.len(), 16 + padded + TAG_SIZE);
        prop_assert!(raw.len() >= MIN_ENVELOPE_SIZE);
    }

    #[test]
    fn tampered_tag_never_decrypts(frame in proptest::collection::vec(any::<u8>(), 0..256),
                                   position in 0usize..TAG_SIZE,
                                   flip in 1u8..=255) {
        let cipher = TunnelCipher::new(TunnelKey::generate());
        let mut raw = STANDARD.decode(cipher.encrypt(&frame).unwrap()).unwrap();
        let index = raw.len() - TAG_SIZE + position;
        raw[index] ^= flip;
        let result = cipher.decrypt(STANDARD.encode(&raw));
        prop_assert!(matches!(result, Err(TunnelError::Authentication)));
    }

    #[test]
    fn arbitrary_text_is_rejected_without_panic(text in ".{0,200}") {
        let cipher = TunnelCipher::new(TunnelKey::generate());
        let result = cipher.decrypt(text.as_bytes());
        prop_assert!(result.is_err());
        prop_assert!(result.unwrap_err().is_malformed_input());
    }

    #[test]
    fn wrong_key_lengths_are_rejected(len in (0usize..64).prop_filter("not 32", |l| *l != 32)) {
        let key = vec![7u8; len];
        prop_assert!(matches!(encrypt(b"x", &key), Err(TunnelError::KeyLength(l)) if l == len));
    }
}
