//! Self-describing binary value codec used for everything stored in the
//! settings hash and challenge records.
//!
//! MessagePack-compatible semantics: nulls, booleans, ints, floats, UTF-8
//! strings, byte strings, arrays, maps, and timestamps all round-trip.

use crate::error::{CertsError, Result};
use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Encode any `Serialize` value into the wire format stored in a hash field.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| CertsError::Internal(format!("codec encode: {e}")))
}

/// Decode a hash field back into `T`.
///
/// Per the settings-store error policy, a decode failure on a single field is
/// not fatal to the caller — it should be treated as "field absent" rather
/// than propagated. Callers choose that by matching on `Ok`/`Err` themselves;
/// this function simply reports the failure faithfully.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| CertsError::Internal(format!("codec decode: {e}")))
}

/// Decode into the generic self-describing [`Value`] representation, for
/// callers that don't know the shape ahead of time.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    rmpv::decode::read_value(&mut std::io::Cursor::new(bytes))
        .map_err(|e| CertsError::Internal(format!("codec decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Nested {
        name: String,
        bytes: Vec<u8>,
        nested: BTreeMap<String, i64>,
        maybe: Option<String>,
        when: i64,
    }

    #[test]
    fn round_trips_structured_values() {
        let mut nested = BTreeMap::new();
        nested.insert("a".to_string(), 1);
        nested.insert("b".to_string(), -7);

        let value = Nested {
            name: "example.com".to_string(),
            bytes: vec![0, 1, 2, 255],
            nested,
            maybe: None,
            when: 1_700_000_000,
        };

        let encoded = encode(&value).unwrap();
        let decoded: Nested = decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn round_trips_primitives() {
        assert_eq!(decode::<bool>(&encode(&true).unwrap()).unwrap(), true);
        assert_eq!(decode::<i64>(&encode(&-42i64).unwrap()).unwrap(), -42);
        assert_eq!(decode::<f64>(&encode(&3.5f64).unwrap()).unwrap(), 3.5);
        assert_eq!(
            decode::<Option<String>>(&encode(&Option::<String>::None).unwrap()).unwrap(),
            None
        );
    }

    #[test]
    fn corrupt_bytes_fail_decode_without_panicking() {
        let garbage = vec![0xc1]; // reserved/never-used MessagePack byte
        let result: Result<String> = decode(&garbage);
        assert!(result.is_err());
    }

    proptest::proptest! {
        // spec.md §8 invariant 4: Settings.set/get round-trips for every
        // value the codec can represent (strings, byte strings, ints, nested maps).
        #[test]
        fn round_trip_holds_for_arbitrary_values(
            name in ".*",
            bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..32),
            when in proptest::prelude::any::<i64>(),
            pairs in proptest::collection::vec((".*", proptest::prelude::any::<i64>()), 0..8),
        ) {
            let nested: BTreeMap<String, i64> = pairs.into_iter().collect();
            let value = Nested {
                name,
                bytes,
                nested,
                maybe: None,
                when,
            };
            let encoded = encode(&value).unwrap();
            let decoded: Nested = decode(&encoded).unwrap();
            prop_assert_eq!(value, decoded);
        }
    }
}
