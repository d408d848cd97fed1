use num_bigint::BigUint;
use proptest::prelude::*;

use stakenode::consensus::{Validator, ValidatorSet};
use stakenode::crypto::ed25519::Ed25519Keypair;
use stakenode::crypto::Signer;
use stakenode::normalize::bigint::{hex_to_decimal, parse_hex, to_fixed};
use stakenode::types::{Amount, Hash32};

fn arb_hex() -> impl Strategy<Value = String> {
    "[0-9a-fA-F]{1,64}"
}

fn arb_validators() -> impl Strategy<Value = Vec<Validator>> {
    proptest::collection::btree_map(any::<[u8; 32]>(), 1u64..1_000_000, 1..8).prop_map(|v| {
        v.into_iter()
            .map(|(seed, stake)| {
                Validator::new(Ed25519Keypair::from_seed(seed).public_key(), Amount::from_units(stake as u128))
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn hex_to_decimal_matches_biguint(hex in arb_hex()) {
        let reference = BigUint::parse_bytes(hex.as_bytes(), 16).unwrap().to_str_radix(10);
        prop_assert_eq!(&hex_to_decimal(&hex).unwrap(), &reference);
        prop_assert_eq!(&hex_to_decimal(&format!("0x{hex}")).unwrap(), &reference);
        // decimal -> hex -> decimal is stable
        let back = parse_hex(&hex).unwrap().to_str_radix(16);
        prop_assert_eq!(hex_to_decimal(&back).unwrap(), reference);
    }

    #[test]
    fn fixed_point_keeps_every_digit(hex in arb_hex(), decimals in 0usize..20) {
        let dec = hex_to_decimal(&hex).unwrap();
        let fixed = to_fixed(&dec, decimals);
        let digits: String = fixed.chars().filter(|c| *c != '.').collect();
        prop_assert_eq!(digits.trim_start_matches('0'), dec.trim_start_matches('0'));
        if decimals > 0 {
            prop_assert_eq!(fixed.len() - fixed.find('.').unwrap() - 1, decimals);
        }
    }

    #[test]
    fn producer_selection_is_deterministic(vals in arb_validators(), prev in any::<[u8; 32]>(), height in 1u64..1_000_000) {
        let mut reversed = vals.clone();
        reversed.reverse();
        let a = ValidatorSet::new(vals);
        let b = ValidatorSet::new(reversed);
        let prev = Hash32(prev);
        let pa = a.select_producer(&prev, height).map(|v| v.address.clone());
        let pb = b.select_producer(&prev, height).map(|v| v.address.clone());
        prop_assert!(pa.is_some());
        prop_assert_eq!(&pa, &pb);
        prop_assert_eq!(pa, a.select_producer(&prev, height).map(|v| v.address.clone()));
    }
}
