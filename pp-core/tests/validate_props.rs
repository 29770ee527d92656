use std::collections::HashMap;

use chrono::NaiveDate;
use pp_core::types::HistoricalBar;
use pp_core::validate::{ValidationConfig, validate_bars};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn arb_price() -> impl Strategy<Value = Decimal> {
    (-100_000i64..2_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn arb_symbol() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[A-Z]{1,5}",
    ]
}

fn arb_bar() -> impl Strategy<Value = HistoricalBar> {
    (
        arb_symbol(),
        0i32..40,
        arb_price(),
        arb_price(),
        arb_price(),
        arb_price(),
        0u64..50_000,
        1u64..1000,
    )
        .prop_map(|(symbol, day_offset, open, high, low, close, volume, sequence_number)| {
            HistoricalBar {
                symbol,
                session_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i64::from(day_offset)),
                open,
                high,
                low,
                close,
                volume,
                source: "test-vendor".to_string(),
                sequence_number,
            }
        })
}

/// Multiset-counts a batch of bars by their full field tuple, since
/// `HistoricalBar` carries no identity beyond its own fields.
fn counts(bars: &[HistoricalBar]) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for bar in bars {
        *map.entry(format!("{bar:?}")).or_insert(0) += 1;
    }
    map
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn valid_and_rejected_partition_the_input_as_a_multiset(bars in proptest::collection::vec(arb_bar(), 0..30)) {
        let config = ValidationConfig::default();
        let report = validate_bars(bars.clone(), &config);

        let mut recombined: Vec<HistoricalBar> = report.valid.clone();
        recombined.extend(report.rejected.iter().map(|r| r.bar.clone()));

        prop_assert_eq!(counts(&recombined), counts(&bars));
    }

    #[test]
    fn validating_the_valid_set_again_is_a_fixed_point(bars in proptest::collection::vec(arb_bar(), 0..30)) {
        let config = ValidationConfig::default();
        let once = validate_bars(bars, &config).valid;
        let twice = validate_bars(once.clone(), &config).valid;
        prop_assert_eq!(once, twice);
    }
}
