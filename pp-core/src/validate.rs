//! Bar validator (C3): pure, synchronous checks applied to a batch of
//! historical bars before they reach a sink.
//!
//! `validate_bars` is deterministic and allocation-bounded by the size of its
//! input: running it twice over the same bars produces identical output.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::types::HistoricalBar;
use pp_types::ValidatorPreset;

/// Error codes that reject a bar from the `valid` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorCode {
    /// `symbol` is empty or all whitespace.
    EmptySymbol,
    /// `source` is empty or all whitespace.
    EmptySource,
    /// `low > high`, or `open`/`close` fall outside `[low, high]`.
    OhlcInconsistency,
    /// An OHLC field exceeds `max_price`.
    PriceExceedsMax,
    /// An OHLC field falls below `min_price`.
    PriceBelowMin,
    /// An OHLC field is negative.
    NegativePrice,
    /// `volume` exceeds `max_volume`.
    VolumeExceedsMax,
    /// `session_date` is after today (UTC) and `allow_future_date` is false.
    FutureDate,
}

/// Warning codes that never reject a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationWarningCode {
    /// `volume` is zero and `allow_zero_volume` is false.
    ZeroVolume,
    /// `|close - open| / open * 100` exceeds `max_daily_change_percent`.
    PriceSpike,
    /// `|open - prev_close| / prev_close * 100` exceeds `max_gap_percent`.
    PriceGap,
    /// The same `(symbol, session_date)` pair appears more than once in the batch.
    DuplicateDate,
    /// `stale_data_threshold` consecutive bars for this symbol share identical OHLC.
    StaleData,
}

/// Thresholds controlling which checks reject versus warn. See
/// [`ValidationConfig::from_preset`] for the three documented presets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationConfig {
    /// Maximum allowed OHLC price.
    pub max_price: Decimal,
    /// Minimum allowed OHLC price.
    pub min_price: Decimal,
    /// Maximum allowed volume.
    pub max_volume: u64,
    /// Intra-bar `|close - open|` percent threshold for `PriceSpike`.
    pub max_daily_change_percent: f64,
    /// Inter-bar `|open - prevClose|` percent threshold for `PriceGap`.
    pub max_gap_percent: f64,
    /// Whether a zero-volume bar is accepted without a warning.
    pub allow_zero_volume: bool,
    /// Whether a `session_date` after today (UTC) is accepted.
    pub allow_future_date: bool,
    /// Consecutive identical-OHLC bars for one symbol before `StaleData` fires.
    pub stale_data_threshold: u32,
}

impl ValidationConfig {
    /// Build the thresholds for one of the three documented presets.
    #[must_use]
    pub fn from_preset(preset: ValidatorPreset) -> Self {
        match preset {
            ValidatorPreset::Default => Self {
                max_price: Decimal::from(1_000_000),
                min_price: Decimal::new(1, 4), // 0.0001
                max_volume: 100_000_000_000,
                max_daily_change_percent: 50.0,
                max_gap_percent: 50.0,
                allow_zero_volume: true,
                allow_future_date: false,
                stale_data_threshold: 10,
            },
            ValidatorPreset::Strict => Self {
                max_price: Decimal::from(500_000),
                min_price: Decimal::new(1, 2), // 0.01
                max_volume: 10_000_000_000,
                max_daily_change_percent: 20.0,
                max_gap_percent: 20.0,
                allow_zero_volume: false,
                allow_future_date: false,
                stale_data_threshold: 5,
            },
            ValidatorPreset::Lenient => Self {
                max_price: Decimal::from(100_000_000),
                min_price: Decimal::new(1, 8),
                max_volume: u64::MAX,
                max_daily_change_percent: 500.0,
                max_gap_percent: 500.0,
                allow_zero_volume: true,
                allow_future_date: true,
                stale_data_threshold: 1_000,
            },
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self::from_preset(ValidatorPreset::Default)
    }
}

/// A bar that failed at least one error-level check, with every code it tripped.
#[derive(Debug, Clone)]
pub struct RejectedBar {
    /// The rejected bar.
    pub bar: HistoricalBar,
    /// Every error code the bar tripped, in check order.
    pub errors: Vec<ValidationErrorCode>,
}

/// A warning attached to a specific bar by symbol and date (the bar itself
/// may have been accepted or rejected independently of its warnings).
#[derive(Debug, Clone)]
pub struct BarWarning {
    /// Symbol the warning applies to.
    pub symbol: String,
    /// Session date the warning applies to.
    pub session_date: NaiveDate,
    /// The warning code.
    pub code: ValidationWarningCode,
}

/// Output of [`validate_bars`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Bars that passed every error-level check, sorted by `(symbol, date)`.
    pub valid: Vec<HistoricalBar>,
    /// Bars that failed at least one error-level check.
    pub rejected: Vec<RejectedBar>,
    /// Every warning raised across the batch.
    pub warnings: Vec<BarWarning>,
    /// Flattened `(symbol, session_date, code)` view of every error raised,
    /// for callers that want a single error stream rather than per-bar groups.
    pub errors: Vec<(String, NaiveDate, ValidationErrorCode)>,
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Run the nine ordered checks over `bars` and partition them into
/// valid/rejected/warnings. Pure and idempotent: identical input always
/// produces identical output.
#[must_use]
pub fn validate_bars(bars: Vec<HistoricalBar>, config: &ValidationConfig) -> ValidationReport {
    let mut sorted = bars;
    sorted.sort_by(|a, b| (a.symbol.as_str(), a.session_date).cmp(&(b.symbol.as_str(), b.session_date)));

    let mut duplicate_counts: HashMap<(String, NaiveDate), u32> = HashMap::new();
    for bar in &sorted {
        *duplicate_counts
            .entry((bar.symbol.clone(), bar.session_date))
            .or_insert(0) += 1;
    }

    let today = Utc::now().date_naive();
    let mut report = ValidationReport::default();

    let mut prev_close_by_symbol: HashMap<String, Decimal> = HashMap::new();
    let mut stale_run_by_symbol: HashMap<String, (u32, (Decimal, Decimal, Decimal, Decimal))> =
        HashMap::new();

    for bar in sorted {
        let mut errors: Vec<ValidationErrorCode> = Vec::new();
        let mut warnings: Vec<ValidationWarningCode> = Vec::new();

        if is_blank(&bar.symbol) {
            errors.push(ValidationErrorCode::EmptySymbol);
        }
        if is_blank(&bar.source) {
            errors.push(ValidationErrorCode::EmptySource);
        }

        let ohlc_ok =
            bar.low <= bar.high && bar.open >= bar.low && bar.open <= bar.high && bar.close >= bar.low && bar.close <= bar.high;
        if !ohlc_ok {
            errors.push(ValidationErrorCode::OhlcInconsistency);
        }

        for price in [bar.open, bar.high, bar.low, bar.close] {
            if price < Decimal::ZERO {
                if !errors.contains(&ValidationErrorCode::NegativePrice) {
                    errors.push(ValidationErrorCode::NegativePrice);
                }
            } else if price > config.max_price {
                if !errors.contains(&ValidationErrorCode::PriceExceedsMax) {
                    errors.push(ValidationErrorCode::PriceExceedsMax);
                }
            } else if price < config.min_price && !errors.contains(&ValidationErrorCode::PriceBelowMin) {
                errors.push(ValidationErrorCode::PriceBelowMin);
            }
        }

        if bar.volume == 0 {
            if !config.allow_zero_volume {
                warnings.push(ValidationWarningCode::ZeroVolume);
            }
        } else if bar.volume > config.max_volume {
            errors.push(ValidationErrorCode::VolumeExceedsMax);
        }

        if bar.session_date > today && !config.allow_future_date {
            errors.push(ValidationErrorCode::FutureDate);
        }

        if !bar.open.is_zero() {
            let change_percent = ((bar.close - bar.open) / bar.open * Decimal::from(100))
                .abs()
                .to_string()
                .parse::<f64>()
                .unwrap_or(0.0);
            if change_percent > config.max_daily_change_percent {
                warnings.push(ValidationWarningCode::PriceSpike);
            }
        }

        if let Some(prev_close) = prev_close_by_symbol.get(&bar.symbol).copied() {
            if !prev_close.is_zero() {
                let gap_percent = ((bar.open - prev_close) / prev_close * Decimal::from(100))
                    .abs()
                    .to_string()
                    .parse::<f64>()
                    .unwrap_or(0.0);
                if gap_percent > config.max_gap_percent {
                    warnings.push(ValidationWarningCode::PriceGap);
                }
            }
        }
        prev_close_by_symbol.insert(bar.symbol.clone(), bar.close);

        if duplicate_counts
            .get(&(bar.symbol.clone(), bar.session_date))
            .copied()
            .unwrap_or(0)
            > 1
        {
            warnings.push(ValidationWarningCode::DuplicateDate);
        }

        let ohlc_tuple = (bar.open, bar.high, bar.low, bar.close);
        let run_len = match stale_run_by_symbol.get(&bar.symbol) {
            Some((len, last_ohlc)) if *last_ohlc == ohlc_tuple => len + 1,
            _ => 1,
        };
        stale_run_by_symbol.insert(bar.symbol.clone(), (run_len, ohlc_tuple));
        if run_len == config.stale_data_threshold {
            warnings.push(ValidationWarningCode::StaleData);
        }

        for code in &warnings {
            report.warnings.push(BarWarning {
                symbol: bar.symbol.clone(),
                session_date: bar.session_date,
                code: *code,
            });
        }

        for code in &errors {
            report
                .errors
                .push((bar.symbol.clone(), bar.session_date, *code));
        }

        if errors.is_empty() {
            report.valid.push(bar);
        } else {
            report.rejected.push(RejectedBar { bar, errors });
        }
    }

    report
}
