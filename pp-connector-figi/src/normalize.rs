//! Pure vendor-symbol normalization.
//!
//! Canonical symbols in this workspace are `BASE[-CLASS][:EXCHANGE]`, e.g.
//! `AAPL`, `BRK-B` (share class), `VOD:LSE` (exchange-scoped). Each vendor
//! rewrites that canonical form into whatever shape its own API expects;
//! vendors this module doesn't know about pass the canonical symbol through
//! unchanged, since a vendor-specific rewrite can't be invented blind.

/// Rewrite `symbol` (canonical form) into the shape `vendor` expects.
///
/// `vendor` is matched case-insensitively against the known vendor set
/// (`"yahoo"`, `"polygon"`, `"alpaca"`). Unknown vendors get `symbol` back
/// unmodified.
#[must_use]
pub fn normalize(symbol: &str, vendor: &str) -> String {
    let (base, class, exchange) = split_canonical(symbol);
    match vendor.to_ascii_lowercase().as_str() {
        "yahoo" => normalize_yahoo(base, class, exchange),
        "polygon" => normalize_polygon(base, class, exchange),
        "alpaca" => normalize_alpaca(base, class, exchange),
        _ => symbol.to_string(),
    }
}

/// Splits `AAPL`, `BRK-B`, `VOD:LSE`, or `BRK-B:NYSE` into (base, class, exchange).
fn split_canonical(symbol: &str) -> (&str, Option<&str>, Option<&str>) {
    let (body, exchange) = match symbol.split_once(':') {
        Some((body, exch)) => (body, Some(exch)),
        None => (symbol, None),
    };
    let (base, class) = match body.split_once('-') {
        Some((base, class)) => (base, Some(class)),
        None => (body, None),
    };
    (base, class, exchange)
}

fn normalize_yahoo(base: &str, class: Option<&str>, exchange: Option<&str>) -> String {
    let mut out = base.to_string();
    if let Some(class) = class {
        out.push('.');
        out.push_str(class);
    }
    if let Some(exchange) = exchange {
        out.push('.');
        out.push_str(yahoo_exchange_suffix(exchange));
    }
    out
}

/// Maps a handful of common exchange codes to the Yahoo Finance ticker
/// suffix. Codes this table doesn't carry fall back to the lowercased
/// exchange code itself, which is wrong often enough to be a known gap but
/// better than silently dropping the scope.
fn yahoo_exchange_suffix(exchange: &str) -> &str {
    match exchange.to_ascii_uppercase().as_str() {
        "LSE" | "L" => "L",
        "TSE" | "TYO" | "T" => "T",
        "FRA" | "F" => "F",
        "PAR" | "PA" => "PA",
        "AMS" | "AS" => "AS",
        "HKG" | "HK" => "HK",
        "ASX" | "AX" => "AX",
        "TOR" | "TO" => "TO",
        other => other,
    }
}

fn normalize_polygon(base: &str, class: Option<&str>, _exchange: Option<&str>) -> String {
    let mut out = base.trim().to_ascii_uppercase();
    if let Some(class) = class {
        out.push('.');
        out.push_str(&class.trim().to_ascii_uppercase());
    }
    out
}

fn normalize_alpaca(base: &str, class: Option<&str>, _exchange: Option<&str>) -> String {
    let mut out = base.trim().to_ascii_uppercase();
    if let Some(class) = class {
        out.push('.');
        out.push_str(&class.trim().to_ascii_uppercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn yahoo_appends_known_exchange_suffix() {
        assert_eq!(normalize("VOD:LSE", "yahoo"), "VOD.L");
        assert_eq!(normalize("TOYOTA:TSE", "yahoo"), "TOYOTA.T");
    }

    #[test]
    fn yahoo_renders_share_class_with_a_dot() {
        assert_eq!(normalize("BRK-B", "yahoo"), "BRK.B");
        assert_eq!(normalize("BRK-B:NYSE", "yahoo"), "BRK.B.NYSE");
    }

    #[test]
    fn polygon_uppercases_and_strips_whitespace() {
        assert_eq!(normalize(" aapl ", "Polygon"), "AAPL");
        assert_eq!(normalize("brk-b", "polygon"), "BRK.B");
    }

    #[test]
    fn alpaca_uses_bare_us_tickers() {
        assert_eq!(normalize("aapl", "alpaca"), "AAPL");
        assert_eq!(normalize("VOD:LSE", "alpaca"), "VOD");
    }

    #[test]
    fn unknown_vendor_passes_through_unchanged() {
        assert_eq!(normalize("VOD:LSE", "bloomberg"), "VOD:LSE");
    }

    #[test]
    fn plain_ticker_is_unaffected_by_any_vendor() {
        for vendor in ["yahoo", "polygon", "alpaca", "unknown"] {
            assert_eq!(normalize("AAPL", vendor), "AAPL");
        }
    }
}
