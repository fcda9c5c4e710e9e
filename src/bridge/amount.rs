use super::WalletError;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// The amount written into `z_sendmany` must stay within 15 units at nine
/// fraction digits of the requested one.
const TOLERANCE_UNITS: u128 = 15;
const TOLERANCE_SCALE: usize = 9;

const MAX_FRACTION_DIGITS: usize = 8;
const MIN_FRACTION_DIGITS: usize = 2;
const EMPTY_MEMO_MARKER: &str = "f60000";

/// Fixed-point rendering with 2 to 8 fraction digits, never exponential.
pub fn format_amount(value: f64) -> String {
    let mut text = format!("{value:.prec$}", prec = MAX_FRACTION_DIGITS);
    if let Some(dot) = text.find('.') {
        let min_len = dot + 1 + MIN_FRACTION_DIGITS;
        while text.len() > min_len && text.ends_with('0') {
            text.pop();
        }
    }
    text
}

/// Unsigned decimal text: digits with at most one dot, no exponent.
fn plain_decimal(text: &str) -> Option<f64> {
    let text = text.trim();
    let mut digits = 0;
    let mut dots = 0;
    for c in text.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return None,
        }
    }
    if digits == 0 || dots > 1 {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_amount(text: &str) -> Result<f64, WalletError> {
    plain_decimal(text)
        .filter(|v| *v > 0.0)
        .ok_or_else(|| WalletError::InvalidAmount(text.to_string()))
}

pub fn parse_fee(text: &str) -> Result<f64, WalletError> {
    plain_decimal(text)
        .filter(|v| *v >= 0.0)
        .ok_or_else(|| WalletError::InvalidAmount(text.to_string()))
}

fn fraction_len(text: &str) -> usize {
    text.split_once('.').map_or(0, |(_, frac)| frac.len())
}

/// Decimal text as an integer count of `10^-scale` units.
fn decimal_units(text: &str, scale: usize) -> Option<u128> {
    plain_decimal(text)?;
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text, ""));
    if frac_part.len() > scale {
        return None;
    }
    format!("{int_part}{frac_part:0<scale$}").parse().ok()
}

#[derive(Serialize)]
struct Recipient<'a> {
    address: &'a str,
    amount: &'a RawValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
}

#[derive(Deserialize)]
struct SentAmount<'a> {
    #[serde(borrow)]
    amount: Option<&'a RawValue>,
}

/// Builds the single-recipient array for `z_sendmany` and checks that the
/// amount survives formatting.
pub fn build_to_many(to: &str, amount: &str, memo: &str) -> Result<String, WalletError> {
    let requested = amount.trim();
    let formatted = format_amount(parse_amount(requested)?);
    let raw_amount = RawValue::from_string(formatted.clone())
        .map_err(|_| WalletError::InvalidAmount(formatted.clone()))?;

    let recipient = Recipient {
        address: to,
        amount: &raw_amount,
        memo: Some(encode_memo(memo)).filter(|hex| !hex.is_empty()),
    };
    let to_many = serde_json::to_string(&[recipient]).map_err(|source| WalletError::Malformed {
        raw: to.to_string(),
        source,
    })?;

    verify_amount(requested, &to_many)?;
    Ok(to_many)
}

/// Compares decimal texts exactly, so large amounts keep their satoshis.
fn verify_amount(requested: &str, to_many: &str) -> Result<(), WalletError> {
    let sent: Vec<SentAmount<'_>> =
        serde_json::from_str(to_many).map_err(|source| WalletError::Malformed {
            raw: to_many.to_string(),
            source,
        })?;
    let written = sent
        .first()
        .and_then(|r| r.amount)
        .map(RawValue::get)
        .unwrap_or_default();

    let scale = TOLERANCE_SCALE
        .max(fraction_len(requested))
        .max(fraction_len(written));
    let tolerance = u32::try_from(scale - TOLERANCE_SCALE)
        .ok()
        .and_then(|exp| 10u128.checked_pow(exp))
        .and_then(|factor| factor.checked_mul(TOLERANCE_UNITS));

    let within = match (
        decimal_units(requested, scale),
        decimal_units(written, scale),
        tolerance,
    ) {
        (Some(want), Some(got), Some(tolerance)) => want.abs_diff(got) < tolerance,
        _ => false,
    };
    if !within {
        return Err(WalletError::AmountMismatch {
            requested: requested.to_string(),
            formatted: to_many.to_string(),
        });
    }
    Ok(())
}

pub fn encode_memo(memo: &str) -> String {
    hex::encode(memo)
}

/// Decodes a received memo; `None` when the sender left it empty.
pub fn decode_memo(memo_hex: &str) -> Result<Option<String>, WalletError> {
    if memo_hex.starts_with(EMPTY_MEMO_MARKER) {
        return Ok(None);
    }

    let mut bytes = hex::decode(memo_hex)
        .map_err(|err| WalletError::Unexpected(format!("memo не в hex ({err}): {memo_hex}")))?;
    // zero bytes are padding
    bytes.retain(|&b| b != 0);
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_keep_between_two_and_eight_fraction_digits() {
        assert_eq!(format_amount(1.0), "1.00");
        assert_eq!(format_amount(0.1), "0.10");
        assert_eq!(format_amount(0.0001), "0.0001");
        assert_eq!(format_amount(12.345678912), "12.34567891");
        assert_eq!(format_amount(0.00000001), "0.00000001");
        assert_eq!(format_amount(21000000.0), "21000000.00");
    }

    #[test]
    fn tiny_amounts_are_never_exponential() {
        let text = format_amount(1e-7);
        assert!(!text.contains('e'), "{text}");
        assert_eq!(text, "0.0000001");
    }

    #[test]
    fn invalid_amounts_are_rejected() {
        assert!(matches!(parse_amount("abc"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_amount("0"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_amount("-1"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_amount("NaN"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_amount("1e-3"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_amount("1.2.3"), Err(WalletError::InvalidAmount(_))));
        assert!(matches!(parse_fee("-0.1"), Err(WalletError::InvalidAmount(_))));
        assert!(parse_fee("0").is_ok());
        assert_eq!(parse_amount(" 1.5 ").unwrap(), 1.5);
    }

    #[test]
    fn to_many_carries_formatted_amount_and_hex_memo() {
        let json = build_to_many("zs1dest", "1", "hi").unwrap();
        assert_eq!(
            json,
            r#"[{"address":"zs1dest","amount":1.00,"memo":"6869"}]"#
        );
    }

    #[test]
    fn empty_memo_is_omitted() {
        let json = build_to_many("t1dest", "0.5", "").unwrap();
        assert_eq!(json, r#"[{"address":"t1dest","amount":0.50}]"#);
    }

    #[test]
    fn sub_satoshi_rounding_stays_within_tolerance() {
        let json = build_to_many("t1dest", "0.123456784", "").unwrap();
        assert_eq!(json, r#"[{"address":"t1dest","amount":0.12345678}]"#);
    }

    #[test]
    fn drifted_amount_is_rejected() {
        let err = verify_amount("1.0", r#"[{"address":"t1","amount":1.1}]"#).unwrap_err();
        assert!(matches!(err, WalletError::AmountMismatch { .. }));
        let err = verify_amount("1.0", r#"[{"address":"t1"}]"#).unwrap_err();
        assert!(matches!(err, WalletError::AmountMismatch { .. }));
        let err = verify_amount("1.0", r#"[{"address":"t1","amount":1e0}]"#).unwrap_err();
        assert!(matches!(err, WalletError::AmountMismatch { .. }));
    }

    #[test]
    fn tolerance_is_exact_at_nine_fraction_digits() {
        assert!(verify_amount("0.000000014", r#"[{"amount":0.00}]"#).is_ok());
        assert!(verify_amount("0.000000015", r#"[{"amount":0.00}]"#).is_err());
        assert!(verify_amount("2.0000000149", r#"[{"amount":2.00}]"#).is_ok());
    }

    #[test]
    fn large_amount_losing_satoshis_is_rejected() {
        let err = build_to_many("t1dest", "1000000000.00000003", "").unwrap_err();
        assert!(matches!(err, WalletError::AmountMismatch { .. }));
        assert_eq!(
            build_to_many("t1dest", "1000000000.5", "").unwrap(),
            r#"[{"address":"t1dest","amount":1000000000.50}]"#
        );
    }

    #[test]
    fn memo_hex_handles_utf8() {
        assert_eq!(encode_memo("Ж"), "d096");
        assert_eq!(decode_memo("d0960000").unwrap().as_deref(), Some("Ж"));
    }

    #[test]
    fn empty_marker_memo_decodes_to_none() {
        assert_eq!(decode_memo("f600000000").unwrap(), None);
    }

    #[test]
    fn zero_bytes_in_memo_are_skipped() {
        assert_eq!(decode_memo("680069000000").unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn malformed_memo_hex_is_an_error() {
        assert!(decode_memo("zz").is_err());
        assert!(decode_memo("6869f").is_err());
    }
}
