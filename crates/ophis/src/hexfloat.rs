//! Canonical textual hexadecimal floats.
//!
//! Floats cross the bridge as text in the exact format produced by Python's
//! `float.hex`: a sign, `0x`, one leading digit, thirteen fractional hex
//! digits and a decimal power-of-two exponent (`-0x1.5p+4`), with `inf` and
//! `nan` spelled out. Text sidesteps decimal rounding entirely, so the
//! round trip is bit-exact for every finite value, both signed zeros and
//! both infinities.

const MANTISSA_BITS: u32 = 52;
const MANTISSA_MASK: u64 = (1 << MANTISSA_BITS) - 1;
const EXPONENT_MASK: u64 = 0x7ff;
const EXPONENT_BIAS: i32 = 1023;

/// Formats a float the way `float.hex` does, suitable for `float.fromhex`.
pub(crate) fn format_hex(value: f64) -> String {
    let bits = value.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let exponent = ((bits >> MANTISSA_BITS) & EXPONENT_MASK) as i32;
    let mantissa = bits & MANTISSA_MASK;
    match exponent {
        0x7ff if mantissa == 0 => format!("{sign}inf"),
        0x7ff => "nan".to_owned(),
        0 if mantissa == 0 => format!("{sign}0x0.0p+0"),
        // Subnormals keep the minimum exponent with a zero leading digit.
        0 => format!("{sign}0x0.{mantissa:013x}p-1022"),
        _ => format!("{sign}0x1.{mantissa:013x}p{:+}", exponent - EXPONENT_BIAS),
    }
}

/// Parses the canonical `float.hex` output back into a float.
///
/// Only the canonical spellings emitted by `float.hex` (and by
/// [`format_hex`]) are accepted; anything else yields `None`. Fractional
/// parts shorter than thirteen digits are padded with zeros, which also
/// admits the `0x0.0p+0` zero spelling.
pub(crate) fn parse_hex(text: &str) -> Option<f64> {
    let text = text.trim();
    let (negative, rest) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    match rest.to_ascii_lowercase().as_str() {
        "inf" | "infinity" => {
            return Some(if negative { f64::NEG_INFINITY } else { f64::INFINITY });
        }
        "nan" => return Some(f64::NAN),
        _ => {}
    }

    let rest = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    let (digits, exponent) = rest.split_once(['p', 'P'])?;
    let exponent: i32 = exponent.parse().ok()?;
    let (lead, frac) = match digits.split_once('.') {
        Some((lead, frac)) => (lead, frac),
        None => (digits, ""),
    };
    if lead.len() != 1 || frac.len() > 13 || !frac.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut mantissa = if frac.is_empty() { 0 } else { u64::from_str_radix(frac, 16).ok()? };
    mantissa <<= 4 * (13 - frac.len() as u32);
    if mantissa > MANTISSA_MASK {
        return None;
    }

    let sign_bit = u64::from(negative) << 63;
    let bits = match lead {
        "1" => {
            let field = exponent + EXPONENT_BIAS;
            if !(1..=0x7fe).contains(&field) {
                return None;
            }
            sign_bit | (field as u64) << MANTISSA_BITS | mantissa
        }
        "0" if mantissa == 0 => sign_bit,
        "0" if exponent == -1022 => sign_bit | mantissa,
        _ => return None,
    };
    Some(f64::from_bits(bits))
}
