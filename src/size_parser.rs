//! Size, time, and range string parsing.
//!
//! Sizes are a decimal integer with an optional `k`/`m`/`g`/`p` suffix,
//! case-insensitive, each step multiplying by 1024 over the previous.
//! Times take `s`/`m`/`h`/`d` suffixes and normalize to seconds.

use anyhow::{anyhow, Result};
use std::fmt::Write as _;

/// Parse a size string into bytes.
///
/// Examples:
/// - "4096" → 4096
/// - "4k" → 4096
/// - "1M" → 1,048,576
/// - "2g" → 2,147,483,648
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let (number_part, suffix) = split_number_suffix(input)?;

    let value: u64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid number: {:?}", number_part))?;

    let shift = match suffix {
        "" => 0,
        s if s.eq_ignore_ascii_case("k") => 10,
        s if s.eq_ignore_ascii_case("m") => 20,
        s if s.eq_ignore_ascii_case("g") => 30,
        s if s.eq_ignore_ascii_case("p") => 40,
        other => return Err(anyhow!("unknown size suffix: {:?} (use k/m/g/p)", other)),
    };

    value
        .checked_shl(shift)
        .filter(|v| v >> shift == value)
        .ok_or_else(|| anyhow!("size overflows 64 bits: {}", input))
}

/// Parse a time string into seconds.
///
/// Accepts a plain number of seconds or `s`/`m`/`h`/`d` suffixes.
pub fn parse_time(input: &str) -> Result<u64> {
    let input = input.trim();
    let (number_part, suffix) = split_number_suffix(input)?;

    let value: u64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid number: {:?}", number_part))?;

    let mult = match suffix {
        "" => 1,
        s if s.eq_ignore_ascii_case("s") => 1,
        s if s.eq_ignore_ascii_case("m") => 60,
        s if s.eq_ignore_ascii_case("h") => 60 * 60,
        s if s.eq_ignore_ascii_case("d") => 24 * 60 * 60,
        other => return Err(anyhow!("unknown time suffix: {:?} (use s/m/h/d)", other)),
    };

    value
        .checked_mul(mult)
        .ok_or_else(|| anyhow!("time overflows 64 bits: {}", input))
}

/// Parse a block-size range: `lo:hi` or `lo:hi,lo:hi`.
///
/// Returns `[read_lo, read_hi, write_lo, write_hi]`; a single range
/// replicates to both directions. Each bound takes size suffixes.
pub fn parse_range(input: &str) -> Result<[u64; 4]> {
    let mut halves = input.trim().splitn(2, ',');

    let first = halves.next().unwrap_or("");
    let (r_lo, r_hi) = parse_one_range(first)?;

    let (w_lo, w_hi) = match halves.next() {
        Some(second) => parse_one_range(second)?,
        None => (r_lo, r_hi),
    };

    Ok([r_lo, r_hi, w_lo, w_hi])
}

fn parse_one_range(part: &str) -> Result<(u64, u64)> {
    let (lo, hi) = part
        .split_once(':')
        .ok_or_else(|| anyhow!("range must be lo:hi, got {:?}", part))?;

    let lo = parse_size(lo)?;
    let hi = parse_size(hi)?;
    if lo > hi {
        return Err(anyhow!("range lower bound {} above upper bound {}", lo, hi));
    }
    Ok((lo, hi))
}

fn split_number_suffix(input: &str) -> Result<(&str, &str)> {
    if input.is_empty() {
        return Err(anyhow!("empty value"));
    }

    let suffix_start = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());

    let number_part = &input[..suffix_start];
    if number_part.is_empty() {
        return Err(anyhow!("no number found in: {:?}", input));
    }

    Ok((number_part, input[suffix_start..].trim()))
}

/// Append a compact human form of `val` to `out`, dividing by 1024 while it
/// stays an even multiple: 4096 → "4K", 1048576 → "1M", 4000 → "4000".
pub fn write_kmg(mut val: u64, out: &mut String) {
    const SUFFIXES: [char; 4] = ['K', 'M', 'G', 'P'];

    let mut suffix = None;
    for s in SUFFIXES {
        if val == 0 || val % 1024 != 0 {
            break;
        }
        val /= 1024;
        suffix = Some(s);
    }

    match suffix {
        Some(s) => {
            let _ = write!(out, "{}{}", val, s);
        }
        None => {
            let _ = write!(out, "{}", val);
        }
    }
}

/// Convenience wrapper around [`write_kmg`] for one-off formatting.
pub fn kmg(val: u64) -> String {
    let mut s = String::with_capacity(8);
    write_kmg(val, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_numbers() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1048576").unwrap(), 1048576);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1m").unwrap(), 1 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2u64 << 30);
        assert_eq!(parse_size("1p").unwrap(), 1 << 40);
    }

    #[test]
    fn test_parse_whitespace() {
        assert_eq!(parse_size("  8k  ").unwrap(), 8192);
        assert_eq!(parse_size("4 k").unwrap(), 4096);
    }

    #[test]
    fn test_parse_size_errors() {
        assert!(parse_size("").is_err());
        assert!(parse_size("k").is_err());
        assert!(parse_size("-1k").is_err());
        assert!(parse_size("4x").is_err());
        assert!(parse_size("1.5k").is_err());
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("30").unwrap(), 30);
        assert_eq!(parse_time("30s").unwrap(), 30);
        assert_eq!(parse_time("5m").unwrap(), 300);
        assert_eq!(parse_time("2h").unwrap(), 7200);
        assert_eq!(parse_time("1d").unwrap(), 86400);
        assert!(parse_time("5y").is_err());
    }

    #[test]
    fn test_parse_range_single() {
        assert_eq!(parse_range("4k:64k").unwrap(), [4096, 65536, 4096, 65536]);
    }

    #[test]
    fn test_parse_range_double() {
        assert_eq!(
            parse_range("4k:64k,1k:8k").unwrap(),
            [4096, 65536, 1024, 8192]
        );
    }

    #[test]
    fn test_parse_range_errors() {
        assert!(parse_range("4k").is_err());
        assert!(parse_range("64k:4k").is_err());
        assert!(parse_range("a:b").is_err());
    }

    #[test]
    fn test_kmg_round_trip() {
        assert_eq!(kmg(4096), "4K");
        assert_eq!(kmg(1 << 20), "1M");
        assert_eq!(kmg(3 << 30), "3G");
        assert_eq!(kmg(4000), "4000");
        assert_eq!(kmg(0), "0");
        assert_eq!(parse_size(&kmg(65536)).unwrap(), 65536);
    }
}
