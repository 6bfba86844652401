//! Conversions for the quantities batch engines report

use regex::Regex;
use std::sync::LazyLock;

use crate::Error;

/// Splits a memory literal into its amount and unit
static MEMORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([0-9]*\.?[0-9]+)\s*([kKmMgGtT]?)[bB]?\s*$").expect("memory regex is valid")
});

/// The number of bytes in a GiB
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Converts a memory literal to whole GiB rounding up
///
/// Lowercase units are decimal (`1k` is 1000 bytes) and uppercase units are
/// binary (`1K` is 1024 bytes). A bare number is a count of bytes.
///
/// # Arguments
///
/// * `raw` - The raw memory literal
pub fn memory(raw: &str) -> Result<u64, Error> {
    // split our literal into an amount and a unit
    let captures = match MEMORY_REGEX.captures(raw) {
        Some(captures) => captures,
        None => return Err(Error::new(format!("Failed to parse memory value: {raw}"))),
    };
    // cast our amount to a float so fractional literals like 31.2G work
    let amount = captures[1].parse::<f64>()?;
    // get the multiplier for this unit
    let multiplier = match &captures[2] {
        "" => 1.0,
        "k" => 1e3,
        "m" => 1e6,
        "g" => 1e9,
        "t" => 1e12,
        "K" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => GIB,
        "T" => GIB * 1024.0,
        unit => return Err(Error::new(format!("Unknown memory unit {unit} in {raw}"))),
    };
    Ok((amount * multiplier / GIB).ceil() as u64)
}

/// Converts a count of MiB to whole GiB rounding up
///
/// # Arguments
///
/// * `mib` - The number of MiB to convert
#[must_use]
pub fn mib_to_gib(mib: u64) -> u64 {
    mib.div_ceil(1024)
}

/// Splits a value evenly across some number of parts rounding up
///
/// # Arguments
///
/// * `value` - The value to split
/// * `parts` - The number of parts to split this value across
#[must_use]
pub fn split(value: u64, parts: u64) -> u64 {
    if parts <= 1 {
        value
    } else {
        value.div_ceil(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_units() {
        assert_eq!(memory("4G").unwrap(), 4);
        assert_eq!(memory("1024M").unwrap(), 1);
        assert_eq!(memory("1025M").unwrap(), 2);
        assert_eq!(memory("1T").unwrap(), 1024);
    }

    #[test]
    fn decimal_units() {
        // 4 gigabytes is a little less than 4 GiB
        assert_eq!(memory("4g").unwrap(), 4);
        assert_eq!(memory("5g").unwrap(), 5);
        assert_eq!(memory("1000m").unwrap(), 1);
        assert_eq!(memory("2000000k").unwrap(), 2);
    }

    #[test]
    fn fractions_and_bytes() {
        assert_eq!(memory("31.2G").unwrap(), 32);
        assert_eq!(memory("0").unwrap(), 0);
        assert_eq!(memory("1").unwrap(), 1);
        assert!(memory("lots").is_err());
    }

    #[test]
    fn splitting() {
        assert_eq!(split(8, 2), 4);
        assert_eq!(split(5, 2), 3);
        assert_eq!(split(5, 0), 5);
        assert_eq!(mib_to_gib(32000), 32);
    }
}
