//! Lenient version strings.
//!
//! Game packages and release tags use free-form version strings such as
//! `v1.2`, `1.10.0-beta` or `release 3`. Every maximal run of ASCII digits is
//! one component; everything else separates components.

use std::cmp::Ordering;

/// Parse an arbitrary string into its numeric components.
///
/// Digit runs too large for `u64` saturate at `u64::MAX`.
pub fn parse_version(raw: &str) -> Vec<u64> {
    let mut components = Vec::new();
    let mut current: Option<u64> = None;

    for c in raw.chars() {
        match c.to_digit(10) {
            Some(digit) => {
                let value = current.unwrap_or(0);
                current = Some(
                    value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(u64::from(digit)))
                        .unwrap_or(u64::MAX),
                );
            }
            None => {
                if let Some(value) = current.take() {
                    components.push(value);
                }
            }
        }
    }

    if let Some(value) = current {
        components.push(value);
    }

    components
}

/// Compare two component lists; missing trailing components count as zero.
pub fn compare_components(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());

    for i in 0..len {
        let av = a.get(i).copied().unwrap_or(0);
        let bv = b.get(i).copied().unwrap_or(0);

        match av.cmp(&bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Compare two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    compare_components(&parse_version(a), &parse_version(b))
}
