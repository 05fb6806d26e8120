//! Plugin version handling.
//!
//! Versions are dot-separated numeric sequences. Manifests and catalog entries
//! must use the strict form; comparison is lenient so that a sloppy catalog
//! can never make the update check panic or misorder.

use std::cmp::Ordering;

/// Checks the strict version form: one or more dot-separated runs of digits.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Compares two version strings component by component.
///
/// Missing components and components that are not integers count as `0`,
/// so `1.2` and `1.2.0` are equal and `1.10.0` is newer than `1.2.0`.
/// Components are compared by value at any length, never truncated.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let x = left.get(i).copied().unwrap_or("");
        let y = right.get(i).copied().unwrap_or("");
        match x.len().cmp(&y.len()).then_with(|| x.cmp(y)) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}

/// Returns true when `candidate` is strictly newer than `installed`.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    compare_versions(candidate, installed) == Ordering::Greater
}

/// Returns true when a host at `host_version` satisfies `minimum`.
pub fn satisfies_minimum(host_version: &str, minimum: &str) -> bool {
    compare_versions(host_version, minimum) != Ordering::Less
}

/// Digit runs without leading zeros; zero and non-numeric parts become "".
fn components(version: &str) -> Vec<&str> {
    version
        .trim()
        .split('.')
        .map(|part| {
            let part = part.trim();
            if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                part.trim_start_matches('0')
            } else {
                ""
            }
        })
        .collect()
}
