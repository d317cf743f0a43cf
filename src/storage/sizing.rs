// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sizing helpers for brand-new camera storage files (SPEC_FULL §3
//! supplement; signatures grounded in
//! `r_storage::required_file_size_for_retention_hours` /
//! `r_storage::human_readable_file_size`).

use crate::storage::dumbdex::max_indexes_within;
use crate::storage::HEADER_SIZE;

/// Given a desired retention window and an assumed steady-state byte
/// rate, pick `(num_blocks, total_file_size)` for a storage file of
/// `block_size` bytes such that `num_blocks * block_size` covers the
/// retention window and `num_blocks` fits within the dumbdex's capacity
/// for that `block_size`.
pub fn required_file_size_for_retention_hours(
    retention_hours: u64,
    byte_rate: u64,
    block_size: u32,
) -> (u32, u64) {
    let retention_bytes = byte_rate.saturating_mul(retention_hours * 3600);
    let wanted_blocks = (retention_bytes / block_size as u64).max(1);
    let max_blocks = max_indexes_within(block_size);
    let num_blocks = wanted_blocks.min(max_blocks).max(1) as u32;
    let total = HEADER_SIZE as u64 + block_size as u64 + block_size as u64 * num_blocks as u64;
    (num_blocks, total)
}

/// Render a byte count as a human-scaled string (`"4.00 MiB"`, `"1.50 GiB"`).
pub fn human_readable_file_size(size: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = size;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_for_one_day_at_one_mbps() {
        let (num_blocks, total) = required_file_size_for_retention_hours(24, 1_000_000, 4 * 1024 * 1024);
        assert!(num_blocks >= 1);
        assert!(total > (24 * 3600 * 1_000_000) as u64 / 2);
    }

    #[test]
    fn formats_human_readable_sizes() {
        assert_eq!(human_readable_file_size(512.0), "512 B");
        assert_eq!(human_readable_file_size(4.0 * 1024.0 * 1024.0), "4.00 MiB");
    }
}
