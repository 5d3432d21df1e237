//! Receipt numbers
//!
//! Receipts are numbered `PREFIX-YYYY-NNNNNN` from a per-calendar-year
//! counter. The counter is advanced inside the settlement transaction, so a
//! rolled back settlement may leave a gap; a number is never issued twice.

use chrono::{DateTime, Datelike, Utc};

/// Digits of the sequence part
pub const SEQUENCE_WIDTH: usize = 6;

/// Counter year for a payment time
pub fn receipt_year(at: DateTime<Utc>) -> i32 {
    at.year()
}

/// Format a receipt number
pub fn format_receipt_no(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{:04}-{:0width$}", prefix, year, sequence, width = SEQUENCE_WIDTH)
}

/// Split a receipt number into (prefix, year, sequence)
pub fn parse_receipt_no(receipt_no: &str) -> Option<(&str, i32, i64)> {
    let mut parts = receipt_no.rsplitn(3, '-');
    let sequence = parts.next()?;
    let year = parts.next()?;
    let prefix = parts.next()?;

    if prefix.is_empty() || year.len() != 4 || sequence.len() < SEQUENCE_WIDTH {
        return None;
    }

    Some((prefix, year.parse().ok()?, sequence.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_pads_sequence() {
        assert_eq!(format_receipt_no("BG", 2026, 1), "BG-2026-000001");
        assert_eq!(format_receipt_no("BG", 2026, 1_234_567), "BG-2026-1234567");
    }

    #[test]
    fn test_parse_round_trip() {
        assert_eq!(parse_receipt_no("BG-2026-000042"), Some(("BG", 2026, 42)));
        assert_eq!(parse_receipt_no("BG-26-000042"), None);
        assert_eq!(parse_receipt_no("garbage"), None);
    }

    #[test]
    fn test_year_boundary_uses_utc() {
        let at = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(receipt_year(at), 2026);
        let at = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(receipt_year(at), 2027);
    }

    #[test]
    fn test_numbers_order_lexically_within_year() {
        let a = format_receipt_no("BG", 2026, 9);
        let b = format_receipt_no("BG", 2026, 10);
        assert!(a < b);
    }
}
