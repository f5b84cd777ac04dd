//! Billing anniversary date arithmetic.
//!
//! Adding months always clamps to the end of a shorter target month
//! (Jan 31 + 1 month = Feb 28/29, never Mar 3).

use chrono::{Datelike, Months, NaiveDate};

use super::types::BillingFrequency;

/// Last calendar day of the month containing `date`.
#[must_use]
pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let first = date.with_day(1).unwrap_or(date);
    first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// Number of days in the month containing `date`.
#[must_use]
pub fn days_in_month(date: NaiveDate) -> u32 {
    last_day_of_month(date).day()
}

#[must_use]
pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date == last_day_of_month(date)
}

/// Add `months`, clamping the day to the target month's length.
#[must_use]
pub fn add_months_clamped(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX)
}

/// Next billing date after `current`.
///
/// If `is_last_day` is set the result is the last day of the target month,
/// so a month-end anchor keeps landing on month end (Feb 28 -> Mar 31).
/// Otherwise the day of month of `current` is preserved, clamped to the
/// target month (Jan 31 -> Feb 28 -> Mar 28).
#[must_use]
pub fn calculate_next_billing_date(
    current: NaiveDate,
    frequency: BillingFrequency,
    is_last_day: bool,
) -> NaiveDate {
    let target = add_months_clamped(current, frequency.months());
    if is_last_day {
        last_day_of_month(target)
    } else {
        target
    }
}

/// Advance `months` from `current`, landing on `anniversary_day` of the
/// target month or on its last day when the month is shorter.
#[must_use]
pub fn add_months_on_anniversary(current: NaiveDate, months: u32, anniversary_day: u32) -> NaiveDate {
    let first_of_target = add_months_clamped(current.with_day(1).unwrap_or(current), months);
    let day = anniversary_day.clamp(1, days_in_month(first_of_target));
    first_of_target.with_day(day).unwrap_or(first_of_target)
}

/// Next billing date honoring the membership's anniversary day.
///
/// Unlike [`calculate_next_billing_date`] the anchor day is recovered once a
/// long enough month comes around again (anchor 31: Jan 31 -> Feb 28 -> Mar 31).
#[must_use]
pub fn next_anniversary_date(
    current: NaiveDate,
    frequency: BillingFrequency,
    anniversary_day: u32,
) -> NaiveDate {
    add_months_on_anniversary(current, frequency.months(), anniversary_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(date(2025, 2, 10)), date(2025, 2, 28));
        assert_eq!(last_day_of_month(date(2024, 2, 10)), date(2024, 2, 29));
        assert_eq!(last_day_of_month(date(2025, 12, 1)), date(2025, 12, 31));
        assert!(is_last_day_of_month(date(2025, 4, 30)));
        assert!(!is_last_day_of_month(date(2025, 5, 30)));
    }

    #[test]
    fn test_day_preserved_and_clamped() {
        let feb = calculate_next_billing_date(date(2025, 1, 31), BillingFrequency::Monthly, false);
        assert_eq!(feb, date(2025, 2, 28));
        let mar = calculate_next_billing_date(feb, BillingFrequency::Monthly, false);
        assert_eq!(mar, date(2025, 3, 28));
    }

    #[test]
    fn test_leap_year_clamp() {
        let feb = calculate_next_billing_date(date(2024, 1, 31), BillingFrequency::Monthly, false);
        assert_eq!(feb, date(2024, 2, 29));
    }

    #[test]
    fn test_last_day_flag_sticks_to_month_end() {
        let feb = calculate_next_billing_date(date(2025, 1, 31), BillingFrequency::Monthly, true);
        assert_eq!(feb, date(2025, 2, 28));
        let mar = calculate_next_billing_date(feb, BillingFrequency::Monthly, true);
        assert_eq!(mar, date(2025, 3, 31));
        let apr = calculate_next_billing_date(mar, BillingFrequency::Monthly, true);
        assert_eq!(apr, date(2025, 4, 30));
    }

    #[test]
    fn test_year_boundary() {
        assert_eq!(
            calculate_next_billing_date(date(2024, 12, 31), BillingFrequency::Monthly, false),
            date(2025, 1, 31)
        );
        assert_eq!(
            calculate_next_billing_date(date(2024, 8, 31), BillingFrequency::Biannual, false),
            date(2025, 2, 28)
        );
        assert_eq!(
            calculate_next_billing_date(date(2024, 2, 29), BillingFrequency::Annual, false),
            date(2025, 2, 28)
        );
        assert_eq!(
            calculate_next_billing_date(date(2023, 2, 28), BillingFrequency::Annual, true),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn test_anniversary_day_recovers() {
        let feb = next_anniversary_date(date(2025, 1, 31), BillingFrequency::Monthly, 31);
        assert_eq!(feb, date(2025, 2, 28));
        let mar = next_anniversary_date(feb, BillingFrequency::Monthly, 31);
        assert_eq!(mar, date(2025, 3, 31));
        let apr = next_anniversary_date(mar, BillingFrequency::Monthly, 31);
        assert_eq!(apr, date(2025, 4, 30));
    }

    #[test]
    fn test_anniversary_mid_month() {
        assert_eq!(
            next_anniversary_date(date(2025, 1, 15), BillingFrequency::Biannual, 15),
            date(2025, 7, 15)
        );
        assert_eq!(
            next_anniversary_date(date(2025, 11, 15), BillingFrequency::Annual, 15),
            date(2026, 11, 15)
        );
    }

    #[test]
    fn test_add_months_on_anniversary() {
        assert_eq!(add_months_on_anniversary(date(2025, 1, 31), 4, 31), date(2025, 5, 31));
        assert_eq!(add_months_on_anniversary(date(2025, 2, 28), 1, 30), date(2025, 3, 30));
        assert_eq!(add_months_on_anniversary(date(2025, 11, 30), 3, 30), date(2026, 2, 28));
    }
}
