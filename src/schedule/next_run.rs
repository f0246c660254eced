use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};

use super::{Recurrence, ScheduleRule};

/// Next occurrence of `rule` strictly after `now`, evaluated in the fixed `offset`.
pub fn compute_next_run(rule: &ScheduleRule, now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_now = now.with_timezone(&offset).naive_local();
    let today = local_now.date();
    let at = |date: NaiveDate| date.and_time(rule.time_of_day.as_naive());

    let candidate = match rule.recurrence {
        Recurrence::Daily => {
            let candidate = at(today);
            if candidate <= local_now {
                candidate + Duration::days(1)
            } else {
                candidate
            }
        }
        Recurrence::Weekly { day_of_week } => {
            let current = today.weekday().num_days_from_sunday() as i64;
            let delta = (i64::from(day_of_week) - current).rem_euclid(7);
            let candidate = at(today + Duration::days(delta));
            if delta == 0 && candidate <= local_now {
                candidate + Duration::days(7)
            } else {
                candidate
            }
        }
        Recurrence::Monthly { day_of_month } => {
            let shift = i64::from(day_of_month) - i64::from(today.day());
            let candidate = at(today + Duration::days(shift));
            if candidate <= local_now {
                // day_of_month <= 28 exists in every month
                candidate
                    .checked_add_months(Months::new(1))
                    .unwrap_or(candidate + Duration::days(28))
            } else {
                candidate
            }
        }
    };

    to_utc(candidate, offset)
}

fn to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    let utc = local - Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}
