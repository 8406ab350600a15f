use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};

use crate::model::apperror::{ApplicationError, ErrorType};

/**
 * Calendar month containing a reading, as seen by the service clock.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthWindow {
    /**
     * First instant of the month.
     */
    pub start: DateTime<Utc>,
    /**
     * Last representable instant of the month (one microsecond before the next month starts).
     */
    pub end: DateTime<Utc>,
    /**
     * First day of the month.
     */
    pub reference_month: NaiveDate,
}

impl MonthWindow {
    /**
     * Whether the datetime lies within the window, both ends inclusive.
     */
    #[cfg(test)]
    pub fn contains(&self, datetime: DateTime<Utc>) -> bool {
        self.start <= datetime && datetime <= self.end
    }
}

/**
 * Computes the calendar month window containing `datetime` for a clock running at `offset`.
 *
 * # Arguments
 * `datetime`: Date and time of the reading.
 * `offset`: Offset of the service clock.
 *
 * # Returns
 * The window or an `Application` error when the month is out of the supported date range.
 */
pub fn month_window(datetime: DateTime<Utc>, offset: FixedOffset) -> Result<MonthWindow, ApplicationError> {
    let local = datetime.with_timezone(&offset);
    let reference_month = NaiveDate::from_ymd_opt(local.year(), local.month(), 1).ok_or_else(|| out_of_range(datetime))?;
    let next_month = reference_month.checked_add_months(Months::new(1)).ok_or_else(|| out_of_range(datetime))?;
    let start = offset.from_local_datetime(&reference_month.and_time(NaiveTime::MIN)).single().ok_or_else(|| out_of_range(datetime))?;
    let next_start = offset.from_local_datetime(&next_month.and_time(NaiveTime::MIN)).single().ok_or_else(|| out_of_range(datetime))?;
    Ok(MonthWindow { start: start.with_timezone(&Utc), end: next_start.with_timezone(&Utc) - TimeDelta::microseconds(1), reference_month })
}

fn out_of_range(datetime: DateTime<Utc>) -> ApplicationError {
    ApplicationError::new(ErrorType::Application, format!("Month of {datetime} is out of range"))
}
