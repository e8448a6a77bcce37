use std::{
    fmt::{Debug, Write as _},
    ops::Deref,
};

use openssl::asn1::{Asn1Time, Asn1TimeRef, TimeDiff};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::{self, TimeZone as _},
    },
    kube,
};
use time::{Date, Month, OffsetDateTime};

/// Combines the messages of an error and its sources into a [`String`] of the form `"error: source 1: source 2: root error"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    let mut full_msg = format!("{}", err);
    let mut curr_err = err.source();
    while let Some(curr_source) = curr_err {
        let _ = write!(full_msg, ": {}", curr_source);
        curr_err = curr_source.source();
    }
    full_msg
}

pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_CONFLICT: u16 = 409;

/// HTTP status of a rejected API call, [`None`] if the API server never answered.
pub fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeParseError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("unable to parse as OffsetDateTime"))]
    Parse { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// Converts an OpenSSL [`Asn1TimeRef`] into a Rustier [`OffsetDateTime`].
pub fn asn1time_to_offsetdatetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeParseError> {
    use asn1_time_parse_error::*;
    const SECS_PER_DAY: i64 = 60 * 60 * 24;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    OffsetDateTime::from_unix_timestamp(
        i64::from(days)
            .checked_mul(SECS_PER_DAY)
            .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
            .context(OverflowSnafu)?,
    )
    .context(ParseSnafu)
}

/// Adds one calendar month, clamping the day to the length of the target month
/// (so that January 31st becomes February 28th or 29th).
pub fn add_one_month(dt: OffsetDateTime) -> OffsetDateTime {
    let date = dt.date();
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        month => (date.year(), month.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => dt.replace_date(date),
        // Only reachable at the very end of the supported calendar
        Err(_) => dt.saturating_add(time::Duration::days(31)),
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("datetime {datetime} cannot be represented as a Kubernetes timestamp"))]
pub struct TimestampOutOfBoundsError {
    datetime: OffsetDateTime,
}

/// Converts a [`time`] datetime into the [`chrono`]-based [`Time`] used by Kubernetes objects.
pub fn to_kube_time(datetime: OffsetDateTime) -> Result<Time, TimestampOutOfBoundsError> {
    chrono::Utc
        .timestamp_opt(datetime.unix_timestamp(), datetime.nanosecond())
        .single()
        .map(Time)
        .context(TimestampOutOfBoundsSnafu { datetime })
}

/// Wrapper for (mostly) secret values that should not be logged.
pub struct Unloggable<T>(pub T);

impl<T> Debug for Unloggable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> Deref for Unloggable<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
