/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * reboot-operator is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use chrono::{DateTime, Datelike, Duration, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use window_error::Error;

/// Weekly recurring time window during which reboots may be scheduled,
/// interpreted in local time. Immutable after construction.
#[derive(Clone, Debug)]
pub struct RebootWindow {
    start_day: Weekday,
    start_time: NaiveTime,
    length: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimePeriod {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl RebootWindow {
    /// Parses a window from a weekly start like "Mon 14:00" and a duration
    /// like "30m" or "1h30m" (h/m/s units).
    pub fn parse(start: &str, length: &str) -> Result<Self, Error> {
        let mut parts = start.split_whitespace();
        let (day, time) = match (parts.next(), parts.next(), parts.next()) {
            (Some(day), Some(time), None) => (day, time),
            _ => return Err(Error::InvalidStart { value: start.to_string() }),
        };
        let start_day = day
            .parse::<Weekday>()
            .map_err(|_| Error::InvalidStart { value: start.to_string() })?;
        let start_time = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|_| Error::InvalidStart { value: start.to_string() })?;
        Ok(RebootWindow {
            start_day,
            start_time,
            length: parse_length(length)?,
        })
    }

    /// Returns the most recently opened window, which may lie entirely in
    /// the past.
    pub fn previous(&self, now: DateTime<Local>) -> TimePeriod {
        let days_back = (now.weekday().num_days_from_monday() + 7
            - self.start_day.num_days_from_monday())
            % 7;
        let date = now.naive_local().date() - Duration::days(i64::from(days_back));
        let mut start = local_datetime(date.and_time(self.start_time));
        if start > now {
            // Same weekday, but the start time is still ahead of us.
            start = local_datetime((date - Duration::days(7)).and_time(self.start_time));
        }
        TimePeriod { start, end: start + self.length }
    }

    /// True when `now` falls inside the most recently opened window. A
    /// zero-length window never admits.
    pub fn inside(&self, now: DateTime<Local>) -> bool {
        now < self.previous(now).end
    }
}

// Wall-clock times inside a DST gap do not exist; slide past the gap.
fn local_datetime(naive: NaiveDateTime) -> DateTime<Local> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(datetime) => datetime,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(Local::now),
    }
}

fn parse_length(length: &str) -> Result<Duration, Error> {
    let invalid = || Error::InvalidLength { value: length.to_string() };
    if length.is_empty() {
        return Err(invalid());
    }
    let mut seconds: i64 = 0;
    let mut digits = String::new();
    for character in length.chars() {
        if character.is_ascii_digit() {
            digits.push(character);
            continue;
        }
        let unit = match character {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let value: i64 = digits.parse().map_err(|_| invalid())?;
        seconds += value * unit;
        digits.clear();
    }
    if !digits.is_empty() {
        // Trailing digits with no unit.
        return Err(invalid());
    }
    Ok(Duration::seconds(seconds))
}

pub mod window_error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("invalid reboot window start {value:?}, expected a weekday and a time like \"Mon 14:00\"")]
        InvalidStart { value: String },

        #[error("invalid reboot window length {value:?}, expected a duration like \"1h30m\"")]
        InvalidLength { value: String },
    }
}
