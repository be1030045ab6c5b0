//! Timestamp text forms.
//!
//! Finite instants after year zero are written as ISO-8601 in UTC. Years at or
//! before zero (astronomical numbering, so year 0 is 1 BC) cannot be written
//! that way and use PostgreSQL's own `BC` suffix instead.
//!
//! Parsing accepts what the server prints under `DateStyle = ISO`:
//! `2016-12-24 20:58:45.123456+13`, `0099-01-08 BC`, `1299-01-08 19:37:49+11:39:04 BC`,
//! `infinity` and `-infinity`. Fractional seconds are truncated to milliseconds.

use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike};

use crate::error::{Error, Result};
use crate::value::Timestamp;

/// Render a timestamp as parameter text.
pub fn encode_timestamp(ts: &Timestamp) -> String {
    match ts {
        Timestamp::Infinity => "infinity".into(),
        Timestamp::NegInfinity => "-infinity".into(),
        Timestamp::At(at) if at.year() > 0 => at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        Timestamp::At(at) => format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03} BC",
            1 - at.year(),
            at.month(),
            at.day(),
            at.hour(),
            at.minute(),
            at.second(),
            at.timestamp_subsec_millis(),
        ),
    }
}

/// Parse a date, timestamp or timestamptz printed by the server.
pub fn parse_timestamp(text: &str) -> Result<Timestamp> {
    let text = text.trim();
    match text {
        "infinity" => return Ok(Timestamp::Infinity),
        "-infinity" => return Ok(Timestamp::NegInfinity),
        _ => {}
    }

    let (body, bc) = match text.strip_suffix(" BC") {
        Some(body) => (body, true),
        None => (text, false),
    };

    let mut cur = Cursor {
        bytes: body.as_bytes(),
        pos: 0,
    };
    let invalid = || Error::Decode(format!("invalid timestamp: {text}"));

    let year = cur.number().ok_or_else(invalid)?;
    cur.expect(b'-').ok_or_else(invalid)?;
    let month = cur.number().ok_or_else(invalid)?;
    cur.expect(b'-').ok_or_else(invalid)?;
    let day = cur.number().ok_or_else(invalid)?;

    let mut hms = (0, 0, 0);
    let mut millis = 0;
    let mut offset_secs: i64 = 0;

    if cur.eat(b' ') || cur.eat(b'T') {
        let hour = cur.number().ok_or_else(invalid)?;
        cur.expect(b':').ok_or_else(invalid)?;
        let minute = cur.number().ok_or_else(invalid)?;
        let second = if cur.eat(b':') {
            cur.number().ok_or_else(invalid)?
        } else {
            0
        };
        hms = (hour, minute, second);
        if cur.eat(b'.') {
            millis = cur.fraction_millis().ok_or_else(invalid)?;
        }

        if !cur.eat(b'Z') {
            let sign = if cur.eat(b'+') {
                Some(1)
            } else if cur.eat(b'-') {
                Some(-1)
            } else {
                None
            };
            if let Some(sign) = sign {
                let hh = cur.number().ok_or_else(invalid)?;
                let mm = if cur.eat(b':') {
                    cur.number().ok_or_else(invalid)?
                } else {
                    0
                };
                let ss = if cur.eat(b':') {
                    cur.number().ok_or_else(invalid)?
                } else {
                    0
                };
                offset_secs = sign * (i64::from(hh) * 3600 + i64::from(mm) * 60 + i64::from(ss));
            }
        }
    }

    if !cur.is_done() {
        return Err(invalid());
    }

    let year = i32::try_from(year).map_err(|_| invalid())?;
    let year = if bc { 1 - year } else { year };
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
    let time = NaiveTime::from_hms_milli_opt(hms.0, hms.1, hms.2, millis).ok_or_else(invalid)?;
    let local = date.and_time(time);
    let utc = local
        .checked_sub_signed(TimeDelta::seconds(offset_secs))
        .ok_or_else(invalid)?;
    Ok(Timestamp::At(utc.and_utc()))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn eat(&mut self, b: u8) -> bool {
        if self.bytes.get(self.pos) == Some(&b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        self.eat(b).then_some(())
    }

    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn number(&mut self) -> Option<u32> {
        let start = self.pos;
        let mut n: u32 = 0;
        while let Some(&b) = self.bytes.get(self.pos) {
            if !b.is_ascii_digit() {
                break;
            }
            n = n.checked_mul(10)?.checked_add(u32::from(b - b'0'))?;
            self.pos += 1;
        }
        (self.pos > start).then_some(n)
    }

    /// First three fractional digits as milliseconds; the rest are dropped.
    fn fraction_millis(&mut self) -> Option<u32> {
        let start = self.pos;
        let mut millis = 0;
        while let Some(&b) = self.bytes.get(self.pos) {
            if !b.is_ascii_digit() {
                break;
            }
            let index = self.pos - start;
            if index < 3 {
                millis = millis * 10 + u32::from(b - b'0');
            }
            self.pos += 1;
        }
        let digits = self.pos - start;
        if digits == 0 {
            return None;
        }
        for _ in digits..3 {
            millis *= 10;
        }
        Some(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(millis: i64) -> Timestamp {
        Timestamp::At(DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default())
    }

    fn iso(ts: &Timestamp) -> String {
        match ts {
            Timestamp::At(at) => at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn encode_epoch_and_year_one() {
        assert_eq!(encode_timestamp(&at(0)), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            encode_timestamp(&at(-62_135_596_800_000)),
            "0001-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn encode_bc() {
        assert_eq!(
            encode_timestamp(&at(-62_135_596_800_001)),
            "0001-12-31T23:59:59.999 BC"
        );
        // 99 BC is astronomical year -98
        let ts = parse_timestamp("0099-01-08 BC").ok();
        assert_eq!(
            ts.as_ref().map(encode_timestamp).as_deref(),
            Some("0099-01-08T00:00:00.000 BC")
        );
    }

    #[test]
    fn encode_infinities() {
        assert_eq!(encode_timestamp(&Timestamp::Infinity), "infinity");
        assert_eq!(encode_timestamp(&Timestamp::NegInfinity), "-infinity");
    }

    #[test]
    fn parse_forms() {
        let cases = [
            ("2015-07-05", "2015-07-05T00:00:00.000Z"),
            ("2016-12-24 20:58:45", "2016-12-24T20:58:45.000Z"),
            ("2016-12-24 20:58:45.1", "2016-12-24T20:58:45.100Z"),
            ("2016-12-24 20:58:45.123456", "2016-12-24T20:58:45.123Z"),
            ("2016-12-24 20:58:45.123+13", "2016-12-24T07:58:45.123Z"),
            ("2016-12-24 20:58:45-03:30", "2016-12-25T00:28:45.000Z"),
            ("1970-01-01T00:00:00.000Z", "1970-01-01T00:00:00.000Z"),
            ("0001-01-01 00:00:00", "0001-01-01T00:00:00.000Z"),
        ];
        for (input, expected) in cases {
            let parsed = parse_timestamp(input);
            assert_eq!(
                parsed.as_ref().map(iso).ok().as_deref(),
                Some(expected),
                "{input}"
            );
        }
    }

    #[test]
    fn parse_bc_with_seconds_offset() {
        let parsed = parse_timestamp("1299-01-08 19:37:49+11:39:04 BC").ok();
        let expected = NaiveDate::from_ymd_opt(-1298, 1, 8)
            .and_then(|d| d.and_hms_opt(7, 58, 45))
            .map(|dt| Timestamp::At(dt.and_utc()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parse_infinities() {
        assert_eq!(parse_timestamp("infinity").ok(), Some(Timestamp::Infinity));
        assert_eq!(
            parse_timestamp("-infinity").ok(),
            Some(Timestamp::NegInfinity)
        );
    }

    #[test]
    fn bc_round_trip() {
        for millis in [-62_135_596_800_001_i64, -65_198_203_200_000, 0, 1_500_000_000_123] {
            let ts = at(millis);
            let text = encode_timestamp(&ts).replace('T', " ").replace('Z', "");
            assert_eq!(parse_timestamp(&text).ok(), Some(ts), "{text}");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("2015-13-01").is_err());
        assert!(parse_timestamp("2015-01-01 10:00:00 extra").is_err());
    }
}
