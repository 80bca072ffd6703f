use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Wall-clock format the source API accepts for time-window parameters.
pub const SOURCE_TIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Render `ts` as local wall-clock time in `tz`.
///
/// The rendering carries no offset, so during a DST fall-back hour two
/// distinct instants map to the same string; see the tests below.
pub fn format_source_time(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format(SOURCE_TIME_FORMAT).to_string()
}
