//! File-list aggregator: turns the streamed `file_list` response body into
//! `Recording` records, tracking the optional in-band expected-count header
//! across many frames.

use chrono::{NaiveDate, NaiveDateTime};
use log::warn;

/// Sanity bound on a record's name length; anything past this is treated as
/// a malformed record rather than "need more bytes".
const MAX_NAME_LENGTH: usize = 4096;

const MONTH_ABBREVIATIONS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub version: u8,
    pub filename: String,
    pub file_length: u32,
    pub signature: [u8; 16],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub filename: String,
    pub size: u32,
    pub duration_seconds: f64,
    pub created_at: Option<NaiveDateTime>,
    pub version: u8,
    pub signature: [u8; 16],
}

/// Parse as many complete records as possible from `buf`. Returns the
/// records found, how many bytes were consumed, and `Some(reason)` if
/// parsing stopped because a record looked malformed (as opposed to simply
/// running out of buffered bytes).
fn parse_records(buf: &[u8]) -> (Vec<RawRecord>, usize, Option<String>) {
    let mut records = Vec::new();
    let mut offset = 0;

    loop {
        if offset + 4 > buf.len() {
            break;
        }
        let version = buf[offset];
        let name_length = ((buf[offset + 1] as usize) << 16)
            | ((buf[offset + 2] as usize) << 8)
            | (buf[offset + 3] as usize);

        if name_length > MAX_NAME_LENGTH {
            return (
                records,
                offset,
                Some(format!("implausible name_length {name_length}")),
            );
        }

        let record_len = 4 + name_length + 4 + 6 + 16;
        if offset + record_len > buf.len() {
            break;
        }

        let name_start = offset + 4;
        let name_end = name_start + name_length;
        let filename = String::from_utf8_lossy(&buf[name_start..name_end])
            .trim_end_matches('\0')
            .to_string();

        let len_start = name_end;
        let file_length = u32::from_be_bytes(
            buf[len_start..len_start + 4]
                .try_into()
                .expect("slice length checked above"),
        );

        let sig_start = len_start + 4 + 6;
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[sig_start..sig_start + 16]);

        records.push(RawRecord {
            version,
            filename,
            file_length,
            signature,
        });
        offset += record_len;
    }

    (records, offset, None)
}

/// Accumulates frame bodies from a `file_list` stream into parsed records,
/// consuming the optional `FF FF <count>` header once at the very start.
#[derive(Debug, Default)]
pub struct FileListAggregator {
    buffer: Vec<u8>,
    header_checked: bool,
    expected_count: Option<u32>,
    records: Vec<RawRecord>,
    aborted: bool,
}

impl FileListAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame's body in. Returns `true` if the caller should stop
    /// reading (expected count reached, an empty terminator frame arrived,
    /// or a malformed record was hit).
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.buffer.extend_from_slice(chunk);

        if !self.header_checked {
            if self.buffer.len() < 2 {
                return false;
            }
            if self.buffer[0..2] == [0xFF, 0xFF] {
                if self.buffer.len() < 6 {
                    return false;
                }
                let count = u32::from_be_bytes([
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                    self.buffer[5],
                ]);
                self.expected_count = Some(count);
                self.buffer.drain(..6);
            }
            self.header_checked = true;
        }

        let (mut new_records, consumed, malformed) = parse_records(&self.buffer);
        self.buffer.drain(..consumed);
        self.records.append(&mut new_records);

        if let Some(reason) = malformed {
            warn!(
                "malformed file-list record at offset {}: {reason}, returning {} records parsed so far",
                consumed,
                self.records.len()
            );
            self.aborted = true;
            return true;
        }

        if let Some(expected) = self.expected_count {
            if self.records.len() as u32 >= expected {
                return true;
            }
        }
        false
    }

    pub fn expected_count(&self) -> Option<u32> {
        self.expected_count
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn into_recordings(self) -> Vec<Recording> {
        self.records.into_iter().map(to_recording).collect()
    }
}

fn to_recording(raw: RawRecord) -> Recording {
    let duration_seconds = calculate_duration_seconds(raw.version, raw.file_length);
    let created_at = extract_timestamp(&raw.filename);
    Recording {
        filename: raw.filename,
        size: raw.file_length,
        duration_seconds,
        created_at,
        version: raw.version,
        signature: raw.signature,
    }
}

/// Duration formulas, preserved exactly including the unexplained "×4"
/// empirical scale factor.
pub fn calculate_duration_seconds(version: u8, size: u32) -> f64 {
    let size_f = size as f64;
    match version {
        1 => (size_f / 32.0) * 2.0 * 4.0,
        2 => {
            if size <= 44 {
                0.0
            } else {
                ((size_f - 44.0) / (48000.0 * 2.0)) * 4.0
            }
        }
        3 => {
            if size <= 44 {
                0.0
            } else {
                ((size_f - 44.0) / (24000.0 * 2.0)) * 4.0
            }
        }
        5 => (size_f / 12000.0) * 4.0,
        _ => (size_f / (16000.0 * 2.0)) * 4.0,
    }
}

/// Try both recognized filename shapes in order; `None` if neither matches.
pub fn extract_timestamp(filename: &str) -> Option<NaiveDateTime> {
    let lower = filename.to_ascii_lowercase();
    if (lower.ends_with(".wav") || lower.ends_with(".hda"))
        && lower.contains("rec")
        && filename.len() >= 14
        && filename.as_bytes()[0..14].iter().all(u8::is_ascii_digit)
    {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&filename[0..14], "%Y%m%d%H%M%S") {
            return Some(dt);
        }
    }

    let parts: Vec<&str> = filename.splitn(3, '-').collect();
    if parts.len() < 2 {
        return None;
    }
    let (year, month, day) = parse_date_token(parts[0])?;
    let time_token = parts[1];
    if time_token.len() < 6 || !time_token.as_bytes()[0..6].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let hour: u32 = time_token[0..2].parse().ok()?;
    let minute: u32 = time_token[2..4].parse().ok()?;
    let second: u32 = time_token[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

fn parse_date_token(token: &str) -> Option<(i32, u32, u32)> {
    if token.len() == 9 {
        let (year_str, rest) = token.split_at(4);
        let year: i32 = year_str.parse().ok()?;
        let (month, day) = parse_month_day(rest)?;
        return Some((year, month, day));
    }
    if token.len() == 7 {
        let (year_str, rest) = token.split_at(2);
        let year2: i32 = year_str.parse().ok()?;
        let (month, day) = parse_month_day(rest)?;
        return Some((2000 + year2, month, day));
    }
    None
}

fn parse_month_day(rest: &str) -> Option<(u32, u32)> {
    if rest.len() != 5 {
        return None;
    }
    let (month_abbr, day_str) = rest.split_at(3);
    let month = MONTH_ABBREVIATIONS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month_abbr))? as u32
        + 1;
    let day: u32 = day_str.parse().ok()?;
    Some((month, day))
}
