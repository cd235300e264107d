//! Change sequence numbers (CSNs).
//!
//! A CSN is a fixed 40-character string that timestamps one committed write:
//!
//! ```text
//! 20240501123456.123456Z#000000#001#000000
//! └──── timestamp ─────┘ └seq─┘ sid └mod─┘
//! ```
//!
//! Every numeric field is fixed-width and zero-padded, so lexicographic order
//! of the whole string is the (timestamp, sequence, sid, mod) order.

use crate::error::{ReplError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Length of every well-formed CSN.
pub const CSN_LEN: usize = 40;

/// Largest replica id that fits the three-hex-digit SID field.
pub const MAX_SID: u16 = 0xfff;

const SEQ_START: usize = 23;
const SID_START: usize = 30;
const MOD_START: usize = 34;
const MAX_SEQ: u32 = 0xff_ffff;

/// Replica (origin) identifier.
pub type Sid = u16;

/// A validated change sequence number.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Csn(String);

/// Check the character class at every position of a candidate CSN.
pub fn validate(raw: &str) -> Result<()> {
    let bytes = raw.as_bytes();
    if bytes.len() != CSN_LEN {
        return Err(ReplError::protocol(format!(
            "csn must be {} chars, got {}: {:?}",
            CSN_LEN,
            bytes.len(),
            raw
        )));
    }
    for (i, &b) in bytes.iter().enumerate() {
        let ok = match i {
            0..=13 | 15..=20 => b.is_ascii_digit(),
            14 => b == b'.',
            21 => b == b'Z',
            22 | 29 | 33 => b == b'#',
            _ => b.is_ascii_digit() || (b'a'..=b'f').contains(&b),
        };
        if !ok {
            return Err(ReplError::protocol(format!(
                "csn {:?}: invalid character {:?} at offset {}",
                raw, b as char, i
            )));
        }
    }
    Ok(())
}

/// Order two CSNs by (timestamp, sequence); sid and mod break remaining ties.
pub fn compare_by_time(a: &Csn, b: &Csn) -> Ordering {
    a.0.cmp(&b.0)
}

/// Group CSNs by origin: order by replica id first, then by time.
pub fn compare_by_origin(a: &Csn, b: &Csn) -> Ordering {
    a.sid()
        .cmp(&b.sid())
        .then_with(|| a.0[..SID_START].cmp(&b.0[..SID_START]))
}

/// Extract the originating replica id from a raw CSN string.
pub fn get_origin(raw: &str) -> Result<Sid> {
    validate(raw)?;
    parse_hex(&raw[SID_START..SID_START + 3])
}

fn parse_hex(field: &str) -> Result<Sid> {
    u16::from_str_radix(field, 16)
        .map_err(|e| ReplError::protocol(format!("bad hex field {:?}: {}", field, e)))
}

impl Csn {
    /// Parse and validate a CSN.
    pub fn parse(raw: &str) -> Result<Self> {
        validate(raw)?;
        Ok(Csn(raw.to_string()))
    }

    /// Build a CSN from its parts.
    pub fn from_parts(ts: DateTime<Utc>, seq: u32, sid: Sid, modnum: u32) -> Result<Self> {
        if sid > MAX_SID {
            return Err(ReplError::protocol(format!("sid {} out of range", sid)));
        }
        if seq > MAX_SEQ || modnum > MAX_SEQ {
            return Err(ReplError::protocol("csn counter out of range"));
        }
        let raw = format!(
            "{}#{:06x}#{:03x}#{:06x}",
            ts.format("%Y%m%d%H%M%S%.6fZ"),
            seq,
            sid,
            modnum
        );
        Csn::parse(&raw)
    }

    /// The originating replica id.
    pub fn sid(&self) -> Sid {
        // Validated on construction.
        u16::from_str_radix(&self.0[SID_START..SID_START + 3], 16).unwrap_or_default()
    }

    /// Per-timestamp sequence counter.
    pub fn seq(&self) -> u32 {
        u32::from_str_radix(&self.0[SEQ_START..SEQ_START + 6], 16).unwrap_or_default()
    }

    /// Per-write modification counter.
    pub fn modnum(&self) -> u32 {
        u32::from_str_radix(&self.0[MOD_START..MOD_START + 6], 16).unwrap_or_default()
    }

    /// The UTC timestamp carried by this CSN.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(&self.0[..14], "%Y%m%d%H%M%S").ok()?;
        let micros: i64 = self.0[15..21].parse().ok()?;
        Some(Utc.from_utc_datetime(&naive) + chrono::Duration::microseconds(micros))
    }

    /// The raw 40-character form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        compare_by_time(self, other) == Ordering::Greater
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_by_time(self, other)
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csn({})", self.0)
    }
}

impl FromStr for Csn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        Csn::parse(s)
    }
}

impl TryFrom<String> for Csn {
    type Error = ReplError;

    fn try_from(value: String) -> Result<Self> {
        validate(&value)?;
        Ok(Csn(value))
    }
}

impl From<Csn> for String {
    fn from(csn: Csn) -> Self {
        csn.0
    }
}

#[derive(Debug, Default)]
struct GenState {
    last_micros: i64,
    seq: u32,
}

/// Mints strictly increasing CSNs for one replica.
///
/// When the wall clock stalls or steps backward the generator keeps the last
/// timestamp and bumps the sequence counter instead.
#[derive(Debug)]
pub struct CsnGenerator {
    sid: Sid,
    state: Mutex<GenState>,
}

impl CsnGenerator {
    /// Create a generator for the given local replica id.
    pub fn new(sid: Sid) -> Result<Self> {
        if sid > MAX_SID {
            return Err(ReplError::config(format!("sid {} exceeds {}", sid, MAX_SID)));
        }
        Ok(Self {
            sid,
            state: Mutex::new(GenState::default()),
        })
    }

    /// The replica id stamped into generated CSNs.
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Mint the next CSN from the current wall clock.
    pub fn next(&self) -> Result<Csn> {
        self.next_at(Utc::now())
    }

    /// Mint the next CSN as if the clock read `now`.
    pub fn next_at(&self, now: DateTime<Utc>) -> Result<Csn> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ReplError::StoreUnavailable {
                msg: "csn generator lock poisoned".to_string(),
            })?;
        let micros = now.timestamp_micros();
        if micros > state.last_micros {
            state.last_micros = micros;
            state.seq = 0;
        } else {
            state.seq += 1;
            if state.seq > MAX_SEQ {
                state.last_micros += 1;
                state.seq = 0;
            }
        }
        let ts = Utc
            .timestamp_micros(state.last_micros)
            .single()
            .ok_or_else(|| ReplError::protocol("clock out of range"))?;
        Csn::from_parts(ts, state.seq, self.sid, 0)
    }

    /// Never mint anything at or below `seen` (used after loading a checkpoint).
    pub fn observe(&self, seen: &Csn) {
        if let (Some(ts), Ok(mut state)) = (seen.timestamp(), self.state.lock()) {
            let micros = ts.timestamp_micros();
            if micros > state.last_micros || (micros == state.last_micros && seen.seq() > state.seq)
            {
                state.last_micros = micros;
                state.seq = seen.seq();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::csn;
    use super::*;

    const SAMPLE: &str = "20240501123456.123456Z#000000#001#000000";

    #[test]
    fn test_parse_valid() {
        let c = Csn::parse(SAMPLE).unwrap();
        assert_eq!(c.sid(), 1);
        assert_eq!(c.seq(), 0);
        assert_eq!(c.as_str().len(), CSN_LEN);
    }

    #[test]
    fn test_reject_wrong_length() {
        assert!(validate("20240501123456.123456Z#000000#001#00000").is_err());
        assert!(validate("").is_err());
    }

    #[test]
    fn test_reject_bad_character_class() {
        // uppercase hex, missing Z, letter in the timestamp
        assert!(validate("20240501123456.123456Z#00000A#001#000000").is_err());
        assert!(validate("20240501123456.123456X#000000#001#000000").is_err());
        assert!(validate("2024050112345a.123456Z#000000#001#000000").is_err());
        assert!(validate("20240501123456,123456Z#000000#001#000000").is_err());
    }

    #[test]
    fn test_get_origin() {
        assert_eq!(get_origin("20240501123456.123456Z#000000#0a1#000000").unwrap(), 0xa1);
        assert!(get_origin("garbage").is_err());
    }

    #[test]
    fn test_compare_by_time_uses_seq() {
        let a = Csn::parse("20240501123456.123456Z#000000#002#000000").unwrap();
        let b = Csn::parse("20240501123456.123456Z#000001#001#000000").unwrap();
        assert_eq!(compare_by_time(&a, &b), Ordering::Less);
        assert!(b.is_newer_than(&a));
    }

    #[test]
    fn test_compare_by_origin_groups_sid() {
        let early_s2 = csn(1, 2);
        let late_s1 = csn(5, 1);
        assert_eq!(compare_by_origin(&late_s1, &early_s2), Ordering::Less);
        assert_eq!(compare_by_origin(&csn(1, 1), &csn(5, 1)), Ordering::Less);
    }

    #[test]
    fn test_from_parts_rejects_large_sid() {
        assert!(Csn::from_parts(Utc::now(), 0, 0x1000, 0).is_err());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let c = Csn::parse(SAMPLE).unwrap();
        let ts = c.timestamp().unwrap();
        assert_eq!(ts.timestamp_subsec_micros(), 123456);
        let again = Csn::from_parts(ts, 0, 1, 0).unwrap();
        assert_eq!(again, c);
    }

    #[test]
    fn test_generator_monotonic_with_stalled_clock() {
        let generator = CsnGenerator::new(3).unwrap();
        let now = Utc::now();
        let a = generator.next_at(now).unwrap();
        let b = generator.next_at(now).unwrap();
        let c = generator.next_at(now - chrono::Duration::seconds(5)).unwrap();
        assert!(b > a);
        assert!(c > b);
        assert_eq!(c.sid(), 3);
        assert_eq!(b.seq(), 1);
    }

    #[test]
    fn test_generator_observe_skips_past() {
        let generator = CsnGenerator::new(1).unwrap();
        let future = csn(10_000_000, 2);
        generator.observe(&future);
        let next = generator.next_at(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()).unwrap();
        assert!(next > future);
    }

    #[test]
    fn test_serde_validates() {
        let json = format!("\"{}\"", SAMPLE);
        let c: Csn = serde_json::from_str(&json).unwrap();
        assert_eq!(c.as_str(), SAMPLE);
        assert!(serde_json::from_str::<Csn>("\"nope\"").is_err());
    }
}
