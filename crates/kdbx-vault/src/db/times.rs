//! Node timestamps.

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Both file formats store whole seconds; carrying sub-second precision
/// in memory would make every save/load cycle look like a modification.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Creation/modification/access/expiry times carried by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub expires: bool,
    pub location_changed: DateTime<Utc>,
    pub usage_count: u64,
}

impl Times {
    pub fn now() -> Self {
        let now = now();
        Self {
            creation: now,
            last_modification: now,
            last_access: now,
            expiry: now,
            expires: false,
            location_changed: now,
            usage_count: 0,
        }
    }

    pub fn touch_modified(&mut self) {
        let now = now();
        self.last_modification = now;
        self.last_access = now;
    }

    pub fn touch_accessed(&mut self) {
        self.last_access = now();
    }

    pub fn touch_moved(&mut self) {
        self.location_changed = now();
    }

    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry < Utc::now()
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::now()
    }
}

/// Clamp a corrupted or out-of-range timestamp to a safe epoch instead of
/// failing the import; bad dates threaten neither confidentiality nor
/// integrity.
pub fn clamp_timestamp(seconds: i64) -> DateTime<Utc> {
    crate::codec::datetime_from_epoch_seconds(seconds.max(0))
}

/// The fallback epoch used when a timestamp cannot be represented.
pub fn safe_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2004, 1, 1, 0, 0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_times_do_not_expire() {
        assert!(!Times::now().is_expired());
    }

    #[test]
    fn past_expiry_with_flag_expires() {
        let mut times = Times::now();
        times.expiry = Utc::now() - chrono::Duration::hours(1);
        times.expires = true;
        assert!(times.is_expired());
    }

    #[test]
    fn negative_epoch_clamps() {
        let time = clamp_timestamp(-5);
        assert!(time.timestamp() < safe_epoch().timestamp());
    }
}
