use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published after a commission transition; the ops worker recomputes the
/// beneficiary's cached figures when it sees one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsRefreshRequested {
    pub beneficiary_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_snake_case_fields() {
        let beneficiary_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"beneficiary_id":"{beneficiary_id}","requested_at":"2026-10-01T12:00:00Z"}}"#
        );

        let event: StatsRefreshRequested = serde_json::from_str(&raw).unwrap();

        assert_eq!(event.beneficiary_id, beneficiary_id);
        assert_eq!(event.requested_at.to_rfc3339(), "2026-10-01T12:00:00+00:00");
    }
}
