//! Session identifiers
//!
//! One identifier is generated per [`Publisher`](super::Publisher) and stamped
//! on every event it records, so downstream consumers can group the events of
//! one process lifetime.

use chrono::Utc;
use uuid::Uuid;

/// Length of the random suffix appended to the creation timestamp
const SUFFIX_LEN: usize = 9;

/// Generate a new session identifier
///
/// Format: `<unix millis>-<9 random hex chars>`, e.g. `1760800000000-3f2a9c1be`.
pub fn generate_session_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &random[..SUFFIX_LEN])
}
