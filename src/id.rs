use uuid::Uuid;

/// Time-ordered row id; sorts by creation which keeps message polling
/// oldest-first cheap.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}
