/// Generates a fresh, collision-resistant flow id.
///
/// Ids are only ever compared within the rule that minted them (see the
/// open question on flow-id uniqueness scope in the design notes); 128 bits
/// of randomness is comfortably enough to avoid collisions within a single
/// instance's lifetime.
pub fn new_flow_id() -> String {
    format!("f{:032x}", rand::random::<u128>())
}

/// Subscriber ids are process-local and only need to be distinct among the
/// hub's currently-registered subscribers, so a narrower id is fine.
pub fn new_subscriber_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ids_are_distinct() {
        let a = new_flow_id();
        let b = new_flow_id();
        assert_ne!(a, b);
        assert!(a.starts_with('f'));
    }

    #[test]
    fn subscriber_ids_increase() {
        let a = new_subscriber_id();
        let b = new_subscriber_id();
        assert!(b > a);
    }
}
