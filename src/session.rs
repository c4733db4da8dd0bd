//! Per-virtual-user state.
//!
//! A [`Session`] is created when a virtual user starts, is threaded through every
//! step of its scenario and is dropped when the user reaches a terminal state. It is
//! never shared: exactly one virtual user owns each session.
use std::collections::HashMap;
use std::sync::Arc;

pub use serde_json::Value;

use crate::feeder::Record;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: u64,
    scenario: Arc<str>,
    attributes: HashMap<String, Value>,
    failed: bool,
    exit: bool,
}

impl Session {
    pub fn new(id: u64, scenario: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            scenario: scenario.into(),
            attributes: HashMap::new(),
            failed: false,
            exit: false,
        }
    }

    /// Unique identifier of the owning virtual user.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns the attribute as a string slice when it holds a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(Value::as_i64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// Pure-style setter for session transforms: consumes and returns the session.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Copies every field of a feeder record into the session.
    pub fn feed(&mut self, record: Record) {
        self.attributes.extend(record);
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn mark_succeeded(&mut self) {
        self.failed = false;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit
    }

    /// Asks the executor to stop this user after the current step.
    pub fn exit_here(mut self) -> Self {
        self.exit = true;
        self
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_is_visible_to_later_reads() {
        let session = Session::new(7, "greeting").set("someField", "value");
        assert_eq!(session.get_str("someField"), Some("value"));
        assert_eq!(session.id(), 7);
        assert_eq!(session.scenario(), "greeting");
    }

    #[test]
    fn failed_flag_round_trip() {
        let mut session = Session::new(1, "s");
        assert!(!session.is_failed());
        session.mark_failed();
        assert!(session.is_failed());
        session.mark_succeeded();
        assert!(!session.is_failed());
    }

    #[test]
    fn feeding_overwrites_existing_keys() {
        let mut session = Session::new(1, "s").set("dieRoll", 1);
        let mut record = Record::new();
        record.insert("dieRoll".to_string(), json!(6));
        record.insert("name".to_string(), json!("ana"));
        session.feed(record);

        assert_eq!(session.get_i64("dieRoll"), Some(6));
        assert_eq!(session.get_str("name"), Some("ana"));
    }

    #[test]
    fn clones_do_not_share_state() {
        let original = Session::new(1, "s");
        let copy = original.clone().set("k", "v");
        assert!(!original.contains("k"));
        assert!(copy.contains("k"));
    }
}
