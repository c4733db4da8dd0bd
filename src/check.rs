//! Response checks.
//!
//! A [`Check`] is a small pipeline applied to one response:
//!
//! ```text
//! extract -> transform (optional) -> save (optional) -> validate
//! ```
//!
//! Checks attached to a request run in declared order and each one short-circuits
//! independently. Values are saved even when validation then fails, so a failed run
//! keeps its diagnostic context in the session. Any failing check fails the request.
use std::time::Duration;

use regex::Regex;

use crate::{
    error::{ConfigurationError, UserError},
    protocol::HttpResponse,
    session::{Session, Value},
};

#[derive(Debug, Clone)]
pub enum Extractor {
    /// The response status code, as a number.
    Status,
    /// First header with this name, compared case-insensitively.
    Header(String),
    /// The whole body as a string.
    Body,
    /// A capture group of the first match in the body.
    Regex { pattern: Regex, group: usize },
    /// A value of the JSON body addressed by an RFC 6901 pointer (`/user/id`).
    JsonPointer(String),
    /// Response time in milliseconds.
    ResponseTime,
}

impl Extractor {
    fn extract(&self, response: &HttpResponse, latency: Duration) -> Option<Value> {
        match self {
            Extractor::Status => Some(Value::from(response.status)),
            Extractor::Header(name) => response.header(name).map(Value::from),
            Extractor::Body => Some(Value::from(response.body.as_str())),
            Extractor::Regex { pattern, group } => pattern
                .captures(&response.body)
                .and_then(|c| c.get(*group))
                .map(|m| Value::from(m.as_str())),
            Extractor::JsonPointer(pointer) => serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|json| json.pointer(pointer).cloned()),
            Extractor::ResponseTime => Some(Value::from(latency.as_secs_f64() * 1000.0)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Extractor::Status => "status".to_string(),
            Extractor::Header(name) => format!("header({name})"),
            Extractor::Body => "body".to_string(),
            Extractor::Regex { pattern, .. } => format!("regex({})", pattern.as_str()),
            Extractor::JsonPointer(pointer) => format!("jsonPointer({pointer})"),
            Extractor::ResponseTime => "responseTime".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Validator {
    Is(Value),
    Not(Value),
    In(Vec<Value>),
    Exists,
    NotExists,
    Contains(String),
    LessThan(f64),
    GreaterThan(f64),
    Custom(fn(&Value, &Session) -> Result<(), String>),
}

impl Validator {
    fn validate(&self, found: Option<&Value>, session: &Session) -> Result<(), String> {
        let Some(value) = found else {
            return match self {
                Validator::NotExists => Ok(()),
                _ => Err("found nothing".to_string()),
            };
        };

        match self {
            Validator::Is(expected) if values_match(value, expected) => Ok(()),
            Validator::Is(expected) => Err(format!("found {value}, expected {expected}")),
            Validator::Not(unexpected) if values_match(value, unexpected) => {
                Err(format!("found unexpected {value}"))
            }
            Validator::Not(_) => Ok(()),
            Validator::In(options) if options.iter().any(|o| values_match(value, o)) => Ok(()),
            Validator::In(options) => Err(format!(
                "found {value}, expected one of {}",
                Value::from(options.clone())
            )),
            Validator::Exists => Ok(()),
            Validator::NotExists => Err(format!("found {value}, expected nothing")),
            Validator::Contains(needle) => {
                let haystack = as_text(value);
                if haystack.contains(needle.as_str()) {
                    Ok(())
                } else {
                    Err(format!("found {value}, expected it to contain `{needle}`"))
                }
            }
            Validator::LessThan(bound) => match value.as_f64() {
                Some(n) if n < *bound => Ok(()),
                _ => Err(format!("found {value}, expected less than {bound}")),
            },
            Validator::GreaterThan(bound) => match value.as_f64() {
                Some(n) if n > *bound => Ok(()),
                _ => Err(format!("found {value}, expected greater than {bound}")),
            },
            Validator::Custom(validate) => validate(value, session),
        }
    }
}

/// Numbers compare numerically so that `200` matches `200.0`; everything else by equality.
fn values_match(found: &Value, expected: &Value) -> bool {
    match (found.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => found == expected,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    name: Option<String>,
    condition: Option<fn(&Session) -> bool>,
    extractor: Extractor,
    transform: Option<fn(Value) -> Value>,
    validator: Validator,
    save_as: Option<String>,
}

impl Check {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            name: None,
            condition: None,
            extractor,
            transform: None,
            validator: Validator::Exists,
            save_as: None,
        }
    }

    pub fn status() -> Self {
        Self::new(Extractor::Status)
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::new(Extractor::Header(name.into()))
    }

    pub fn body_string() -> Self {
        Self::new(Extractor::Body)
    }

    pub fn json_pointer(pointer: impl Into<String>) -> Self {
        Self::new(Extractor::JsonPointer(pointer.into()))
    }

    pub fn response_time() -> Self {
        Self::new(Extractor::ResponseTime)
    }

    /// Extracts capture group 1 (or the whole match when the pattern has no group).
    pub fn regex(pattern: &str) -> Result<Self, ConfigurationError> {
        let compiled = Regex::new(pattern).map_err(|e| ConfigurationError::Regex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let group = usize::from(compiled.captures_len() > 1);
        Ok(Self::new(Extractor::Regex {
            pattern: compiled,
            group,
        }))
    }

    pub fn is(self, expected: impl Into<Value>) -> Self {
        self.validate_with(Validator::Is(expected.into()))
    }

    pub fn not(self, unexpected: impl Into<Value>) -> Self {
        self.validate_with(Validator::Not(unexpected.into()))
    }

    pub fn in_<I, V>(self, options: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.validate_with(Validator::In(options.into_iter().map(Into::into).collect()))
    }

    pub fn exists(self) -> Self {
        self.validate_with(Validator::Exists)
    }

    pub fn not_exists(self) -> Self {
        self.validate_with(Validator::NotExists)
    }

    pub fn contains(self, needle: impl Into<String>) -> Self {
        self.validate_with(Validator::Contains(needle.into()))
    }

    pub fn lt(self, bound: f64) -> Self {
        self.validate_with(Validator::LessThan(bound))
    }

    pub fn gt(self, bound: f64) -> Self {
        self.validate_with(Validator::GreaterThan(bound))
    }

    pub fn validate(self, validate: fn(&Value, &Session) -> Result<(), String>) -> Self {
        self.validate_with(Validator::Custom(validate))
    }

    pub fn validate_with(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn transform(mut self, transform: fn(Value) -> Value) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only applies the check when `condition` holds for the user's session.
    pub fn when(mut self, condition: fn(&Session) -> bool) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn saves(&self) -> Option<&str> {
        self.save_as.as_deref()
    }

    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.extractor.describe())
    }

    /// Runs this check and returns the validation failure, if any.
    pub fn apply(
        &self,
        response: &HttpResponse,
        latency: Duration,
        session: &mut Session,
    ) -> Result<(), String> {
        if self.condition.is_some_and(|condition| !condition(session)) {
            return Ok(());
        }

        let mut found = self.extractor.extract(response, latency);
        if let Some(transform) = self.transform {
            found = found.map(transform);
        }
        if let (Some(key), Some(value)) = (&self.save_as, &found) {
            session.insert(key.clone(), value.clone());
        }
        self.validator
            .validate(found.as_ref(), session)
            .map_err(|reason| format!("{}: {reason}", self.label()))
    }
}

/// Applies `checks` in order and fails with the first failing check's message.
pub fn apply_checks(
    checks: &[Check],
    response: &HttpResponse,
    latency: Duration,
    session: &mut Session,
) -> Result<(), UserError> {
    let mut first_failure = None;
    for check in checks {
        if let Err(reason) = check.apply(response, latency, session) {
            first_failure.get_or_insert(reason);
        }
    }
    match first_failure {
        Some(reason) => Err(UserError::Validation(reason)),
        None => Ok(()),
    }
}

/// Upper-cases string values, leaving other values untouched.
pub fn uppercase(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        other => other,
    }
}

pub fn lowercase(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other,
    }
}

pub fn trim(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    fn run(checks: &[Check], response: &HttpResponse, session: &mut Session) -> Result<(), UserError> {
        apply_checks(checks, response, Duration::from_millis(12), session)
    }

    #[test]
    fn status_is() {
        let mut session = Session::new(1, "s");
        assert!(run(&[Check::status().is(200)], &response(200, ""), &mut session).is_ok());

        let err = run(&[Check::status().is(200)], &response(404, ""), &mut session).unwrap_err();
        assert_eq!(err, UserError::Validation("status: found 404, expected 200".into()));
    }

    #[test]
    fn status_not_and_in() {
        let mut session = Session::new(1, "s");
        let ok = response(201, "");
        assert!(run(&[Check::status().not(404)], &ok, &mut session).is_ok());
        assert!(run(&[Check::status().in_([200, 201, 204])], &ok, &mut session).is_ok());
        assert!(run(&[Check::status().in_([200])], &ok, &mut session).is_err());
    }

    #[test]
    fn transform_then_save() {
        fn starts_with_hello(value: &Value, _: &Session) -> Result<(), String> {
            match value.as_str() {
                Some(s) if s.starts_with("HELLO") => Ok(()),
                _ => Err(format!("Value {value} should start with HELLO")),
            }
        }

        let mut session = Session::new(1, "s");
        let check = Check::body_string()
            .transform(uppercase)
            .validate(starts_with_hello)
            .name("Greeting message check")
            .save_as("loudMessage");

        run(&[check], &response(200, "Hello ana"), &mut session).unwrap();
        assert_eq!(session.get_str("loudMessage"), Some("HELLO ANA"));
    }

    #[test]
    fn failed_checks_still_save() {
        let mut session = Session::new(1, "s");
        let checks = [
            Check::status().is(200).save_as("status"),
            Check::json_pointer("/id").save_as("id"),
        ];
        let err = run(&checks, &response(500, r#"{"id": 9}"#), &mut session).unwrap_err();

        assert_eq!(err.kind(), "ValidationError");
        assert_eq!(session.get("status"), Some(&json!(500)));
        assert_eq!(session.get("id"), Some(&json!(9)));
    }

    #[test]
    fn first_failure_is_reported() {
        let mut session = Session::new(1, "s");
        let checks = [
            Check::status().is(200).name("first"),
            Check::header("X-Missing").name("second"),
        ];
        let err = run(&checks, &response(503, ""), &mut session).unwrap_err();
        assert!(err.to_string().starts_with("first:"));
    }

    #[test]
    fn missing_values() {
        let mut session = Session::new(1, "s");
        let resp = response(200, "{}");
        assert!(run(&[Check::header("X-Token")], &resp, &mut session).is_err());
        assert!(run(&[Check::header("X-Token").not_exists()], &resp, &mut session).is_ok());
        assert!(run(&[Check::header("content-type").contains("json")], &resp, &mut session).is_ok());
    }

    #[test]
    fn regex_and_response_time() {
        let mut session = Session::new(1, "s");
        let resp = response(200, "<a href=\"/computers/381\">ACE</a>");
        let checks = [
            Check::regex(r#"/computers/(\d+)"#).unwrap().save_as("computer"),
            Check::response_time().lt(100.0),
        ];
        run(&checks, &resp, &mut session).unwrap();
        assert_eq!(session.get_str("computer"), Some("381"));

        assert!(Check::regex("(").is_err());
    }

    #[test]
    fn conditional_checks_are_skipped() {
        fn has_message(session: &Session) -> bool {
            session.contains("loudMessage")
        }
        let check = Check::status().not(404).when(has_message);

        let mut session = Session::new(1, "s");
        assert!(run(&[check.clone()], &response(404, ""), &mut session).is_ok());

        session.insert("loudMessage", "HI");
        assert!(run(&[check], &response(404, ""), &mut session).is_err());
    }
}
