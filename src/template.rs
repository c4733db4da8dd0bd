//! `${...}` expressions embedded in paths, headers and bodies.
//!
//! A template is parsed once, when the scenario is built, and resolved for every
//! request against the running user's [`Session`]. Supported expressions:
//!
//! - `${name}`: the session attribute `name`. Dotted names (`${user.id}`) walk into
//!   structured records when no attribute with the full name exists.
//! - `${uuid()}`: a random v4 UUID.
//! - `${randomInt(lo,hi)}`: a random integer in `lo..=hi`.
//! - `${timestamp()}`: milliseconds since the Unix epoch.
//!
//! Random functions draw from the rng handed to [`Template::resolve`], which is
//! owned by the virtual user, so runs are reproducible for a given seed.
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::{
    error::{ConfigurationError, UserError},
    session::{Session, Value},
};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Attribute(String),
    Uuid,
    RandomInt(i64, i64),
    Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Result<Vec<Segment>, String>,
}

impl Template {
    /// Parses `source`, failing on malformed expressions.
    pub fn parse(source: impl Into<String>) -> Result<Self, ConfigurationError> {
        let template = Self::lenient(source);
        template.validate()?;
        Ok(template)
    }

    /// Parses `source` and defers any syntax error to [`Template::validate`].
    ///
    /// Scenario construction validates every template, so a malformed one never
    /// reaches execution.
    pub fn lenient(source: impl Into<String>) -> Self {
        let source = source.into();
        let segments = parse_segments(&source);
        Self { source, segments }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match &self.segments {
            Ok(_) => Ok(()),
            Err(reason) => Err(ConfigurationError::Template {
                template: self.source.clone(),
                reason: reason.clone(),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template contains no expression at all.
    pub fn is_static(&self) -> bool {
        matches!(&self.segments, Ok(s) if s.iter().all(|s| matches!(s, Segment::Literal(_))))
    }

    /// Names of the session attributes this template reads.
    pub fn attributes(&self) -> Vec<&str> {
        match &self.segments {
            Ok(segments) => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Attribute(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn resolve<R: Rng>(
        &self,
        session: &Session,
        rng: &mut R,
    ) -> Result<String, UserError> {
        let segments = self.segments.as_ref().map_err(|reason| {
            UserError::Request(format!("invalid template `{}`: {reason}", self.source))
        })?;

        let mut out = String::with_capacity(self.source.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Attribute(name) => {
                    let value = lookup(session, name).ok_or_else(|| {
                        UserError::Request(format!("no attribute named `{name}` in session"))
                    })?;
                    push_value(&mut out, value);
                }
                Segment::Uuid => {
                    let bytes: [u8; 16] = rng.random();
                    let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
                    out.push_str(&uuid.to_string());
                }
                Segment::RandomInt(lo, hi) => {
                    out.push_str(&rng.random_range(*lo..=*hi).to_string());
                }
                Segment::Timestamp => {
                    let millis = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis();
                    out.push_str(&millis.to_string());
                }
            }
        }
        Ok(out)
    }
}

impl From<&str> for Template {
    fn from(value: &str) -> Self {
        Template::lenient(value)
    }
}

impl From<String> for Template {
    fn from(value: String) -> Self {
        Template::lenient(value)
    }
}

fn lookup<'a>(session: &'a Session, name: &str) -> Option<&'a Value> {
    if let Some(value) = session.get(name) {
        return Some(value);
    }
    let mut parts = name.split('.');
    let mut current = session.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

fn parse_segments(source: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = source;

    while let Some(open) = rest.find("${") {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| "unclosed `${` expression".to_string())?;
        segments.push(parse_expression(after[..close].trim())?);
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_expression(expr: &str) -> Result<Segment, String> {
    if expr.is_empty() {
        return Err("empty `${}` expression".to_string());
    }

    if let Some(open) = expr.find('(') {
        if !expr.ends_with(')') {
            return Err(format!("malformed function call `{expr}`"));
        }
        let name = expr[..open].trim();
        let args: Vec<&str> = expr[open + 1..expr.len() - 1]
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .collect();

        return match (name, args.as_slice()) {
            ("uuid", []) => Ok(Segment::Uuid),
            ("timestamp", []) => Ok(Segment::Timestamp),
            ("randomInt", [lo, hi]) => {
                let lo = lo
                    .parse::<i64>()
                    .map_err(|_| format!("`{lo}` is not an integer"))?;
                let hi = hi
                    .parse::<i64>()
                    .map_err(|_| format!("`{hi}` is not an integer"))?;
                if lo > hi {
                    return Err(format!("randomInt bounds are reversed ({lo} > {hi})"));
                }
                Ok(Segment::RandomInt(lo, hi))
            }
            _ => Err(format!("unknown function `{expr}`")),
        };
    }

    let valid = expr
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(format!("`{expr}` is not a valid attribute name"));
    }
    Ok(Segment::Attribute(expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn resolves_session_attributes() {
        let template = Template::parse("/greet/${name}?lang=${lang}").unwrap();
        let session = Session::new(1, "s").set("name", "ana").set("lang", "pt");
        assert_eq!(
            template.resolve(&session, &mut rng()).unwrap(),
            "/greet/ana?lang=pt"
        );
        assert_eq!(template.attributes(), vec!["name", "lang"]);
    }

    #[test]
    fn non_string_values_render_as_json() {
        let template = Template::parse("/computers/${id}").unwrap();
        let session = Session::new(1, "s").set("id", 381);
        assert_eq!(
            template.resolve(&session, &mut rng()).unwrap(),
            "/computers/381"
        );
    }

    #[test]
    fn dotted_names_walk_records() {
        let template = Template::parse("${user.name}-${user.tags.1}").unwrap();
        let session = Session::new(1, "s").set("user", json!({"name": "ana", "tags": ["a", "b"]}));
        assert_eq!(template.resolve(&session, &mut rng()).unwrap(), "ana-b");
    }

    #[test]
    fn missing_attribute_is_a_request_error() {
        let template = Template::parse("/greet/${name}").unwrap();
        let err = template
            .resolve(&Session::new(1, "s"), &mut rng())
            .unwrap_err();
        assert_eq!(err.kind(), "RequestError");
    }

    #[test]
    fn random_functions_are_seeded() {
        let template = Template::parse("${uuid()}/${randomInt(1,6)}").unwrap();
        let session = Session::new(1, "s");
        let a = template.resolve(&session, &mut rng()).unwrap();
        let b = template.resolve(&session, &mut rng()).unwrap();
        assert_eq!(a, b);

        let (uuid, roll) = a.split_once('/').unwrap();
        assert!(uuid::Uuid::parse_str(uuid).is_ok());
        let roll: i64 = roll.parse().unwrap();
        assert!((1..=6).contains(&roll));
    }

    #[test]
    fn static_templates() {
        assert!(Template::parse("/slow").unwrap().is_static());
        assert!(!Template::parse("/greet/${name}").unwrap().is_static());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for source in [
            "/greet/${name",
            "/greet/${}",
            "/greet/${na me}",
            "${nope()}",
            "${randomInt(9,1)}",
            "${randomInt(a,1)}",
        ] {
            assert!(Template::parse(source).is_err(), "{source} should be rejected");
        }
    }

    #[test]
    fn lenient_defers_errors_to_validate() {
        let template = Template::lenient("/greet/${name");
        assert!(matches!(
            template.validate(),
            Err(ConfigurationError::Template { .. })
        ));
    }
}
