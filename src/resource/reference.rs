//! Reference expressions inside property values.
//!
//! A string property may contain `${...}` expressions. Two families exist:
//!
//! - variables (`${var.NAME}`, `${project}`, `${stack}`) substituted when the
//!   configuration is parsed;
//! - resource references (`${Name.Attribute[.path]}`) resolved against the
//!   outputs of already-applied resources just before a provider call.
//!
//! When a string consists of exactly one expression the substituted value
//! keeps its JSON type. Otherwise values are interpolated as text. `$${`
//! produces a literal `${`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Attribute naming the provider-assigned physical identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// Errors raised while parsing or rendering a template string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// `${` without a closing `}`.
    #[error("unterminated expression in '{template}'")]
    Unterminated {
        /// The offending template.
        template: String,
    },

    /// An expression is empty or badly formed.
    #[error("invalid expression '${{{expression}}}': {message}")]
    Invalid {
        /// The expression text.
        expression: String,
        /// What is wrong with it.
        message: String,
    },

    /// A `${var.NAME}` names an undefined variable.
    #[error("unknown variable '{name}'")]
    UnknownVariable {
        /// The variable name.
        name: String,
    },

    /// A resource reference has no value yet.
    #[error("'{reference}' has no value")]
    Unresolved {
        /// The reference that failed.
        reference: Reference,
    },
}

/// A reference from one resource to an attribute of another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the referenced resource.
    pub resource: String,
    /// Attribute name, `id` for the physical identifier.
    pub attribute: String,
    /// Optional path into the attribute value (object keys or array indices).
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Escape,
    Expr(String),
}

impl Reference {
    /// Parses the inside of a `${...}` expression.
    ///
    /// `${Name}` is shorthand for `${Name.id}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource name or any path component is empty.
    pub fn parse(expression: &str) -> Result<Self, TemplateError> {
        let mut parts = expression.trim().split('.');
        let resource = parts.next().unwrap_or_default().to_string();
        if resource.is_empty() {
            return Err(TemplateError::Invalid {
                expression: expression.to_string(),
                message: String::from("missing resource name"),
            });
        }

        let attribute = parts.next().map_or_else(|| ID_ATTRIBUTE.to_string(), str::to_string);
        let path: Vec<String> = parts.map(str::to_string).collect();

        if attribute.is_empty() || path.iter().any(String::is_empty) {
            return Err(TemplateError::Invalid {
                expression: expression.to_string(),
                message: String::from("empty attribute or path component"),
            });
        }

        Ok(Self {
            resource,
            attribute,
            path,
        })
    }

    /// Returns true if the reference targets the physical identifier.
    #[must_use]
    pub fn is_id(&self) -> bool {
        self.attribute == ID_ATTRIBUTE && self.path.is_empty()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}", self.resource, self.attribute)?;
        for part in &self.path {
            write!(f, ".{part}")?;
        }
        write!(f, "}}")
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        literal.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("$${") {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Escape);
            rest = &tail[3..];
        } else if let Some(body) = tail.strip_prefix("${") {
            let Some(end) = body.find('}') else {
                return Err(TemplateError::Unterminated {
                    template: template.to_string(),
                });
            };
            let expression = body[..end].trim();
            if expression.is_empty() {
                return Err(TemplateError::Invalid {
                    expression: String::new(),
                    message: String::from("empty expression"),
                });
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Expr(expression.to_string()));
            rest = &body[end + 1..];
        } else {
            literal.push('$');
            rest = &tail[1..];
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Renders a value as text for interpolation into a larger string.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders one template string.
///
/// `f` returns `Ok(None)` to leave an expression untouched.
fn render_string<F>(template: &str, keep_escapes: bool, f: &mut F) -> Result<Value, TemplateError>
where
    F: FnMut(&str) -> Result<Option<Value>, TemplateError>,
{
    let segments = parse_template(template)?;

    if let [Segment::Expr(expression)] = segments.as_slice() {
        return Ok(f(expression)?.unwrap_or_else(|| Value::String(template.to_string())));
    }

    let mut out = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Escape => out.push_str(if keep_escapes { "$${" } else { "${" }),
            Segment::Expr(expression) => match f(&expression)? {
                Some(value) => out.push_str(&value_to_text(&value)),
                None => {
                    out.push_str("${");
                    out.push_str(&expression);
                    out.push('}');
                }
            },
        }
    }
    Ok(Value::String(out))
}

fn map_strings<F>(value: &Value, f: &mut F) -> Result<Value, TemplateError>
where
    F: FnMut(&str) -> Result<Value, TemplateError>,
{
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items
            .iter()
            .map(|item| map_strings(item, f))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), map_strings(item, f)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn is_variable_expression(expression: &str) -> bool {
    expression.starts_with("var.") || expression == "project" || expression == "stack"
}

/// Substitutes variable expressions in a value.
///
/// `scope` maps `var.NAME`, `project` and `stack` to their values. Resource
/// references and escapes are left in place for the apply-time resolution.
///
/// # Errors
///
/// Returns an error for malformed templates and unknown variables.
pub fn substitute_variables(
    value: &Value,
    scope: &BTreeMap<String, Value>,
) -> Result<Value, TemplateError> {
    map_strings(value, &mut |s: &str| {
        render_string(s, true, &mut |expression: &str| {
            if !is_variable_expression(expression) {
                return Ok(None);
            }
            scope
                .get(expression)
                .cloned()
                .map(Some)
                .ok_or_else(|| TemplateError::UnknownVariable {
                    name: expression.trim_start_matches("var.").to_string(),
                })
        })
    })
}

/// Collects every resource reference in a value, in document order.
///
/// # Errors
///
/// Returns an error for malformed templates.
pub fn references_in(value: &Value) -> Result<Vec<Reference>, TemplateError> {
    let mut found = Vec::new();
    map_strings(value, &mut |s: &str| {
        render_string(s, true, &mut |expression: &str| {
            found.push(Reference::parse(expression)?);
            Ok(None)
        })
    })?;
    Ok(found)
}

/// Resolves every resource reference in a value.
///
/// # Errors
///
/// Returns [`TemplateError::Unresolved`] for the first reference `lookup`
/// cannot satisfy.
pub fn resolve<F>(value: &Value, lookup: F) -> Result<Value, TemplateError>
where
    F: Fn(&Reference) -> Option<Value>,
{
    map_strings(value, &mut |s: &str| {
        render_string(s, false, &mut |expression: &str| {
            let reference = Reference::parse(expression)?;
            lookup(&reference)
                .map(Some)
                .ok_or(TemplateError::Unresolved { reference })
        })
    })
}

/// Follows a dotted path into a JSON value.
///
/// Object keys are matched by name and array elements by numeric index.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        let r = Reference::parse("WebLb.DNSName").unwrap();
        assert_eq!(r.resource, "WebLb");
        assert_eq!(r.attribute, "DNSName");
        assert!(r.path.is_empty());

        let r = Reference::parse("Vpc").unwrap();
        assert!(r.is_id());

        let r = Reference::parse("Lb.SecurityGroups.0").unwrap();
        assert_eq!(r.path, vec!["0"]);
        assert_eq!(r.to_string(), "${Lb.SecurityGroups.0}");

        assert!(Reference::parse("Vpc..x").is_err());
    }

    #[test]
    fn test_references_in_nested_value() {
        let value = json!({
            "VpcId": "${Vpc.id}",
            "Tags": [{"Key": "Name", "Value": "web-${Subnet.AvailabilityZone}"}],
            "Note": "costs $$5, literal $${NotARef}"
        });
        let refs = references_in(&value).unwrap();
        let names: Vec<&str> = refs.iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Vpc"));
        assert!(names.contains(&"Subnet"));
    }

    #[test]
    fn test_unterminated_expression() {
        let err = references_in(&json!("${Vpc.id")).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated { .. }));
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let value = json!({"Port": "${Tg.Port}", "Url": "http://${Lb.DNSName}:${Tg.Port}/"});
        let resolved = resolve(&value, |r| match r.attribute.as_str() {
            "Port" => Some(json!(8080)),
            "DNSName" => Some(json!("lb.example.com")),
            _ => None,
        })
        .unwrap();
        assert_eq!(resolved["Port"], json!(8080));
        assert_eq!(resolved["Url"], json!("http://lb.example.com:8080/"));
    }

    #[test]
    fn test_resolve_reports_missing_reference() {
        let err = resolve(&json!("${Missing.Arn}"), |_| None).unwrap_err();
        match err {
            TemplateError::Unresolved { reference } => assert_eq!(reference.resource, "Missing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_substitute_variables_keeps_references_and_escapes() {
        let mut scope = BTreeMap::new();
        scope.insert(String::from("var.ami"), json!("ami-123"));
        scope.insert(String::from("stack"), json!("dev"));

        let value = json!({
            "ImageId": "${var.ami}",
            "Name": "web-${stack}",
            "SubnetId": "${Subnet.id}",
            "Script": "echo $${HOME}"
        });
        let out = substitute_variables(&value, &scope).unwrap();
        assert_eq!(out["ImageId"], json!("ami-123"));
        assert_eq!(out["Name"], json!("web-dev"));
        assert_eq!(out["SubnetId"], json!("${Subnet.id}"));
        assert_eq!(out["Script"], json!("echo $${HOME}"));

        let resolved = resolve(&out["Script"], |_| None).unwrap();
        assert_eq!(resolved, json!("echo ${HOME}"));
    }

    #[test]
    fn test_unknown_variable() {
        let err = substitute_variables(&json!("${var.nope}"), &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownVariable {
                name: String::from("nope")
            }
        );
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({"a": [{"b": 1}, {"b": 2}]});
        let path = vec![String::from("a"), String::from("1"), String::from("b")];
        assert_eq!(lookup_path(&value, &path), Some(&json!(2)));
        assert_eq!(lookup_path(&value, &[String::from("x")]), None);
    }
}
