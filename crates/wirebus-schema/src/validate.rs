//! Argument validation against declared parameters.

use crate::error::SchemaError;
use wirebus_types::{Kwargs, ParamType, Parameter};

/// Check keyword arguments against `parameters`.
///
/// Required parameters must be present, unknown names are rejected and
/// every value must satisfy its declared type. An optional parameter may
/// be passed as `null`.
pub fn validate_kwargs(
    api: &str,
    member: &str,
    parameters: &[Parameter],
    kwargs: &Kwargs,
) -> Result<(), SchemaError> {
    let mismatch = |reason: String| SchemaError::Mismatch {
        api: api.to_string(),
        member: member.to_string(),
        reason,
    };

    for param in parameters {
        match kwargs.get(&param.name) {
            None if param.required => {
                return Err(mismatch(format!("missing required parameter '{}'", param.name)))
            }
            None => {}
            Some(value) if value.is_null() && !param.required => {}
            Some(value) if !param.kind.accepts(value) => {
                return Err(mismatch(format!(
                    "parameter '{}' expects {}, got {}",
                    param.name,
                    param.kind.name(),
                    ParamType::describe(value)
                )))
            }
            Some(_) => {}
        }
    }

    if let Some(extra) = kwargs
        .keys()
        .find(|key| !parameters.iter().any(|p| &p.name == *key))
    {
        return Err(mismatch(format!("unexpected parameter '{extra}'")));
    }
    Ok(())
}

/// Check that a handler takes exactly the declared parameters, in order.
pub fn check_parameter_names(
    api: &str,
    member: &str,
    parameters: &[Parameter],
    actual: &[&str],
) -> Result<(), SchemaError> {
    let expected: Vec<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
    if expected == actual {
        return Ok(());
    }
    Err(SchemaError::HandlerMismatch {
        api: api.to_string(),
        member: member.to_string(),
        expected: expected.into_iter().map(String::from).collect(),
        actual: actual.iter().map(|s| s.to_string()).collect(),
    })
}
