//! Resolution of symbolic ids (`urn:uuid:…`, `urn:oid:…`) to the concrete `Type/id`
//! references assigned while a bundle executes.

use crate::exception::{VitalError, VitalResult};
use serde_json::Value;
use std::collections::HashMap;

const SYMBOLIC_PREFIXES: [&str; 2] = ["urn:uuid:", "urn:oid:"];

/// Whether `value` is a caller-chosen placeholder identity
pub fn is_symbolic(value: &str) -> bool {
    SYMBOLIC_PREFIXES.iter().any(|p| value.starts_with(p))
}

/// Bindings from symbolic ids to concrete references, filled in declaration order
#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    bindings: HashMap<String, String>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `symbolic_id` now names `reference`. A symbolic id binds once.
    pub fn bind<S: Into<String>, R: Into<String>>(
        &mut self,
        symbolic_id: S,
        reference: R,
    ) -> VitalResult<()> {
        let symbolic_id = symbolic_id.into();
        if self.bindings.contains_key(&symbolic_id) {
            return Err(VitalError::validation(format!(
                "symbolic id '{symbolic_id}' is defined more than once"
            )));
        }
        self.bindings.insert(symbolic_id, reference.into());
        Ok(())
    }

    pub fn resolve(&self, symbolic_id: &str) -> Option<&str> {
        self.bindings.get(symbolic_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn require(&self, symbolic_id: &str) -> VitalResult<&str> {
        self.resolve(symbolic_id).ok_or_else(|| {
            VitalError::validation(format!("unresolved symbolic reference '{symbolic_id}'"))
        })
    }

    /// Rewrite a target: a bare symbolic id, or symbolic values inside `Type?criteria`.
    pub fn resolve_target(&self, target: &str) -> VitalResult<String> {
        if is_symbolic(target) {
            return self.require(target).map(str::to_string);
        }

        let Some((base, query)) = target.split_once('?') else {
            return Ok(target.to_string());
        };

        let mut params = Vec::new();
        for segment in query.split('&') {
            match segment.split_once('=') {
                Some((name, value)) if is_symbolic(value) => {
                    params.push(format!("{name}={}", self.require(value)?));
                }
                _ => params.push(segment.to_string()),
            }
        }
        Ok(format!("{base}?{}", params.join("&")))
    }

    /// Rewrite every symbolic `reference` field of a payload in place.
    pub fn resolve_payload(&self, payload: &mut Value) -> VitalResult<()> {
        match payload {
            Value::Object(object) => {
                for (key, value) in object.iter_mut() {
                    if key == "reference" {
                        if let Value::String(s) = value {
                            if is_symbolic(s) {
                                let resolved = self.require(s)?.to_string();
                                *s = resolved;
                            }
                            continue;
                        }
                    }
                    self.resolve_payload(value)?;
                }
                Ok(())
            }
            Value::Array(items) => items.iter_mut().try_for_each(|v| self.resolve_payload(v)),
            _ => Ok(()),
        }
    }
}
