//! Tool descriptors: a callable plus its input schema, built once at load time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::INJECTED_ARG_PREFIX;

/// Error returned by a tool callable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    /// Arguments did not match the tool's input schema.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The tool observed a cancellation request and stopped.
    #[error("canceled: {0}")]
    Canceled(String),
}

impl ToolError {
    /// Taxonomy name recorded on the failed run.
    pub fn error_type(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "ToolInputError",
            ToolError::Failed(_) => "ToolExecutionError",
            ToolError::Canceled(_) => "ToolCanceledError",
        }
    }
}

/// Anything a tool may return.
pub trait ToolOutput: fmt::Debug + Send {
    fn to_json(&self) -> serde_json::Result<Value>;
}

impl<T: Serialize + fmt::Debug + Send> ToolOutput for T {
    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

type ToolFn = dyn Fn(&Map<String, Value>) -> Result<Box<dyn ToolOutput>, ToolError> + Send + Sync;

/// JSON type accepted by a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Double,
    Bool,
    List,
    Object,
    Any,
}

impl ValueType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Int => value.is_i64() || value.is_u64(),
            ValueType::Double => value.is_number(),
            ValueType::Bool => value.is_boolean(),
            ValueType::List => value.is_array(),
            ValueType::Object => value.is_object(),
            ValueType::Any => true,
        }
    }
}

/// One declared tool input.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub value_type: ValueType,
    /// Used when the argument is absent; `None` makes it required.
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
        }
    }

    pub fn optional(value_type: ValueType, default: Value) -> Self {
        Self {
            value_type,
            default: Some(default),
        }
    }
}

/// A named callable with a declared input schema.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub inputs: BTreeMap<String, ParamSpec>,
    callable: Arc<ToolFn>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    pub fn new<F, T>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<T, ToolError> + Send + Sync + 'static,
        T: ToolOutput + 'static,
    {
        let callable: Arc<ToolFn> =
            Arc::new(move |args| func(args).map(|out| Box::new(out) as Box<dyn ToolOutput>));
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
            callable,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    /// Fill defaults and check the arguments against the schema.
    ///
    /// Undeclared arguments are rejected unless they are framework-injected.
    pub fn resolve_args(&self, mut args: Map<String, Value>) -> Result<Map<String, Value>, ToolError> {
        for (name, spec) in &self.inputs {
            match args.get(name) {
                Some(value) if !spec.value_type.accepts(value) => {
                    return Err(ToolError::InvalidInput(format!(
                        "input '{name}' of tool '{}' expects {:?}, got {value}",
                        self.name, spec.value_type
                    )));
                }
                Some(_) => {}
                None => match &spec.default {
                    Some(default) => {
                        args.insert(name.clone(), default.clone());
                    }
                    None => {
                        return Err(ToolError::InvalidInput(format!(
                            "missing required input '{name}' of tool '{}'",
                            self.name
                        )));
                    }
                },
            }
        }
        if let Some(extra) = args
            .keys()
            .find(|k| !k.starts_with(INJECTED_ARG_PREFIX) && !self.inputs.contains_key(*k))
        {
            return Err(ToolError::InvalidInput(format!(
                "unexpected input '{extra}' for tool '{}'",
                self.name
            )));
        }
        Ok(args)
    }

    pub fn invoke(&self, args: &Map<String, Value>) -> Result<Box<dyn ToolOutput>, ToolError> {
        (self.callable)(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> ToolDescriptor {
        ToolDescriptor::new("add", |args| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(a + b)
        })
        .with_input("a", ParamSpec::required(ValueType::Int))
        .with_input("b", ParamSpec::optional(ValueType::Int, json!(10)))
    }

    #[test]
    fn test_defaults_applied() {
        let tool = add_tool();
        let mut args = Map::new();
        args.insert("a".into(), json!(1));
        let args = tool.resolve_args(args).unwrap();
        assert_eq!(args["b"], json!(10));
        let out = tool.invoke(&args).unwrap();
        assert_eq!(out.to_json().unwrap(), json!(11));
    }

    #[test]
    fn test_schema_violations() {
        let tool = add_tool();
        assert!(matches!(
            tool.resolve_args(Map::new()),
            Err(ToolError::InvalidInput(msg)) if msg.contains("missing required input 'a'")
        ));

        let mut wrong_type = Map::new();
        wrong_type.insert("a".into(), json!("one"));
        assert!(tool.resolve_args(wrong_type).is_err());

        let mut extra = Map::new();
        extra.insert("a".into(), json!(1));
        extra.insert("c".into(), json!(1));
        assert!(tool.resolve_args(extra).is_err());
    }

    #[test]
    fn test_injected_args_pass_through() {
        let tool = add_tool();
        let mut args = Map::new();
        args.insert("a".into(), json!(1));
        args.insert("__line_index".into(), json!(4));
        assert!(tool.resolve_args(args).is_ok());
    }
}
