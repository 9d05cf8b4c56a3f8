//! Capability registry: the only functions submitted code may call.
//!
//! Every capability is a read over the context store snapshot taken at
//! call time. None of them mutate the store, touch the filesystem or the
//! network, or hand back anything callable.

pub mod builtin;
pub mod registry;

use serde::Serialize;

use crate::analysis::Analyzer;
use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::governor::Governor;
use crate::sandbox::value::Value;

pub use registry::CapabilityRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityGroup {
    Navigation,
    Aggregation,
    Analysis,
    Utility,
    /// Conversions and collection helpers (`len`, `sorted`, `range`, …)
    Core,
}

/// One declared parameter of a capability.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub required: bool,
}

impl Param {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// Everything a capability may read while it runs.
pub struct CallContext<'a> {
    pub store: &'a ContextStore,
    pub governor: &'a mut Governor,
    pub analyzer: &'a dyn Analyzer,
    pub limits: &'a EngineConfig,
    /// Recursion depth of the current call (0 at top level)
    pub depth: u32,
}

/// Arguments bound against a capability's declared parameters.
#[derive(Debug)]
pub struct Args {
    function: String,
    params: Vec<&'static str>,
    values: Vec<Option<Value>>,
}

impl Args {
    /// Binds positional and keyword arguments to `params`.
    /// Arity and unknown-keyword mismatches are runtime errors.
    pub fn bind(
        function: &str,
        params: &[Param],
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> SandboxResult<Self> {
        if positional.len() > params.len() {
            return Err(SandboxError::runtime(format!(
                "{function}() takes at most {} argument(s) ({} given)",
                params.len(),
                positional.len()
            )));
        }

        let mut values: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
        values.resize(params.len(), None);

        for (name, value) in keywords {
            let idx = params
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| {
                    SandboxError::runtime(format!(
                        "{function}() got an unexpected keyword argument '{name}'"
                    ))
                })?;
            if values[idx].is_some() {
                return Err(SandboxError::runtime(format!(
                    "{function}() got multiple values for argument '{name}'"
                )));
            }
            values[idx] = Some(value);
        }

        for (param, value) in params.iter().zip(&values) {
            if param.required && value.is_none() {
                return Err(SandboxError::runtime(format!(
                    "{function}() missing required argument: '{}'",
                    param.name
                )));
            }
        }

        Ok(Self {
            function: function.to_string(),
            params: params.iter().map(|p| p.name).collect(),
            values,
        })
    }

    /// The argument at `idx`, treating an explicit `None` as absent.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        match self.values.get(idx) {
            Some(Some(Value::None)) | Some(None) | None => None,
            Some(Some(v)) => Some(v),
        }
    }

    pub fn value(&self, idx: usize) -> SandboxResult<&Value> {
        self.get(idx)
            .ok_or_else(|| self.type_error(idx, "a value", &Value::None))
    }

    pub fn str(&self, idx: usize) -> SandboxResult<&str> {
        let v = self.value(idx)?;
        v.as_str().ok_or_else(|| self.type_error(idx, "str", v))
    }

    pub fn opt_str(&self, idx: usize) -> SandboxResult<Option<&str>> {
        match self.get(idx) {
            None => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| self.type_error(idx, "str", v)),
        }
    }

    pub fn int(&self, idx: usize) -> SandboxResult<i64> {
        let v = self.value(idx)?;
        v.as_int().ok_or_else(|| self.type_error(idx, "int", v))
    }

    pub fn int_or(&self, idx: usize, default: i64) -> SandboxResult<i64> {
        match self.get(idx) {
            None => Ok(default),
            Some(v) => v.as_int().ok_or_else(|| self.type_error(idx, "int", v)),
        }
    }

    pub fn bool_or(&self, idx: usize, default: bool) -> SandboxResult<bool> {
        Ok(self.get(idx).map_or(default, Value::truthy))
    }

    pub fn list(&self, idx: usize) -> SandboxResult<&[Value]> {
        match self.value(idx)? {
            Value::List(items) => Ok(items),
            other => Err(self.type_error(idx, "list", other)),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn type_error(&self, idx: usize, expected: &str, found: &Value) -> SandboxError {
        let param = self.params.get(idx).copied().unwrap_or("?");
        SandboxError::runtime(format!(
            "{}() argument '{param}' must be {expected}, not {}",
            self.function,
            found.type_name()
        ))
    }
}

/// A function callable from submitted code.
///
/// Builtins implement this through [`builtin::Builtin`]; hosts may add
/// their own before the registry is frozen.
pub trait Capability: Send + Sync {
    /// Identifier used in submitted code, e.g. `find_messages`.
    fn name(&self) -> &str;

    /// One-line description, surfaced to whoever writes the code.
    fn description(&self) -> &str;

    fn group(&self) -> CapabilityGroup;

    fn params(&self) -> &[Param];

    /// Analysis capabilities open a new recursion level before their
    /// arguments are evaluated, so nested analysis calls are counted.
    fn opens_analysis_frame(&self) -> bool {
        false
    }

    /// Execute with bound arguments.
    fn call(&self, args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value>;

    /// `name(a, b=…)` rendering of the declared parameters.
    fn signature(&self) -> String {
        let params: Vec<String> = self
            .params()
            .iter()
            .map(|p| {
                if p.required {
                    p.name.to_string()
                } else {
                    format!("{}=…", p.name)
                }
            })
            .collect();
        format!("{}({})", self.name(), params.join(", "))
    }
}
