//! [`ScriptEngine`] backed by the Boa JavaScript engine.
//!
//! One Boa [`Context`] is created per call and reused for every row of that call. The script is
//! evaluated inside a block so top-level `let`/`const` declarations do not leak from one row into
//! the next; the block's completion value is the result.

use boa_engine::object::builtins::JsArray;
use boa_engine::{Context, JsString, JsValue, Source, js_string};

use super::{ScriptEngine, ScriptSession, ScriptValue};
use crate::error::{Error, ErrorKind, Result};

/// Default maximum number of loop iterations per evaluation.
const DEFAULT_LOOP_ITERATION_LIMIT: u64 = 100_000_000;

/// Default maximum call depth per evaluation.
const DEFAULT_RECURSION_LIMIT: usize = 512;

/// JavaScript engine configuration. Runaway scripts fail with an evaluation error once they hit
/// one of the limits.
#[derive(Debug, Clone)]
pub struct BoaEngine {
    loop_iteration_limit: u64,
    recursion_limit: usize,
}

impl Default for BoaEngine {
    fn default() -> Self {
        Self {
            loop_iteration_limit: DEFAULT_LOOP_ITERATION_LIMIT,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

impl BoaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of loop iterations a single evaluation may run.
    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    /// Get the maximum number of loop iterations a single evaluation may run.
    pub fn loop_iteration_limit(&self) -> u64 {
        self.loop_iteration_limit
    }

    /// Set the maximum call depth of a single evaluation.
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Get the maximum call depth of a single evaluation.
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }
}

impl ScriptEngine for BoaEngine {
    fn session(&self) -> Result<Box<dyn ScriptSession>> {
        let mut context = Context::default();
        let limits = context.runtime_limits_mut();
        limits.set_loop_iteration_limit(self.loop_iteration_limit);
        limits.set_recursion_limit(self.recursion_limit);
        Ok(Box::new(BoaSession { context }))
    }
}

struct BoaSession {
    context: Context,
}

fn eval_error(e: impl std::fmt::Display) -> Error {
    Error::ScriptError(ErrorKind::EvalError(e.to_string()))
}

fn to_js(value: &ScriptValue, context: &mut Context) -> JsValue {
    match value {
        ScriptValue::Number(num) => JsValue::from(*num),
        ScriptValue::Text(text) => JsValue::from(JsString::from(text.as_str())),
        ScriptValue::Dual(num, text) => {
            let pair = [JsValue::from(*num), JsValue::from(JsString::from(text.as_str()))];
            JsArray::from_iter(pair, context).into()
        }
        ScriptValue::List(values) => {
            let items: Vec<JsValue> = values.iter().map(|v| to_js(v, context)).collect();
            JsArray::from_iter(items, context).into()
        }
    }
}

impl ScriptSession for BoaSession {
    fn evaluate(&mut self, script: &str, args: &[ScriptValue]) -> Result<String> {
        let values: Vec<JsValue> = args.iter().map(|v| to_js(v, &mut self.context)).collect();
        let args = JsArray::from_iter(values, &mut self.context);
        self.context
            .global_object()
            .set(js_string!("args"), args, false, &mut self.context)
            .map_err(eval_error)?;

        let block = format!("{{\n{script}\n}}");
        let value = self
            .context
            .eval(Source::from_bytes(block.as_str()))
            .map_err(eval_error)?;
        let text = value.to_string(&mut self.context).map_err(eval_error)?;
        Ok(text.to_std_string_escaped())
    }
}
