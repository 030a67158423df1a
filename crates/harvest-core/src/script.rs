//! Bridge between extraction scripts and the tab's `Runtime.evaluate`.
//!
//! Rule authors are trusted: their scripts and the values published back into
//! the page are evaluated as-is in the page context. Nothing here escapes or
//! filters script text; string values are only quoted so they form valid
//! literals.

use std::borrow::Cow;

use serde_json::{Value, json};

use crate::rule::Prepare;
use crate::traits::Tab;

/// Prefix of the page constants that hold earlier field results.
pub const FIELD_PREFIX: &str = "field_";

/// Block-local binding holding a field's static value while its `eval` runs.
pub const FIELD_VALUE: &str = "field_value";

/// Page variable holding the current 1-based loop iteration.
pub const LOOP_COUNTER: &str = "loop_count";

/// Wrap a script in `{…}` unless it already is a block.
pub fn block(script: &str) -> Cow<'_, str> {
    if script.trim_start().starts_with('{') {
        Cow::Borrowed(script)
    } else {
        Cow::Owned(format!("{{{script}}}"))
    }
}

/// Quote a string as a script literal.
pub fn literal(value: &str) -> String {
    Value::String(value.to_owned()).to_string()
}

/// Extract the leaf value from a `Runtime.evaluate` response.
///
/// Strings come back verbatim and `true` becomes `"true"`; every other shape
/// is an empty string.
pub fn leaf_value(response: &Value) -> String {
    match response.get("result").and_then(|r| r.get("value")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

/// Expression for a field's script, binding its static value when present.
pub fn field_expression(eval: &str, value: &str) -> String {
    if value.is_empty() {
        block(eval).into_owned()
    } else {
        format!("{{let {FIELD_VALUE}={};{eval}}}", literal(value))
    }
}

/// Evaluates scripts in a single tab.
pub struct ScriptBridge<'a, T: Tab> {
    tab: &'a T,
}

impl<'a, T: Tab> ScriptBridge<'a, T> {
    pub fn new(tab: &'a T) -> Self {
        Self { tab }
    }

    /// Normalize a script into block form and evaluate it.
    pub async fn eval(&self, script: &str) -> String {
        self.eval_raw(&block(script)).await
    }

    /// Evaluate an expression exactly as given and wait for its result.
    ///
    /// Transport failures and malformed responses degrade to `""`.
    pub async fn eval_raw(&self, expression: &str) -> String {
        let params = json!({
            "expression": expression,
            "objectGroup": "console",
            "includeCommandLineAPI": true,
        });
        let pending = match self.tab.call("Runtime.evaluate", params).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(tab = %self.tab.id(), error = %e, "Runtime.evaluate not sent");
                return String::new();
            }
        };
        match pending.response().await {
            Ok(response) => leaf_value(&response),
            Err(e) => {
                tracing::warn!(tab = %self.tab.id(), error = %e, "Runtime.evaluate failed");
                String::new()
            }
        }
    }

    /// Publish a field result as the page constant `field_<name>`.
    pub async fn publish_field(&self, name: &str, value: &str) {
        let expression = format!("const {FIELD_PREFIX}{name}={};", literal(value));
        self.eval_raw(&expression).await;
    }

    /// Publish the loop iteration counter.
    pub async fn publish_counter(&self, iteration: usize) {
        let expression = if iteration == 1 {
            format!("let {LOOP_COUNTER}=1;")
        } else {
            format!("{LOOP_COUNTER}={iteration};")
        };
        self.eval_raw(&expression).await;
    }

    /// Run a prepare gate. Returns false when its script did not yield
    /// `"true"`; otherwise applies the gate's wait and returns true.
    pub async fn prepare(&self, prepare: &Prepare) -> bool {
        if !prepare.eval.is_empty() {
            let result = self.eval(&prepare.eval).await;
            if result != "true" {
                tracing::debug!(tab = %self.tab.id(), %result, "Prepare gate closed");
                return false;
            }
        }
        if !prepare.wait.is_zero() {
            tokio::time::sleep(prepare.wait).await;
        }
        true
    }
}
