//! Restricted math expression evaluation.

use async_trait::async_trait;

use formflow_exec::eval_restricted;

use crate::bridge::ToolsBridge;
use crate::{Tool, ToolArgs, ToolParam, ToolResult, ToolSpec, arg_str};

pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculate".to_string(),
            description: "Evaluate a math expression over a whitelisted function table."
                .to_string(),
            params: vec![ToolParam::required("expression", "Expression to evaluate")],
        }
    }

    async fn call(&self, _bridge: &ToolsBridge, args: &ToolArgs) -> ToolResult {
        let Some(expression) = arg_str(args, "expression").filter(|e| !e.trim().is_empty()) else {
            return ToolResult::fail("calculate missing required arg: expression");
        };
        match eval_restricted(expression) {
            Ok(output) => ToolResult::ok(output),
            Err(err) => {
                ToolResult::fail(format!("Calculate error for expression '{expression}': {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args_with(expression: &str) -> ToolArgs {
        let mut args = ToolArgs::new();
        args.insert("expression".to_string(), json!(expression));
        args
    }

    #[tokio::test]
    async fn evaluates_simple_arithmetic() {
        let bridge = ToolsBridge::default();
        let result = CalculateTool.call(&bridge, &args_with("2+2")).await;
        assert!(result.success);
        assert_eq!(result.output, "4");
    }

    #[tokio::test]
    async fn whitelisted_math_functions_available() {
        let bridge = ToolsBridge::default();
        let result = CalculateTool.call(&bridge, &args_with("sqrt(144) + abs(-3)")).await;
        assert!(result.success);
        assert_eq!(result.output, "15");
    }

    #[tokio::test]
    async fn bad_expression_reports_itself() {
        let bridge = ToolsBridge::default();
        let result = CalculateTool.call(&bridge, &args_with("frobnicate(1)")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Calculate error for expression 'frobnicate(1)'"));
    }
}
