//! Implementation of the expression bridge.
//!
//! Runtime expressions are strings of the form `${ … }` holding a jq
//! program, or structural values containing such strings. Evaluation is
//! delegated to jaq through this module; no other module touches the
//! evaluator directly.
//!
//! Evaluation is pure: the instance context, the workflow descriptor, and
//! the task descriptor are pre-bound by the runner as the `$context`,
//! `$workflow`, and `$task` variables, and any time-dependent value must be
//! read from them rather than observed directly.

use jaq_core::Compiler;
use jaq_core::Ctx;
use jaq_core::RcIter;
use jaq_core::load::Arena;
use jaq_core::load::File;
use jaq_core::load::Loader;
use jaq_json::Val;
use serde_json::Value;
use thand_model::Schema;

use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::expression;
use crate::error::validation;

/// Represents the variables bound for an expression evaluation.
#[derive(Debug, Clone, Default)]
pub struct ExpressionBindings {
    /// The instance context, bound as `$context`.
    pub context: Value,
    /// The workflow descriptor, bound as `$workflow`.
    pub workflow: Value,
    /// The per-task descriptor, bound as `$task`.
    pub task: Value,
    /// Additional bindings, e.g. the loop variables of a `for` task.
    ///
    /// Names are given without the `$` sigil.
    pub extras: Vec<(String, Value)>,
}

impl ExpressionBindings {
    /// Adds an extra binding.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extras.push((name.into(), value));
        self
    }
}

/// Returns the inner program of a `${ … }` expression string, if the string
/// is one.
pub fn as_expression(s: &str) -> Option<&str> {
    let s = s.trim();
    s.strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim)
}

/// Evaluates a runtime expression value against the given input.
///
/// Strings of the form `${ … }` are evaluated; arrays and maps are traversed
/// structurally; all other values are returned verbatim.
pub fn evaluate_value(
    expr: &Value,
    input: &Value,
    bindings: &ExpressionBindings,
    reference: &TaskPath,
) -> WorkflowResult<Value> {
    match expr {
        Value::String(s) => match as_expression(s) {
            Some(program) => evaluate_expression(program, input, bindings, reference),
            None => Ok(expr.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_value(item, input, bindings, reference))
            .collect::<WorkflowResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut evaluated = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                evaluated.insert(key.clone(), evaluate_value(value, input, bindings, reference)?);
            }
            Ok(Value::Object(evaluated))
        }
        _ => Ok(expr.clone()),
    }
}

/// Applies an `as`-style transform: either a literal structure with embedded
/// expressions, or a single expression yielding the whole value.
pub fn evaluate_struct(
    as_spec: &Value,
    input: &Value,
    bindings: &ExpressionBindings,
    reference: &TaskPath,
) -> WorkflowResult<Value> {
    evaluate_value(as_spec, input, bindings, reference)
}

/// Evaluates a predicate expression, coercing the result to a boolean.
///
/// A non-boolean result is an error.
pub fn evaluate_bool(
    expr: &str,
    input: &Value,
    bindings: &ExpressionBindings,
    reference: &TaskPath,
) -> WorkflowResult<bool> {
    let program = as_expression(expr).unwrap_or(expr);
    match evaluate_expression(program, input, bindings, reference)? {
        Value::Bool(b) => Ok(b),
        other => Err(expression(
            format!(
                "predicate `{expr}` evaluated to a non-boolean value `{other}`",
            ),
            reference,
        )),
    }
}

/// Evaluates a jq program against the given input.
///
/// The first output of the program is returned; a program with no output
/// yields null.
pub fn evaluate_expression(
    program: &str,
    input: &Value,
    bindings: &ExpressionBindings,
    reference: &TaskPath,
) -> WorkflowResult<Value> {
    run_program(program, input, bindings).map_err(|message| expression(message, reference))
}

/// Compiles and runs a jq program, returning its first output.
fn run_program(
    program: &str,
    input: &Value,
    bindings: &ExpressionBindings,
) -> Result<Value, String> {
    let file = File {
        path: (),
        code: program,
    };

    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, file)
        .map_err(|errors| format!("failed to parse expression `{program}`: {errors:?}"))?;

    let mut names = vec![
        "$context".to_string(),
        "$workflow".to_string(),
        "$task".to_string(),
        "$input".to_string(),
    ];
    let mut values = vec![
        Val::from(bindings.context.clone()),
        Val::from(bindings.workflow.clone()),
        Val::from(bindings.task.clone()),
        Val::from(input.clone()),
    ];
    for (name, value) in &bindings.extras {
        names.push(format!("${name}"));
        values.push(Val::from(value.clone()));
    }

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(names.iter().map(String::as_str))
        .compile(modules)
        .map_err(|errors| format!("failed to compile expression `{program}`: {errors:?}"))?;

    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = filter.run((Ctx::new(values, &inputs), Val::from(input.clone())));

    match outputs.next() {
        None => Ok(Value::Null),
        Some(Ok(output)) => Ok(Value::from(output)),
        Some(Err(e)) => Err(format!("expression `{program}` failed: {e:?}")),
    }
}

/// Validates a value against a schema definition.
///
/// A `None` schema is a no-op. Only JSON schema documents are supported.
pub fn validate_schema(
    value: &Value,
    schema: Option<&Schema>,
    reference: &TaskPath,
) -> WorkflowResult<()> {
    let Some(schema) = schema else {
        return Ok(());
    };

    if let Some(format) = &schema.format {
        if format != "json" {
            return Err(validation(
                format!("unsupported schema format `{format}`"),
                reference,
            ));
        }
    }

    let validator = jsonschema::validator_for(&schema.document)
        .map_err(|e| validation(format!("invalid schema document: {e}"), reference))?;

    validator
        .validate(value)
        .map_err(|e| validation(format!("schema validation failed: {e}"), reference))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// Evaluates an expression with empty bindings.
    fn eval(expr: &Value, input: &Value) -> WorkflowResult<Value> {
        evaluate_value(expr, input, &ExpressionBindings::default(), &TaskPath::root())
    }

    #[test]
    fn literals_pass_through() {
        let input = json!({});
        assert_eq!(eval(&json!(42), &input).expect("should evaluate"), json!(42));
        assert_eq!(
            eval(&json!("plain string"), &input).expect("should evaluate"),
            json!("plain string")
        );
    }

    #[test]
    fn identity_returns_input_unchanged() {
        let input = json!({ "x": 20, "nested": { "y": [1, 2, 3] } });
        assert_eq!(
            eval(&json!("${ . }"), &input).expect("should evaluate"),
            input
        );
    }

    #[test]
    fn arithmetic_over_input() {
        let input = json!({ "x": 20 });
        assert_eq!(
            eval(&json!("${ .x * 3 }"), &input).expect("should evaluate"),
            json!(60)
        );
    }

    #[test]
    fn structural_evaluation() {
        let input = json!({ "color": "red", "count": 2 });
        assert_eq!(
            eval(
                &json!({ "chosen": "${ .color }", "doubled": "${ .count * 2 }", "literal": true }),
                &input
            )
            .expect("should evaluate"),
            json!({ "chosen": "red", "doubled": 4, "literal": true })
        );
    }

    #[test]
    fn context_binding() {
        let bindings = ExpressionBindings {
            context: json!({ "approved": true }),
            ..Default::default()
        };
        let result = evaluate_value(
            &json!("${ $context.approved }"),
            &json!({}),
            &bindings,
            &TaskPath::root(),
        )
        .expect("should evaluate");
        assert_eq!(result, json!(true));
    }

    #[test]
    fn extra_bindings() {
        let bindings = ExpressionBindings::default()
            .with("item", json!("red"))
            .with("index", json!(1));
        let result = evaluate_value(
            &json!({ "color": "${ $item }", "at": "${ $index }" }),
            &json!({}),
            &bindings,
            &TaskPath::root(),
        )
        .expect("should evaluate");
        assert_eq!(result, json!({ "color": "red", "at": 1 }));
    }

    #[test]
    fn non_boolean_predicate_is_an_error() {
        let e = evaluate_bool(
            "${ .x }",
            &json!({ "x": 42 }),
            &ExpressionBindings::default(),
            &TaskPath::root(),
        )
        .expect_err("should fail");
        assert!(e.to_string().contains("non-boolean"));
    }

    #[test]
    fn schema_validation() {
        let schema = Schema {
            format: Some("json".to_string()),
            document: json!({
                "type": "object",
                "required": ["user"],
                "properties": { "user": { "type": "string" } }
            }),
        };

        validate_schema(&json!({ "user": "alice" }), Some(&schema), &TaskPath::root())
            .expect("valid value should pass");

        let e = validate_schema(&json!({}), Some(&schema), &TaskPath::root())
            .expect_err("missing field should fail");
        assert!(matches!(e, crate::WorkflowError::Validation { .. }));

        validate_schema(&json!({}), None, &TaskPath::root()).expect("no schema is a no-op");
    }
}
