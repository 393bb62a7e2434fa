//! In-process restricted evaluation for the `Low` isolation level and the
//! `calculate` tool.
//!
//! Snippets run against a curated context: arithmetic, comparison, the
//! public math-function table, numeric conversions, and the constants
//! `pi` / `e` / `tau`.  No I/O, no process access, no imports.  Anything
//! outside expression evaluation fails.

use evalexpr::{
    ContextWithMutableFunctions, ContextWithMutableVariables, DefaultNumericTypes, Function,
    HashMapContext, Value, eval_with_context_mut,
};

type MathContext = HashMapContext<DefaultNumericTypes>;
type MathValue = Value<DefaultNumericTypes>;

fn unary(name: &str, f: fn(f64) -> f64, context: &mut MathContext) {
    context
        .set_function(
            name.to_string(),
            Function::new(move |argument| {
                let number = argument.as_number()?;
                Ok(MathValue::Float(f(number)))
            }),
        )
        .expect("function registration cannot fail on a fresh context");
}

fn binary(name: &str, f: fn(f64, f64) -> f64, context: &mut MathContext) {
    context
        .set_function(
            name.to_string(),
            Function::new(move |argument| {
                let pair = argument.as_fixed_len_tuple(2)?;
                let a = pair[0].as_number()?;
                let b = pair[1].as_number()?;
                Ok(MathValue::Float(f(a, b)))
            }),
        )
        .expect("function registration cannot fail on a fresh context");
}

fn constant(name: &str, value: f64, context: &mut MathContext) {
    context
        .set_value(name.to_string(), MathValue::Float(value))
        .expect("constant registration cannot fail on a fresh context");
}

/// Build the whitelisted evaluation context: the public math table plus the
/// numeric conversions the interpreter conventions rely on.
fn math_context() -> MathContext {
    let mut context = MathContext::new();

    unary("sqrt", f64::sqrt, &mut context);
    unary("cbrt", f64::cbrt, &mut context);
    unary("exp", f64::exp, &mut context);
    unary("log", f64::ln, &mut context);
    unary("log2", f64::log2, &mut context);
    unary("log10", f64::log10, &mut context);

    unary("sin", f64::sin, &mut context);
    unary("cos", f64::cos, &mut context);
    unary("tan", f64::tan, &mut context);
    unary("asin", f64::asin, &mut context);
    unary("acos", f64::acos, &mut context);
    unary("atan", f64::atan, &mut context);
    unary("sinh", f64::sinh, &mut context);
    unary("cosh", f64::cosh, &mut context);
    unary("tanh", f64::tanh, &mut context);
    unary("degrees", f64::to_degrees, &mut context);
    unary("radians", f64::to_radians, &mut context);

    unary("abs", f64::abs, &mut context);
    unary("ceil", f64::ceil, &mut context);
    unary("floor", f64::floor, &mut context);
    unary("round", f64::round, &mut context);
    unary("trunc", f64::trunc, &mut context);

    binary("pow", f64::powf, &mut context);
    binary("atan2", f64::atan2, &mut context);
    binary("hypot", f64::hypot, &mut context);
    binary("fmod", |a, b| a % b, &mut context);

    // Integer helpers the original exposes alongside the math table.
    context
        .set_function(
            "factorial".to_string(),
            Function::new(|argument: &MathValue| {
                let n: i64 = argument.as_int()?;
                let mut product: i64 = 1;
                for i in 2..=n.max(0) {
                    product = product.saturating_mul(i);
                }
                Ok(MathValue::Int(product))
            }),
        )
        .expect("function registration cannot fail on a fresh context");
    context
        .set_function(
            "gcd".to_string(),
            Function::new(|argument: &MathValue| {
                let pair = argument.as_fixed_len_tuple(2)?;
                let mut a: i64 = pair[0].as_int()?.abs();
                let mut b: i64 = pair[1].as_int()?.abs();
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                Ok(MathValue::Int(a))
            }),
        )
        .expect("function registration cannot fail on a fresh context");

    // Numeric conversions, matching the `int`/`float` names snippets use.
    context
        .set_function(
            "int".to_string(),
            Function::new(|argument: &MathValue| {
                Ok(MathValue::Int(argument.as_number()?.trunc() as i64))
            }),
        )
        .expect("function registration cannot fail on a fresh context");
    unary("float", |x| x, &mut context);

    constant("pi", std::f64::consts::PI, &mut context);
    constant("e", std::f64::consts::E, &mut context);
    constant("tau", std::f64::consts::TAU, &mut context);
    context
}

/// Evaluate a snippet in the restricted context.  Assignments and `;`
/// chaining are allowed (`a = 3; a * 2`), so short stateful calculations
/// work without a subprocess.
pub fn eval_restricted(code: &str) -> Result<String, String> {
    let mut context = math_context();
    match eval_with_context_mut(code.trim(), &mut context) {
        Ok(value) => match value {
            MathValue::Empty => Ok("Executed with no output".to_string()),
            other => Ok(other.to_string()),
        },
        Err(err) => Err(err.to_string()),
    }
}
