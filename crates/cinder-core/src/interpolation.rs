//! `${{ expr }}` templating over an [`ExprContext`].

use crate::expr::{ExprContext, ExprError, Expression};
use regex::Regex;
use std::sync::LazyLock;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("template pattern is valid"));

/// Replace every `${{ expr }}` in `input` with the rendered value of `expr`.
///
/// Missing values render as the empty string.
pub fn interpolate(input: &str, ctx: &ExprContext) -> Result<String, ExprError> {
    if !input.contains("${{") {
        return Ok(input.to_string());
    }

    let mut output = String::with_capacity(input.len());
    let mut last = 0;
    for caps in TEMPLATE.captures_iter(input) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        output.push_str(&input[last..whole.start()]);
        let expr = Expression::parse(body.as_str())?;
        output.push_str(&expr.evaluate(ctx).to_string());
        last = whole.end();
    }
    output.push_str(&input[last..]);
    Ok(output)
}

/// Check that every template in `input` parses.
pub fn validate(input: &str) -> Result<(), ExprError> {
    for caps in TEMPLATE.captures_iter(input) {
        if let Some(body) = caps.get(1) {
            Expression::parse(body.as_str())?;
        }
    }
    Ok(())
}

/// Interpolate the values of an ordered map, keeping its keys.
pub fn interpolate_map(
    map: &crate::workflow::EnvMap,
    ctx: &ExprContext,
) -> Result<crate::workflow::EnvMap, ExprError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), interpolate(v, ctx)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::StepEntry;

    #[test]
    fn test_interpolate_matrix_and_steps() {
        let mut ctx = ExprContext::default();
        ctx.matrix.insert("node".into(), serde_json::json!(18));
        ctx.steps.insert(
            "build".into(),
            StepEntry {
                outcome: "success".into(),
                outputs: [("version".to_string(), "2.0".to_string())].into_iter().collect(),
            },
        );

        assert_eq!(
            interpolate("dist-${{ matrix.node }}-v${{steps.build.outputs.version}}", &ctx).unwrap(),
            "dist-18-v2.0"
        );
    }

    #[test]
    fn test_plain_strings_pass_through() {
        let ctx = ExprContext::default();
        assert_eq!(interpolate("cargo test", &ctx).unwrap(), "cargo test");
        assert_eq!(interpolate("x-${{ env.NOPE }}", &ctx).unwrap(), "x-");
    }

    #[test]
    fn test_invalid_template_is_an_error() {
        assert!(validate("${{ matrix.os == }}").is_err());
        assert!(validate("cache-${{ matrix.os }}").is_ok());
    }
}
