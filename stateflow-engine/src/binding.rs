//! Evaluator capabilities and the built-in expression binding.
//!
//! The interpreter never sees expression text at run time: every
//! `cond`/`expr`/`location`/`script` surface in the document is compiled
//! exactly once at model-build time into an evaluator instance through a
//! [`DataModelBinding`]. Richer language bindings plug in by implementing
//! the same traits.
//!
//! [`BasicBinding`] is the default binding. Its expression language:
//!
//! - `order.total` - data-model location access (dotted paths)
//! - literals: numbers, `'single'`/`"double"` strings, `true`, `false`,
//!   `null`, `undefined`
//! - `==` `!=` - equality on any values
//! - `<` `<=` `>` `>=` - numeric ordering (fails on non-numbers)
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! Examples: `enabled`, `order.total > 100 && approved`,
//! `(a || b) && status == 'active'`.

use crate::datamodel::DataModel;
use crate::error::ExecutionError;
use stateflow_value::{Number, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// An expression surface failed to compile at model-build time.
#[derive(Debug, Error)]
#[error("cannot compile '{text}': {reason}")]
pub struct CompileError {
    pub text: String,
    pub reason: String,
}

impl CompileError {
    fn new(text: &str, reason: impl Into<String>) -> Self {
        Self {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// Evaluates to a value (`expr`, done-data, send payloads).
pub trait ValueEvaluator: Send + Sync {
    fn evaluate(&self, data: &DataModel) -> Result<Value, ExecutionError>;
}

/// Evaluates to a boolean (transition guards, `if` branches).
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, data: &DataModel) -> Result<bool, ExecutionError>;
}

/// A readable and assignable data-model location.
pub trait LocationEvaluator: Send + Sync {
    fn location(&self) -> &str;
    fn get(&self, data: &DataModel) -> Result<Value, ExecutionError>;
    fn set(&self, data: &DataModel, value: Value) -> Result<(), ExecutionError>;
}

/// Side-effecting script content.
pub trait ScriptEvaluator: Send + Sync {
    fn execute(&self, data: &DataModel) -> Result<(), ExecutionError>;
}

/// Compiles document expression text into evaluator instances, once per
/// surface, at model-build time.
pub trait DataModelBinding: Send + Sync {
    fn compile_expression(&self, text: &str) -> Result<Arc<dyn ValueEvaluator>, CompileError>;
    fn compile_condition(&self, text: &str) -> Result<Arc<dyn ConditionEvaluator>, CompileError>;
    fn compile_location(&self, text: &str) -> Result<Arc<dyn LocationEvaluator>, CompileError>;
    fn compile_script(&self, text: &str) -> Result<Arc<dyn ScriptEvaluator>, CompileError>;
}

// ============================================================================
// Basic binding
// ============================================================================

/// The built-in expression binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicBinding;

impl DataModelBinding for BasicBinding {
    fn compile_expression(&self, text: &str) -> Result<Arc<dyn ValueEvaluator>, CompileError> {
        Ok(Arc::new(Expr::parse(text)?))
    }

    fn compile_condition(&self, text: &str) -> Result<Arc<dyn ConditionEvaluator>, CompileError> {
        Ok(Arc::new(Expr::parse(text)?))
    }

    fn compile_location(&self, text: &str) -> Result<Arc<dyn LocationEvaluator>, CompileError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CompileError::new(text, "empty location"));
        }
        for segment in text.split('.') {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_')
            {
                return Err(CompileError::new(
                    text,
                    format!("invalid location segment '{segment}'"),
                ));
            }
        }
        Ok(Arc::new(Location {
            path: text.to_string(),
        }))
    }

    fn compile_script(&self, text: &str) -> Result<Arc<dyn ScriptEvaluator>, CompileError> {
        Err(CompileError::new(
            text,
            "the basic binding does not support scripts",
        ))
    }
}

struct Location {
    path: String,
}

impl LocationEvaluator for Location {
    fn location(&self) -> &str {
        &self.path
    }

    fn get(&self, data: &DataModel) -> Result<Value, ExecutionError> {
        Ok(data.get(&self.path))
    }

    fn set(&self, data: &DataModel, value: Value) -> Result<(), ExecutionError> {
        data.set(&self.path, value)
    }
}

/// A parsed expression.
#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Expr {
    fn parse(text: &str) -> Result<Self, CompileError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(CompileError::new(text, "empty expression"));
        }
        let mut parser = Parser {
            input: trimmed,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(CompileError::new(
                text,
                format!("unexpected trailing input at offset {}", parser.pos),
            ));
        }
        Ok(expr)
    }

    fn eval(&self, data: &DataModel) -> Result<Value, ExecutionError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(data.get(path)),
            Expr::Not(inner) => Ok(Value::Boolean(!inner.eval(data)?.truthy())),
            Expr::And(left, right) => {
                let result = left.eval(data)?.truthy() && right.eval(data)?.truthy();
                Ok(Value::Boolean(result))
            }
            Expr::Or(left, right) => {
                let result = left.eval(data)?.truthy() || right.eval(data)?.truthy();
                Ok(Value::Boolean(result))
            }
            Expr::Compare(op, left, right) => {
                let lhs = left.eval(data)?;
                let rhs = right.eval(data)?;
                let result = match op {
                    CompareOp::Eq => lhs == rhs,
                    CompareOp::Ne => lhs != rhs,
                    ordering_op => {
                        let ln = numeric_operand(&lhs)?;
                        let rn = numeric_operand(&rhs)?;
                        match ln.compare(&rn) {
                            // NaN never compares.
                            None => false,
                            Some(ord) => match ordering_op {
                                CompareOp::Gt => ord == Ordering::Greater,
                                CompareOp::Ge => ord != Ordering::Less,
                                CompareOp::Lt => ord == Ordering::Less,
                                CompareOp::Le => ord != Ordering::Greater,
                                CompareOp::Eq | CompareOp::Ne => unreachable!(),
                            },
                        }
                    }
                };
                Ok(Value::Boolean(result))
            }
        }
    }
}

fn numeric_operand(value: &Value) -> Result<Number, ExecutionError> {
    value
        .as_number()
        .map_err(|_| ExecutionError::Evaluation {
            expr: value.to_display_string(),
            reason: "ordering comparison requires numbers".to_string(),
        })
}

impl ValueEvaluator for Expr {
    fn evaluate(&self, data: &DataModel) -> Result<Value, ExecutionError> {
        self.eval(data)
    }
}

impl ConditionEvaluator for Expr {
    fn evaluate(&self, data: &DataModel) -> Result<bool, ExecutionError> {
        Ok(self.eval(data)?.truthy())
    }
}

/// Recursive descent parser for the basic expression language.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();
        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();
        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_unary()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((CompareOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CompareOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CompareOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CompareOp::Le, 2))
        } else if self.peek_str(">") {
            Some((CompareOp::Gt, 1))
        } else if self.peek_str("<") {
            Some((CompareOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, width)) => {
                self.pos += width;
                let right = self.parse_unary()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        self.skip_whitespace();
        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_or()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('\'') | Some('"') => self.parse_string(),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_path_or_keyword(),
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_path_or_keyword(&mut self) -> Result<Expr, CompileError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];
        match word {
            "true" => Ok(Expr::Literal(Value::Boolean(true))),
            "false" => Ok(Expr::Literal(Value::Boolean(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "undefined" => Ok(Expr::Literal(Value::Undefined)),
            "" => Err(self.error("expected identifier")),
            path if path.split('.').any(str::is_empty) => {
                Err(self.error(&format!("malformed path '{path}'")))
            }
            path => Ok(Expr::Path(path.to_string())),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, CompileError> {
        let quote = self.peek_char().unwrap();
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == quote {
                let text = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Expr::Literal(Value::from(text)));
            }
            self.pos += c.len_utf8();
        }
        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Expr, CompileError> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        let mut fractional = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !fractional {
                fractional = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        let value = if fractional {
            text.parse::<f64>()
                .map(Value::from)
                .map_err(|_| self.error(&format!("invalid number '{text}'")))?
        } else {
            let i = text
                .parse::<i64>()
                .map_err(|_| self.error(&format!("invalid number '{text}'")))?;
            match i32::try_from(i) {
                Ok(small) => Value::from(small),
                Err(_) => Value::from(i),
            }
        };
        Ok(Expr::Literal(value))
    }

    fn error(&self, reason: &str) -> CompileError {
        CompileError::new(self.input, format!("{reason} at offset {}", self.pos))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateflow_value::Obj;

    fn data(pairs: &[(&str, Value)]) -> DataModel {
        let dm = DataModel::new();
        for (key, value) in pairs {
            dm.declare(key, value.clone()).unwrap();
        }
        dm
    }

    fn cond(text: &str, dm: &DataModel) -> bool {
        BasicBinding
            .compile_condition(text)
            .unwrap()
            .evaluate(dm)
            .unwrap()
    }

    #[test]
    fn truthy_path() {
        let dm = data(&[("enabled", Value::Boolean(true))]);
        assert!(cond("enabled", &dm));
        assert!(!cond("missing", &dm));
        assert!(!cond("!enabled", &dm));
    }

    #[test]
    fn nested_path() {
        let order = Obj::new();
        order.add("paid", true).unwrap();
        let dm = data(&[("order", Value::from(order))]);
        assert!(cond("order.paid", &dm));
        assert!(!cond("order.shipped", &dm));
    }

    #[test]
    fn equality_across_value_kinds() {
        let dm = data(&[
            ("status", Value::from("active")),
            ("count", Value::from(42i32)),
        ]);
        assert!(cond("status == 'active'", &dm));
        assert!(cond("status != \"inactive\"", &dm));
        assert!(cond("count == 42", &dm));
        assert!(cond("missing == undefined", &dm));
    }

    #[test]
    fn numeric_ordering() {
        let dm = data(&[("amount", Value::from(150i32))]);
        assert!(cond("amount > 100", &dm));
        assert!(cond("amount >= 150", &dm));
        assert!(!cond("amount < 150", &dm));
        assert!(cond("amount <= 150.5", &dm));
        assert!(cond("amount > -10", &dm));
    }

    #[test]
    fn ordering_on_non_number_fails() {
        let dm = data(&[("name", Value::from("text"))]);
        let guard = BasicBinding.compile_condition("name > 10").unwrap();
        assert!(matches!(
            guard.evaluate(&dm),
            Err(ExecutionError::Evaluation { .. })
        ));
    }

    #[test]
    fn precedence_and_grouping() {
        let dm = data(&[
            ("a", Value::Boolean(false)),
            ("b", Value::Boolean(true)),
            ("c", Value::Boolean(true)),
        ]);
        // && binds tighter than ||.
        assert!(cond("a && b || c", &dm));
        assert!(!cond("a && (b || c)", &dm));
        assert!(cond("(a || b) && c", &dm));
        assert!(cond("!(a && b)", &dm));
    }

    #[test]
    fn expression_evaluates_to_value() {
        let dm = data(&[("count", Value::from(7i32))]);
        let expr = BasicBinding.compile_expression("count").unwrap();
        assert_eq!(expr.evaluate(&dm).unwrap(), Value::from(7i32));

        let literal = BasicBinding.compile_expression("'hello'").unwrap();
        assert_eq!(literal.evaluate(&dm).unwrap(), Value::from("hello"));
    }

    #[test]
    fn location_roundtrip() {
        let dm = data(&[("count", Value::from(1i32))]);
        let loc = BasicBinding.compile_location("count").unwrap();
        loc.set(&dm, Value::from(2i32)).unwrap();
        assert_eq!(loc.get(&dm).unwrap(), Value::from(2i32));
    }

    #[test]
    fn compile_failures() {
        assert!(BasicBinding.compile_condition("").is_err());
        assert!(BasicBinding.compile_condition("(a && b").is_err());
        assert!(BasicBinding.compile_condition("a == 'unclosed").is_err());
        assert!(BasicBinding.compile_condition("a b").is_err());
        assert!(BasicBinding.compile_location("a..b").is_err());
        assert!(BasicBinding.compile_location("a-b").is_err());
        assert!(BasicBinding.compile_script("anything").is_err());
    }

    #[test]
    fn not_does_not_eat_inequality() {
        let dm = data(&[("x", Value::from(1i32))]);
        assert!(cond("x != 2", &dm));
    }
}
