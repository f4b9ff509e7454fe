//! Expression evaluation over a document context.

use std::cmp::Ordering;

use crate::bson::{Array, Document, Value};
use crate::config::Collation;

use super::{BinOp, Expr, Func, Quant};

pub fn eval(expr: &Expr, root: &Document, collation: &Collation) -> Vec<Value> {
    let ctx = Context {
        root,
        current: None,
        collation,
    };
    ctx.eval(expr)
}

struct Context<'a> {
    root: &'a Document,
    /// The `@` item inside an array filter.
    current: Option<&'a Value>,
    collation: &'a Collation,
}

impl<'a> Context<'a> {
    fn with_current<'b>(&'b self, current: &'b Value) -> Context<'b> {
        Context {
            root: self.root,
            current: Some(current),
            collation: self.collation,
        }
    }

    fn eval(&self, expr: &Expr) -> Vec<Value> {
        match expr {
            Expr::Literal(value) => vec![value.clone()],
            Expr::Root => vec![Value::Document(self.root.clone())],
            Expr::Current => match self.current {
                Some(value) => vec![value.clone()],
                None => vec![Value::Document(self.root.clone())],
            },
            Expr::Field(base, name) => self.eval_field(base, name),
            Expr::Index(base, index) => {
                let idx = self.eval_scalar(index);
                let mut out = Vec::new();
                for value in self.eval(base) {
                    if let (Value::Array(arr), Some(i)) = (&value, idx.as_i64()) {
                        let len = arr.len() as i64;
                        let pos = if i < 0 { len + i } else { i };
                        if (0..len).contains(&pos) {
                            if let Some(item) = arr.get(pos as usize) {
                                out.push(item.clone());
                            }
                        }
                    }
                }
                out
            }
            Expr::AllItems(base) => {
                let mut out = Vec::new();
                for value in self.eval(base) {
                    if let Value::Array(arr) = value {
                        out.extend(arr.into_iter());
                    }
                }
                out
            }
            Expr::FilterItems(base, filter) => {
                let mut out = Vec::new();
                for value in self.eval(base) {
                    if let Value::Array(arr) = value {
                        for item in arr.into_iter() {
                            let keep = self
                                .with_current(&item)
                                .eval_scalar(filter)
                                .is_truthy();
                            if keep {
                                out.push(item);
                            }
                        }
                    }
                }
                out
            }
            Expr::ArrayLit(items) => {
                let mut arr = Array::new();
                for item in items {
                    arr.push(self.eval_scalar(item));
                }
                vec![Value::Array(arr)]
            }
            Expr::DocLit(fields) => {
                let mut doc = Document::new();
                for (name, value) in fields {
                    doc.insert(name.clone(), self.eval_scalar(value));
                }
                vec![Value::Document(doc)]
            }
            Expr::Neg(inner) => {
                vec![Value::Int32(0).sub(&self.eval_scalar(inner))]
            }
            Expr::Not(inner) => {
                vec![Value::Boolean(!self.eval_scalar(inner).is_truthy())]
            }
            Expr::Binary(op, left, right) => vec![self.eval_binary(*op, left, right)],
            Expr::Quantified(quant, op, left, right) => {
                let rhs = self.eval_scalar(right);
                let items = self.eval(left);
                let result = match quant {
                    Quant::Any => items
                        .iter()
                        .any(|item| self.compare_op(*op, item, &rhs)),
                    Quant::All => items
                        .iter()
                        .all(|item| self.compare_op(*op, item, &rhs)),
                };
                vec![Value::Boolean(result)]
            }
            Expr::Call(func, args) => vec![self.eval_call(*func, args)],
        }
    }

    fn eval_scalar(&self, expr: &Expr) -> Value {
        self.eval(expr).into_iter().next().unwrap_or(Value::Null)
    }

    /// Field access avoids materializing the whole root for the common
    /// `$.name` / `@.name` shapes.
    fn eval_field(&self, base: &Expr, name: &str) -> Vec<Value> {
        match base {
            Expr::Root => self
                .root
                .get(name)
                .map(|v| vec![v.clone()])
                .unwrap_or_default(),
            Expr::Current => match self.current {
                Some(Value::Document(doc)) => {
                    doc.get(name).map(|v| vec![v.clone()]).unwrap_or_default()
                }
                Some(_) => Vec::new(),
                None => self
                    .root
                    .get(name)
                    .map(|v| vec![v.clone()])
                    .unwrap_or_default(),
            },
            other => {
                let mut out = Vec::new();
                for value in self.eval(other) {
                    if let Value::Document(doc) = value {
                        if let Some(v) = doc.get(name) {
                            out.push(v.clone());
                        }
                    }
                }
                out
            }
        }
    }

    fn eval_binary(&self, op: BinOp, left: &Expr, right: &Expr) -> Value {
        match op {
            BinOp::And => Value::Boolean(
                self.eval_scalar(left).is_truthy() && self.eval_scalar(right).is_truthy(),
            ),
            BinOp::Or => Value::Boolean(
                self.eval_scalar(left).is_truthy() || self.eval_scalar(right).is_truthy(),
            ),
            BinOp::Add => self.eval_scalar(left).add(&self.eval_scalar(right)),
            BinOp::Sub => self.eval_scalar(left).sub(&self.eval_scalar(right)),
            BinOp::Mul => self.eval_scalar(left).mul(&self.eval_scalar(right)),
            BinOp::Div => self.eval_scalar(left).div(&self.eval_scalar(right)),
            BinOp::Mod => self.eval_scalar(left).rem(&self.eval_scalar(right)),
            _ => {
                let lhs = self.eval_scalar(left);
                let rhs = self.eval_scalar(right);
                Value::Boolean(self.compare_op(op, &lhs, &rhs))
            }
        }
    }

    fn compare_op(&self, op: BinOp, left: &Value, right: &Value) -> bool {
        match op {
            BinOp::Eq => left.total_cmp(right, self.collation) == Ordering::Equal,
            BinOp::Ne => left.total_cmp(right, self.collation) != Ordering::Equal,
            BinOp::Lt => left.total_cmp(right, self.collation) == Ordering::Less,
            BinOp::Lte => left.total_cmp(right, self.collation) != Ordering::Greater,
            BinOp::Gt => left.total_cmp(right, self.collation) == Ordering::Greater,
            BinOp::Gte => left.total_cmp(right, self.collation) != Ordering::Less,
            BinOp::Like => match (left, right) {
                (Value::String(text), Value::String(pattern)) => {
                    like_match(text, pattern, self.collation)
                }
                _ => false,
            },
            BinOp::In => match right {
                Value::Array(items) => items
                    .iter()
                    .any(|item| item.total_cmp(left, self.collation) == Ordering::Equal),
                _ => false,
            },
            _ => false,
        }
    }

    fn eval_call(&self, func: Func, args: &[Expr]) -> Value {
        match func {
            Func::Count => {
                Value::Int32(self.enumerate_arg(args.first()).len() as i32)
            }
            Func::Sum => {
                let mut acc = Value::Int32(0);
                for item in self.enumerate_arg(args.first()) {
                    if item.is_numeric() {
                        acc = acc.add(&item);
                    }
                }
                acc
            }
            Func::Min => self
                .enumerate_arg(args.first())
                .into_iter()
                .min_by(|a, b| a.total_cmp(b, self.collation))
                .unwrap_or(Value::Null),
            Func::Max => self
                .enumerate_arg(args.first())
                .into_iter()
                .max_by(|a, b| a.total_cmp(b, self.collation))
                .unwrap_or(Value::Null),
            Func::Extend => {
                let mut base = match args.first().map(|a| self.eval_scalar(a)) {
                    Some(Value::Document(doc)) => doc,
                    _ => Document::new(),
                };
                if let Some(Value::Document(patch)) = args.get(1).map(|a| self.eval_scalar(a)) {
                    base.extend_with(&patch);
                }
                Value::Document(base)
            }
            Func::VectorSim => {
                let left = args.first().map(|a| self.eval_scalar(a));
                let right = args.get(1).map(|a| self.eval_scalar(a));
                match (
                    left.as_ref().and_then(Value::to_vector),
                    right.as_ref().and_then(Value::to_vector),
                ) {
                    (Some(a), Some(b)) if a.len() == b.len() && !a.is_empty() => {
                        let d = cosine_distance(&a, &b);
                        if d.is_nan() {
                            Value::Null
                        } else {
                            Value::Double(d)
                        }
                    }
                    _ => Value::Null,
                }
            }
            Func::Array => Value::Array(Array::from(self.enumerate_arg(args.first()))),
        }
    }

    /// Sequence view of a function argument: a single array value enumerates
    /// its items, anything else enumerates the raw sequence.
    fn enumerate_arg(&self, arg: Option<&Expr>) -> Vec<Value> {
        let Some(arg) = arg else { return Vec::new() };
        let seq = self.eval(arg);
        if seq.len() == 1 {
            if let Value::Array(arr) = &seq[0] {
                return arr.as_slice().to_vec();
            }
        }
        seq
    }
}

// ============================================================================
// LIKE pattern matching
// ============================================================================

/// SQL LIKE: `%` matches any run, `_` matches one character. Case folding
/// follows the collation.
fn like_match(text: &str, pattern: &str, collation: &Collation) -> bool {
    fn matches(text: &[char], pattern: &[char], collation: &Collation) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('%') => {
                for skip in 0..=text.len() {
                    if matches(&text[skip..], &pattern[1..], collation) {
                        return true;
                    }
                }
                false
            }
            Some('_') => !text.is_empty() && matches(&text[1..], &pattern[1..], collation),
            Some(&p) => match text.first() {
                Some(&t) => {
                    let eq = collation.eq_str(&t.to_string(), &p.to_string());
                    eq && matches(&text[1..], &pattern[1..], collation)
                }
                None => false,
            },
        }
    }
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    matches(&text, &pattern, collation)
}

// ============================================================================
// Vector distance kernels (shared with the vector index)
// ============================================================================

/// Cosine distance: `1 - (a.b)/(|a||b|)`; NaN when either magnitude is zero.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return f64::NAN;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum()
}

/// Default similarity used by `VECTOR_SIM` outside any index: cosine.
pub fn vector_distance(a: &[f32], b: &[f32]) -> f64 {
    cosine_distance(a, b)
}
