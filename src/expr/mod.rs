//! Expression language over documents: path access (`$.a.b`,
//! `$.items[*]`), predicates, arithmetic, quantifiers and the small set of
//! functions the query planner understands.

mod eval;
mod parser;

use std::collections::BTreeSet;
use std::fmt;

use crate::bson::{Document, Value};
use crate::config::Collation;
use crate::error::Result;

pub use eval::{cosine_distance, dot_product, euclidean_distance, vector_distance};

// ============================================================================
// AST
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    In,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Gte
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Lte => "<=",
            BinOp::Gt => ">",
            BinOp::Gte => ">=",
            BinOp::Like => "LIKE",
            BinOp::In => "IN",
            BinOp::And => "AND",
            BinOp::Or => "OR",
        }
    }

    /// Mirror a comparison so its operands can swap sides.
    pub fn mirrored(&self) -> BinOp {
        match self {
            BinOp::Lt => BinOp::Gt,
            BinOp::Lte => BinOp::Gte,
            BinOp::Gt => BinOp::Lt,
            BinOp::Gte => BinOp::Lte,
            other => *other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quant {
    Any,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
    Count,
    Sum,
    Min,
    Max,
    Extend,
    VectorSim,
    Array,
}

impl Func {
    fn name(&self) -> &'static str {
        match self {
            Func::Count => "COUNT",
            Func::Sum => "SUM",
            Func::Min => "MIN",
            Func::Max => "MAX",
            Func::Extend => "EXTEND",
            Func::VectorSim => "VECTOR_SIM",
            Func::Array => "ARRAY",
        }
    }

    fn parse(name: &str) -> Option<Func> {
        Some(match name.to_ascii_uppercase().as_str() {
            "COUNT" => Func::Count,
            "SUM" => Func::Sum,
            "MIN" => Func::Min,
            "MAX" => Func::Max,
            "EXTEND" => Func::Extend,
            "VECTOR_SIM" => Func::VectorSim,
            "ARRAY" => Func::Array,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `$` - the document root.
    Root,
    /// `@` - the current item inside an array filter.
    Current,
    Field(Box<Expr>, String),
    /// `base[n]`; negative indexes count from the end.
    Index(Box<Expr>, Box<Expr>),
    /// `base[*]` - enumerate all items.
    AllItems(Box<Expr>),
    /// `base[<predicate>]` - items where the predicate holds for `@`.
    FilterItems(Box<Expr>, Box<Expr>),
    ArrayLit(Vec<Expr>),
    DocLit(Vec<(String, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `left ANY|ALL <op> right` over an enumerable left side.
    Quantified(Quant, BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    /// True when evaluation yields at most one value.
    pub fn is_scalar(&self) -> bool {
        match self {
            Expr::AllItems(_) | Expr::FilterItems(_, _) => false,
            Expr::Field(base, _) | Expr::Index(base, _) => base.is_scalar(),
            Expr::Neg(inner) | Expr::Not(inner) => inner.is_scalar(),
            _ => true,
        }
    }

    /// Top-level document fields this expression touches; `$` when the whole
    /// root is required.
    pub fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Root => {
                out.insert("$".to_string());
            }
            Expr::Field(base, name) => {
                if matches!(**base, Expr::Root) {
                    out.insert(name.clone());
                } else {
                    base.collect_fields(out);
                }
            }
            Expr::Current | Expr::Literal(_) => {}
            Expr::Index(base, idx) => {
                base.collect_fields(out);
                idx.collect_fields(out);
            }
            Expr::AllItems(base) => base.collect_fields(out),
            Expr::FilterItems(base, filter) => {
                base.collect_fields(out);
                filter.collect_fields(out);
            }
            Expr::ArrayLit(items) => {
                for item in items {
                    item.collect_fields(out);
                }
            }
            Expr::DocLit(fields) => {
                for (_, value) in fields {
                    value.collect_fields(out);
                }
            }
            Expr::Neg(inner) | Expr::Not(inner) => inner.collect_fields(out),
            Expr::Binary(_, left, right) | Expr::Quantified(_, _, left, right) => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_fields(out);
                }
            }
        }
    }

    fn references_document(&self) -> bool {
        let mut fields = BTreeSet::new();
        self.collect_fields(&mut fields);
        !fields.is_empty()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Root => write!(f, "$"),
            Expr::Current => write!(f, "@"),
            Expr::Field(base, name) => write!(f, "{base}.{name}"),
            Expr::Index(base, idx) => write!(f, "{base}[{idx}]"),
            Expr::AllItems(base) => write!(f, "{base}[*]"),
            Expr::FilterItems(base, filter) => write!(f, "{base}[{filter}]"),
            Expr::ArrayLit(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Expr::DocLit(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}:{value}")?;
                }
                write!(f, "}}")
            }
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Not(inner) => write!(f, "NOT({inner})"),
            Expr::Binary(op, left, right) => write!(f, "{left} {} {right}", op.symbol()),
            Expr::Quantified(quant, op, left, right) => {
                let kw = match quant {
                    Quant::Any => "ANY",
                    Quant::All => "ALL",
                };
                write!(f, "{left} {kw} {} {right}", op.symbol())
            }
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Expression - parsed AST plus its canonical source
// ============================================================================

/// A parsed expression. The canonical source (regenerated from the AST) is
/// the identity used to match query terms against index expressions.
#[derive(Clone, Debug)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Expression> {
        let ast = parser::parse(text)?;
        Ok(Expression::from_ast(ast))
    }

    pub fn from_ast(ast: Expr) -> Expression {
        Expression {
            source: ast.to_string(),
            ast,
        }
    }

    /// Shorthand for `$.<field>` path expressions.
    pub fn field(name: &str) -> Expression {
        Expression::from_ast(Expr::Field(Box::new(Expr::Root), name.to_string()))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn is_scalar(&self) -> bool {
        self.ast.is_scalar()
    }

    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.ast.collect_fields(&mut out);
        out
    }

    /// True for a bare `$.field` (optionally nested) path.
    pub fn is_path(&self) -> bool {
        fn is_path_ast(expr: &Expr) -> bool {
            match expr {
                Expr::Root => true,
                Expr::Field(base, _) => is_path_ast(base),
                _ => false,
            }
        }
        is_path_ast(&self.ast)
    }

    /// Evaluate to a sequence of values.
    pub fn eval(&self, root: &Document, collation: &Collation) -> Vec<Value> {
        eval::eval(&self.ast, root, collation)
    }

    /// Evaluate to a single value; an empty sequence yields Null.
    pub fn eval_scalar(&self, root: &Document, collation: &Collation) -> Value {
        self.eval(root, collation).into_iter().next().unwrap_or(Value::Null)
    }

    /// Evaluate without a document when no paths are referenced; used by the
    /// planner to extract constant operands.
    pub fn try_constant(&self, collation: &Collation) -> Option<Value> {
        if self.ast.references_document() {
            return None;
        }
        let empty = Document::new();
        Some(self.eval_scalar(&empty, collation))
    }

    /// AND-term decomposition of a WHERE predicate.
    pub fn split_and(&self) -> Vec<Expression> {
        fn walk(expr: &Expr, out: &mut Vec<Expression>) {
            match expr {
                Expr::Binary(BinOp::And, left, right) => {
                    walk(left, out);
                    walk(right, out);
                }
                other => out.push(Expression::from_ast(other.clone())),
            }
        }
        let mut out = Vec::new();
        walk(&self.ast, &mut out);
        out
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn ctx() -> (Document, Collation) {
        (
            doc! {
                "name" => "ada",
                "age" => 36,
                "tags" => crate::array!["a", "b", "c"],
                "address" => doc! { "city" => "london" }
            },
            Collation::ordinal(),
        )
    }

    #[test]
    fn canonical_source_round_trips() {
        for src in [
            "$.age > 10 AND $.name = \"ada\"",
            "$.tags[*]",
            "COUNT($.tags[*]) = 3",
            "$.items[@.price >= 5]",
        ] {
            let expr = Expression::parse(src).unwrap();
            let reparsed = Expression::parse(expr.source()).unwrap();
            assert_eq!(expr.source(), reparsed.source());
        }
    }

    #[test]
    fn scalar_flags() {
        assert!(Expression::parse("$.age + 1").unwrap().is_scalar());
        assert!(!Expression::parse("$.tags[*]").unwrap().is_scalar());
        assert!(Expression::parse("COUNT($.tags[*])").unwrap().is_scalar());
    }

    #[test]
    fn field_collection() {
        let expr = Expression::parse("$.age > 10 AND $.address.city = \"x\"").unwrap();
        let fields = expr.fields();
        assert!(fields.contains("age"));
        assert!(fields.contains("address"));
        assert!(!fields.contains("$"));

        let root = Expression::parse("COUNT($)").unwrap();
        assert!(root.fields().contains("$"));
    }

    #[test]
    fn split_and_terms() {
        let expr = Expression::parse("$.a = 1 AND $.b > 2 AND $.c < 3").unwrap();
        let terms = expr.split_and();
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[1].source(), "$.b > 2");
    }

    #[test]
    fn constants() {
        let collation = Collation::ordinal();
        assert_eq!(
            Expression::parse("1 + 2").unwrap().try_constant(&collation),
            Some(Value::Int32(3))
        );
        assert_eq!(
            Expression::parse("$.a + 1").unwrap().try_constant(&collation),
            None
        );
    }

    #[test]
    fn eval_paths_and_predicates() {
        let (doc, collation) = ctx();
        let expr = Expression::parse("$.address.city").unwrap();
        assert_eq!(expr.eval_scalar(&doc, &collation), Value::from("london"));

        let pred = Expression::parse("$.age >= 36 AND $.name != \"bob\"").unwrap();
        assert!(pred.eval_scalar(&doc, &collation).is_truthy());

        let all = Expression::parse("$.tags[*]").unwrap();
        assert_eq!(all.eval(&doc, &collation).len(), 3);
    }
}
