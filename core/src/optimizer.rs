//! AST-level constant folding.
//!
//! Pure constant expressions (arithmetic, bitwise, logical, comparison,
//! string concatenation, unary ops) fold through the same operator kernel
//! the VM uses, so folded and runtime results always agree. Conditionals
//! with constant tests keep only the surviving branch, and `for` loops
//! with a constant-false condition disappear. Expressions whose evaluation
//! would error (`5 / 0`) are left alone so the error still happens at
//! runtime, with its position intact.
//!
//! The folder runs up to `max_cycles` passes, stopping at a fixpoint.

use crate::ast::{Expr, Stmt};
use crate::source::Pos;
use crate::token::Token;
use crate::value::{ops, Value};

pub struct Optimizer {
    max_cycles: usize,
    trace: bool,
    fold_constants: bool,
    fold_branches: bool,
    changed: bool,
    folds: usize,
}

impl Optimizer {
    pub fn new(max_cycles: usize, trace: bool) -> Self {
        Optimizer {
            max_cycles: max_cycles.max(1),
            trace,
            fold_constants: true,
            fold_branches: true,
            changed: false,
            folds: 0,
        }
    }

    /// Enable passes selectively: constant-expression folding and
    /// dead-branch elimination.
    pub fn with_flags(mut self, fold_constants: bool, fold_branches: bool) -> Self {
        self.fold_constants = fold_constants;
        self.fold_branches = fold_branches;
        self
    }

    /// Fold `stmts` in place. Returns the number of passes run.
    pub fn optimize(&mut self, stmts: &mut Vec<Stmt>) -> usize {
        let mut cycles = 0;
        for _ in 0..self.max_cycles {
            self.changed = false;
            for stmt in stmts.iter_mut() {
                self.fold_stmt(stmt);
            }
            cycles += 1;
            if !self.changed {
                break;
            }
        }
        if self.trace {
            tracing::debug!(cycles, folds = self.folds, "optimizer finished");
        }
        cycles
    }

    fn mark(&mut self) {
        self.changed = true;
        self.folds += 1;
    }

    fn fold_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Expr(e) => self.fold_expr(e),
            Stmt::Block { stmts, .. } => {
                for s in stmts.iter_mut() {
                    self.fold_stmt(s);
                }
            }
            Stmt::Decl(decl) => {
                if let crate::ast::Decl::Var { specs, .. } | crate::ast::Decl::Const { specs, .. } =
                    decl
                {
                    for spec in specs {
                        if let Some(value) = &mut spec.value {
                            self.fold_expr(value);
                        }
                    }
                }
            }
            Stmt::Assign { lhs, rhs, .. } => {
                // Index/selector targets contain foldable subexpressions.
                for e in lhs.iter_mut() {
                    self.fold_expr(e);
                }
                for e in rhs.iter_mut() {
                    self.fold_expr(e);
                }
            }
            Stmt::IncDec { target, .. } => self.fold_expr(target),
            Stmt::If {
                init,
                cond,
                body,
                alt,
                pos,
            } => {
                if let Some(init) = init {
                    self.fold_stmt(init);
                }
                self.fold_expr(cond);
                for s in body.iter_mut() {
                    self.fold_stmt(s);
                }
                if let Some(alt) = alt {
                    self.fold_stmt(alt);
                }

                // A constant test selects its branch statically.
                if !self.fold_branches {
                    return;
                }
                if let Some(value) = lit_to_value(cond) {
                    let pos = *pos;
                    let mut surviving: Vec<Stmt> = Vec::new();
                    if let Some(init) = init.take() {
                        surviving.push(*init);
                    }
                    if !value.is_falsy() {
                        surviving.append(body);
                    } else if let Some(alt) = alt.take() {
                        surviving.push(*alt);
                    }
                    *stmt = Stmt::Block {
                        stmts: surviving,
                        pos,
                    };
                    self.mark();
                }
            }
            Stmt::For {
                init,
                cond,
                post,
                body,
                pos,
            } => {
                if let Some(init) = init {
                    self.fold_stmt(init);
                }
                if let Some(cond) = cond {
                    self.fold_expr(cond);
                }
                if let Some(post) = post {
                    self.fold_stmt(post);
                }
                for s in body.iter_mut() {
                    self.fold_stmt(s);
                }

                // `for false { ... }` never runs; only its init survives.
                if !self.fold_branches {
                    return;
                }
                let dead = cond
                    .as_ref()
                    .and_then(lit_to_value)
                    .is_some_and(|v| v.is_falsy());
                if dead {
                    let pos = *pos;
                    let mut surviving = Vec::new();
                    if let Some(init) = init.take() {
                        surviving.push(*init);
                    }
                    *stmt = Stmt::Block {
                        stmts: surviving,
                        pos,
                    };
                    self.mark();
                }
            }
            Stmt::ForIn { iterable, body, .. } => {
                self.fold_expr(iterable);
                for s in body.iter_mut() {
                    self.fold_stmt(s);
                }
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.fold_expr(value);
                }
            }
            Stmt::Throw { value, .. } => self.fold_expr(value),
            Stmt::Try {
                body,
                catch,
                finally,
                ..
            } => {
                for s in body.iter_mut() {
                    self.fold_stmt(s);
                }
                if let Some(catch) = catch {
                    for s in catch.body.iter_mut() {
                        self.fold_stmt(s);
                    }
                }
                if let Some(finally) = finally {
                    for s in finally.iter_mut() {
                        self.fold_stmt(s);
                    }
                }
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
        }
    }

    fn fold_expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Binary { op, lhs, rhs, pos } => {
                self.fold_expr(lhs);
                self.fold_expr(rhs);
                if !self.fold_constants {
                    return;
                }
                let op = *op;
                let pos = *pos;

                // Short-circuit operators fold on a constant left side.
                if op == Token::LAnd || op == Token::LOr {
                    if let Some(l) = lit_to_value(lhs) {
                        let keep_lhs = (op == Token::LAnd) == l.is_falsy();
                        let replacement = if keep_lhs {
                            (**lhs).clone()
                        } else {
                            (**rhs).clone()
                        };
                        *expr = replacement;
                        self.mark();
                    }
                    return;
                }

                let (Some(l), Some(r)) = (lit_to_value(lhs), lit_to_value(rhs)) else {
                    return;
                };
                if let Ok(v) = ops::binary_op(op, &l, &r) {
                    if let Some(folded) = value_to_lit(&v, pos) {
                        *expr = folded;
                        self.mark();
                    }
                }
            }
            Expr::Unary { op, operand, pos } => {
                self.fold_expr(operand);
                if !self.fold_constants {
                    return;
                }
                let (op, pos) = (*op, *pos);
                if let Some(v) = lit_to_value(operand) {
                    if let Ok(folded) = ops::unary_op(op, &v) {
                        if let Some(folded) = value_to_lit(&folded, pos) {
                            *expr = folded;
                            self.mark();
                        }
                    }
                }
            }
            Expr::Cond {
                cond, then, alt, ..
            } => {
                self.fold_expr(cond);
                self.fold_expr(then);
                self.fold_expr(alt);
                if !self.fold_branches {
                    return;
                }
                if let Some(c) = lit_to_value(cond) {
                    let replacement = if c.is_falsy() {
                        (**alt).clone()
                    } else {
                        (**then).clone()
                    };
                    *expr = replacement;
                    self.mark();
                }
            }
            Expr::Array { elements, .. } => {
                for e in elements.iter_mut() {
                    self.fold_expr(e);
                }
            }
            Expr::Map { entries, .. } => {
                for entry in entries.iter_mut() {
                    self.fold_expr(&mut entry.value);
                }
            }
            Expr::Func(func) => {
                for s in func.body.iter_mut() {
                    self.fold_stmt(s);
                }
            }
            Expr::Call { callee, args, .. } => {
                self.fold_expr(callee);
                for a in args.iter_mut() {
                    self.fold_expr(a);
                }
            }
            Expr::Index { target, index, .. } => {
                self.fold_expr(target);
                self.fold_expr(index);
            }
            Expr::Selector { target, .. } => self.fold_expr(target),
            Expr::Slice {
                target, low, high, ..
            } => {
                self.fold_expr(target);
                if let Some(low) = low {
                    self.fold_expr(low);
                }
                if let Some(high) = high {
                    self.fold_expr(high);
                }
            }
            Expr::Ident(_)
            | Expr::Int { .. }
            | Expr::Uint { .. }
            | Expr::Float { .. }
            | Expr::Char { .. }
            | Expr::Str { .. }
            | Expr::Bool { .. }
            | Expr::Undefined { .. }
            | Expr::Import { .. } => {}
        }
    }
}

/// The value of a literal expression, when it is one.
fn lit_to_value(expr: &Expr) -> Option<Value> {
    Some(match expr {
        Expr::Int { value, .. } => Value::Int(*value),
        Expr::Uint { value, .. } => Value::Uint(*value),
        Expr::Float { value, .. } => Value::Float(*value),
        Expr::Char { value, .. } => Value::Char(*value),
        Expr::Str { value, .. } => Value::String(value.clone()),
        Expr::Bool { value, .. } => Value::Bool(*value),
        Expr::Undefined { .. } => Value::Undefined,
        _ => return None,
    })
}

/// A literal expression for a scalar value; `None` for reference types.
fn value_to_lit(value: &Value, pos: Pos) -> Option<Expr> {
    Some(match value {
        Value::Int(value) => Expr::Int { value: *value, pos },
        Value::Uint(value) => Expr::Uint { value: *value, pos },
        Value::Float(value) => Expr::Float { value: *value, pos },
        Value::Char(value) => Expr::Char { value: *value, pos },
        Value::String(value) => Expr::Str {
            value: value.clone(),
            pos,
        },
        Value::Bool(value) => Expr::Bool { value: *value, pos },
        Value::Undefined => Expr::Undefined { pos },
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::source::FileSet;

    fn optimized(src: &str) -> Vec<Stmt> {
        let mut fs = FileSet::new();
        let mut stmts = parser::parse(&mut fs, "opt.ugo", src, false).unwrap();
        Optimizer::new(10, false).optimize(&mut stmts);
        stmts
    }

    fn rhs_of(stmts: &[Stmt]) -> &Expr {
        match &stmts[0] {
            Stmt::Assign { rhs, .. } => &rhs[0],
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_folds_arithmetic() {
        let stmts = optimized("x := 1 + 2 * 3");
        assert!(matches!(rhs_of(&stmts), Expr::Int { value: 7, .. }));
    }

    #[test]
    fn test_folds_strings_and_comparisons() {
        let stmts = optimized(r#"x := "a" + "b" == "ab""#);
        assert!(matches!(rhs_of(&stmts), Expr::Bool { value: true, .. }));
    }

    #[test]
    fn test_keeps_runtime_errors() {
        let stmts = optimized("x := 5 / 0");
        assert!(matches!(rhs_of(&stmts), Expr::Binary { .. }));
    }

    #[test]
    fn test_short_circuit_folds() {
        let stmts = optimized("x := false && f()");
        assert!(matches!(rhs_of(&stmts), Expr::Bool { value: false, .. }));
        let stmts = optimized("x := true || f()");
        assert!(matches!(rhs_of(&stmts), Expr::Bool { value: true, .. }));
        let stmts = optimized("x := true && f()");
        assert!(matches!(rhs_of(&stmts), Expr::Call { .. }));
    }

    #[test]
    fn test_constant_if_selects_branch() {
        let stmts = optimized("if 1 < 2 { a() } else { b() }");
        let Stmt::Block { stmts, .. } = &stmts[0] else {
            panic!("expected folded block");
        };
        assert_eq!(stmts.len(), 1);
        assert!(matches!(&stmts[0], Stmt::Expr(Expr::Call { .. })));
    }

    #[test]
    fn test_dead_for_loop_removed() {
        let stmts = optimized("for false { boom() }");
        assert!(matches!(&stmts[0], Stmt::Block { stmts, .. } if stmts.is_empty()));
    }

    #[test]
    fn test_ternary_folds() {
        let stmts = optimized("x := 1 ? \"yes\" : \"no\"");
        assert!(matches!(rhs_of(&stmts), Expr::Str { .. }));
    }

    #[test]
    fn test_fixpoint_cascades() {
        // Needs a second pass: the `if` folds only after its condition.
        let stmts = optimized("if 1 + 1 == 2 { x := 1 }");
        assert!(matches!(&stmts[0], Stmt::Block { .. }));
    }

    #[test]
    fn test_folds_inside_functions() {
        let stmts = optimized("f := func() { return 2 + 3 }");
        let Stmt::Assign { rhs, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Func(lit) = &rhs[0] else {
            panic!();
        };
        let Stmt::Return { value: Some(v), .. } = &lit.body[0] else {
            panic!();
        };
        assert!(matches!(v, Expr::Int { value: 5, .. }));
    }
}
