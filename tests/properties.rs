//! Property tests for the split-expression evaluator and SQL rewriting

use kumo::expr::{ExprError, ShardEvaluator};
use kumo::logic_db::LogicDb;
use kumo::sql::rewrite_sql;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Expr {
    Num(u32),
    Arg,
    Bin(Box<Expr>, &'static str, Box<Expr>),
}

const OPS: &[&str] = &["+", "-", "*", "/", "%", "&", "|", "<<", ">>"];

fn apply(op: &str, a: u32, b: u32) -> Option<u32> {
    match op {
        "+" => Some(a.wrapping_add(b)),
        "-" => Some(a.wrapping_sub(b)),
        "*" => Some(a.wrapping_mul(b)),
        "/" => a.checked_div(b),
        "%" => a.checked_rem(b),
        "&" => Some(a & b),
        "|" => Some(a | b),
        "<<" => Some(a.checked_shl(b).unwrap_or(0)),
        _ => Some(a.checked_shr(b).unwrap_or(0)),
    }
}

/// Lower binds tighter
fn precedence(op: &str) -> u8 {
    match op {
        "*" | "/" | "%" => 3,
        "+" | "-" => 4,
        "<<" | ">>" => 5,
        "&" => 8,
        _ => 10,
    }
}

impl Expr {
    fn render(&self) -> String {
        match self {
            Expr::Num(n) => n.to_string(),
            Expr::Arg => "$".to_string(),
            Expr::Bin(a, op, b) => format!("({} {} {})", a.render(), op, b.render()),
        }
    }

    fn value(&self, arg: u32) -> Option<u32> {
        match self {
            Expr::Num(n) => Some(*n),
            Expr::Arg => Some(arg),
            Expr::Bin(a, op, b) => apply(op, a.value(arg)?, b.value(arg)?),
        }
    }
}

fn expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![(0u32..1000).prop_map(Expr::Num), Just(Expr::Arg)];
    leaf.prop_recursive(4, 24, 2, |inner| {
        (inner.clone(), prop::sample::select(OPS), inner)
            .prop_map(|(a, op, b)| Expr::Bin(Box::new(a), op, Box::new(b)))
    })
}

proptest! {
    #[test]
    fn parenthesized_expressions_match_reference(e in expr(), arg in any::<u32>()) {
        let evaluator = ShardEvaluator::new();
        let source = e.render();
        match e.value(arg) {
            Some(expected) => prop_assert_eq!(evaluator.compute(&source, arg), Ok(expected)),
            None => prop_assert!(matches!(
                evaluator.compute(&source, arg),
                Err(ExprError::Compute(_))
            )),
        }
    }

    #[test]
    fn flat_expressions_follow_precedence(
        a in 0u32..5000,
        b in 1u32..40,
        c in 1u32..40,
        op1 in prop::sample::select(OPS),
        op2 in prop::sample::select(OPS),
    ) {
        let evaluator = ShardEvaluator::new();
        let expected = if precedence(op2) < precedence(op1) {
            apply(op2, b, c).and_then(|bc| apply(op1, a, bc))
        } else {
            apply(op1, a, b).and_then(|ab| apply(op2, ab, c))
        };
        let source = format!("{} {} {} {} {}", a, op1, b, op2, c);
        if let Some(expected) = expected {
            prop_assert_eq!(evaluator.compute(&source, 0), Ok(expected));
        }
    }

    #[test]
    fn unsplit_statements_are_untouched(sql in "[ -~]{0,120}") {
        let rewritten = rewrite_sql(&sql, None, |_, _| Ok(None)).unwrap();
        prop_assert_eq!(&rewritten, &sql);
        let rewritten = rewrite_sql(&sql, Some(&["orders"][..]), |_, _| Ok(None)).unwrap();
        prop_assert_eq!(&rewritten, &sql);
    }

    #[test]
    fn split_table_routes_by_key(key in any::<u32>(), sub_tables in 1u32..64) {
        let evaluator = ShardEvaluator::new();
        let mut db = LogicDb::new("shop");
        db.add_table_split("orders", sub_tables, "($ >> 3) + 7", &evaluator).unwrap();

        let sql = "SELECT * FROM orders WHERE id=1";
        let route = |_: Option<&str>, table: &str| db.table_id(table, Some(key), &evaluator);
        let first = rewrite_sql(sql, None, route).unwrap();
        let second = rewrite_sql(sql, None, route).unwrap();

        let index = ((key >> 3).wrapping_add(7)) % sub_tables;
        prop_assert_eq!(&first, &format!("SELECT * FROM orders_{} WHERE id=1", index));
        prop_assert_eq!(first, second);
    }
}

#[test]
fn empty_expression_is_not_a_compute_error() {
    let evaluator = ShardEvaluator::new();
    assert_eq!(evaluator.evaluate(&[], 5), Err(ExprError::Empty));
    assert_eq!(evaluator.compute("", 5), Err(ExprError::Empty));
    assert!(matches!(evaluator.compute("$ +", 5), Err(ExprError::Compute(_))));
}

#[test]
fn documented_examples() {
    let evaluator = ShardEvaluator::new();
    assert_eq!(evaluator.compute("$ & 3", 7), Ok(3));
    assert_eq!(evaluator.compute("($ + 1) * 2", 5), Ok(12));
}
