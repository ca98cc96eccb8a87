// Integration tests for the script parser

use kestrel_ir::ast::*;
use kestrel_ir::parse;

// Definitions

#[test]
fn test_parse_function_with_defaults() {
    let src = r#"
        def scale(x: Tensor, factor: float = 2.0, incr: Optional[List[int]] = None) -> Tensor {
            return x * factor;
        }
    "#;
    let file = parse(src).unwrap();
    assert_eq!(file.items.len(), 1);
    let Item::Def(def) = &file.items[0] else {
        panic!("expected a def");
    };
    assert_eq!(def.name, "scale");
    assert_eq!(def.params.len(), 3);
    assert_eq!(def.params[1].name, "factor");
    assert!(matches!(def.params[1].default, Some(Expr::Float(v, _)) if v == 2.0));
    let incr_ty = def.params[2].ty.as_ref().unwrap();
    assert_eq!(incr_ty.name, "Optional");
    assert_eq!(incr_ty.args[0].name, "List");
    assert_eq!(incr_ty.args[0].args[0].name, "int");
    assert!(matches!(def.params[2].default, Some(Expr::None(_))));
    assert_eq!(def.ret.as_ref().unwrap().name, "Tensor");
    assert!(matches!(def.body[0], Stmt::Return(Some(Expr::Binary { op: BinOp::Mul, .. }), _)));
}

#[test]
fn test_parse_class_with_storage_kinds() {
    let src = r#"
        class Linear {
            param weight: Tensor;
            buffer steps: Tensor;
            scale: float;
            def forward(self, x: Tensor) -> Tensor {
                return x.matmul(self.weight) * self.scale;
            }
        }
    "#;
    let file = parse(src).unwrap();
    let Item::Class(class) = &file.items[0] else {
        panic!("expected a class");
    };
    assert_eq!(class.name, "Linear");
    let kinds: Vec<AttrDeclKind> = class.attrs.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![AttrDeclKind::Parameter, AttrDeclKind::Buffer, AttrDeclKind::Attribute]
    );
    assert_eq!(class.methods.len(), 1);
    assert_eq!(class.methods[0].params[0].name, "self");
}

#[test]
fn test_parse_namedtuple() {
    let src = "namedtuple Pair { first: Tensor, second: int }";
    let file = parse(src).unwrap();
    let Item::NamedTuple(nt) = &file.items[0] else {
        panic!("expected a namedtuple");
    };
    assert_eq!(nt.name, "Pair");
    let names: Vec<&str> = nt.fields.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
}

// Statements

#[test]
fn test_parse_elif_chain_nests_in_else() {
    let src = r#"
        def sign(x: int) -> int {
            if x > 0 { return 1; } elif x < 0 { return -1; } else { return 0; }
        }
    "#;
    let file = parse(src).unwrap();
    let Item::Def(def) = &file.items[0] else {
        panic!("expected a def");
    };
    let Stmt::If { else_body, .. } = &def.body[0] else {
        panic!("expected if");
    };
    assert_eq!(else_body.len(), 1);
    assert!(matches!(else_body[0], Stmt::If { .. }));
}

#[test]
fn test_parse_loops_and_assignments() {
    let src = r#"
        def f(n: int) -> int {
            total: int = 0;
            for i in range(n) {
                if i == 3 { continue; }
                total += i;
            }
            while total > 10 { total -= 1; }
            a, b = total, n;
            return a;
        }
    "#;
    let file = parse(src).unwrap();
    let Item::Def(def) = &file.items[0] else {
        panic!("expected a def");
    };
    assert!(matches!(def.body[0], Stmt::Assign { ann: Some(_), .. }));
    assert!(matches!(def.body[1], Stmt::For { .. }));
    assert!(matches!(def.body[2], Stmt::While { .. }));
    assert!(matches!(
        def.body[3],
        Stmt::Assign { target: AssignTarget::Tuple(..), .. }
    ));
}

#[test]
fn test_parse_optional_tests_and_keywords() {
    let src = r#"
        def f(x: Tensor, k: Optional[int] = None) -> Tensor {
            if k is not None { return x.sum(dim=k); }
            assert x.dim() > 0, "empty";
            raise "unreachable";
        }
    "#;
    let file = parse(src).unwrap();
    let Item::Def(def) = &file.items[0] else {
        panic!("expected a def");
    };
    let Stmt::If { cond, then_body, .. } = &def.body[0] else {
        panic!("expected if");
    };
    assert!(matches!(cond, Expr::IsNone { negated: true, .. }));
    let Stmt::Return(Some(Expr::Call { kwargs, .. }), _) = &then_body[0] else {
        panic!("expected a call");
    };
    assert_eq!(kwargs[0].name, "dim");
    assert!(matches!(def.body[1], Stmt::Assert { msg: Some(_), .. }));
    assert!(matches!(def.body[2], Stmt::Raise(Some(_), _)));
}

// Precedence

#[test]
fn test_power_binds_tighter_than_unary_minus() {
    let file = parse("def f(x: float) -> float { return -x ** 2; }").unwrap();
    let Item::Def(def) = &file.items[0] else {
        panic!("expected a def");
    };
    let Stmt::Return(Some(Expr::Unary { op: UnaryOp::Neg, operand, .. }), _) = &def.body[0] else {
        panic!("expected unary minus at the top");
    };
    assert!(matches!(**operand, Expr::Binary { op: BinOp::Pow, .. }));
}

// Errors

#[test]
fn test_missing_semicolon_is_a_syntax_error() {
    let err = parse("def f() -> int { return 1 }").unwrap_err();
    assert!(err.is_syntax());
    assert!(err.span.is_some());
}

#[test]
fn test_unterminated_block_is_a_syntax_error() {
    let err = parse("def f() -> int { return 1;").unwrap_err();
    assert!(err.is_syntax());
}
