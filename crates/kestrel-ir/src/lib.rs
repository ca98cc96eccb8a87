//! # kestrel-ir
//!
//! Type system, graph IR and script compiler for Kestrel.
//!
//! This crate takes script source to optimized graphs:
//
//   source ──► Lexer ──► Parser ──► AST ──► CompilationUnit ──► Graph IR
//                                                                  │
//                                   passes (constants, cse, dce, inline,
//                                   shapes, fusion, alias analysis) ◄┘
//
// Graphs are typed: every value carries a `Type`, operator nodes are bound
// to a schema from the builtin `OperatorRegistry`, and control flow is
// structured (If / Loop nodes owning blocks). Nothing here executes a graph;
// the `kestrel` crate does that.
//
// USAGE:
//   let mut unit = kestrel_ir::CompilationUnit::new();
//   unit.define("def double(x: Tensor) -> Tensor { return x * 2; }")?;
//   let f = unit.find_function("double").unwrap();
//   println!("{}", f.graph);

pub mod ast;
pub mod compiler;
pub mod error;
pub mod graph;
pub mod lexer;
pub mod parser;
pub mod passes;
pub mod printer;
pub mod scalar;
pub mod schema;
pub mod token;
pub mod types;
pub mod verify;

pub use compiler::{CompilationUnit, Function, NoResolver, Resolved, Resolver};
pub use error::{Error, ErrorKind, Result};
pub use graph::{BlockId, Constant, Graph, InsertPoint, Node, NodeId, NodeKind, Use, ValueId};
pub use parser::parse;
pub use schema::{FunctionSchema, OperatorRegistry};
pub use types::{AttributeKind, ClassType, NamedTupleType, TensorType, Type};
pub use verify::verify;
