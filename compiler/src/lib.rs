// schedc — stage schedule metadata
//
// Library root. The schedule core (expr, reduction, schedule, stage, graph)
// plus the directive-script front end and driver built on top of it.

pub mod apply;
pub mod ast;
pub mod diag;
pub mod expr;
pub mod graph;
pub mod lexer;
pub mod parser;
pub mod pipeline;
pub mod reduction;
pub mod schedule;
pub mod stage;
