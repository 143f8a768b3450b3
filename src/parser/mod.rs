//! SQL parser: tokenization and AST

pub mod ast;
pub mod grammar;
pub mod tokenizer;

pub use grammar::{parse, Parser};
