#![doc = include_str!("../README.md")]

mod context;
mod error;
mod eval;
mod parser;
mod token;
mod value;

pub use crate::context::*;
pub use crate::error::*;
pub use crate::eval::*;
pub use crate::parser::*;
pub use crate::token::*;
pub use crate::value::*;
