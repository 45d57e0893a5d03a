pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod validator;

use crate::errors::{EngineError, EngineResult};

pub use ast::{Action, ErrorHandler, Step, TaskDefinition};
pub use token::{Token, TokenType};

/// Lex, parse and validate an MBL source in one call.
pub fn parse_task(source: &str, file_name: &str) -> EngineResult<TaskDefinition> {
    let tokens = lexer::tokenize(source)?;
    let task = parser::Parser::new(tokens, file_name.to_string()).parse()?;
    let errors = validator::validate(&task);
    if errors.is_empty() {
        Ok(task)
    } else {
        Err(EngineError::Validation(errors))
    }
}
