use crate::errors::{EngineError, EngineResult};
use crate::mbl::ast::{Action, ErrorHandler, Step, TaskDefinition};
use crate::mbl::token::{Token, TokenType};

/// Recursive-descent parser over the lexer's token stream.
///
/// `Indent` tokens are skipped wherever a keyword is expected and runs of
/// `Newline` tokens are absorbed between productions; structure comes from
/// keywords alone.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file_name: String,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, file_name: String) -> Self {
        Self {
            tokens,
            pos: 0,
            file_name,
        }
    }

    pub fn parse(mut self) -> EngineResult<TaskDefinition> {
        self.skip_blank();
        self.expect_keyword("task")?;
        let name = self.expect_string()?;
        self.expect_newline()?;

        self.skip_blank();
        let inputs = if self.at_keyword("input") {
            self.parse_inputs()?
        } else {
            Vec::new()
        };

        let mut steps = Vec::new();
        loop {
            self.skip_blank();
            if !self.at_keyword("step") {
                break;
            }
            steps.push(self.parse_step()?);
        }

        let mut on_timeout: Option<ErrorHandler> = None;
        let mut on_error: Option<ErrorHandler> = None;
        loop {
            self.skip_blank();
            if !self.at_keyword("on") {
                break;
            }
            let on_line = self.current().line;
            self.advance();
            let kind = self.current().clone();
            match kind.value.as_str() {
                "timeout" if kind.token_type == TokenType::Keyword => {
                    self.advance();
                    self.expect_newline()?;
                    let handler = ErrorHandler {
                        actions: self.parse_actions(&["step", "on"])?,
                    };
                    if on_timeout.replace(handler).is_some() {
                        return Err(self.error_at(on_line, "duplicate 'on timeout' handler"));
                    }
                }
                "error" if kind.token_type == TokenType::Keyword => {
                    self.advance();
                    self.expect_newline()?;
                    let handler = ErrorHandler {
                        actions: self.parse_actions(&["step", "on"])?,
                    };
                    if on_error.replace(handler).is_some() {
                        return Err(self.error_at(on_line, "duplicate 'on error' handler"));
                    }
                }
                _ => {
                    return Err(self.error("expected 'timeout' or 'error' after 'on'"));
                }
            }
        }

        self.skip_blank();
        if self.current().token_type != TokenType::Eof {
            return Err(self.error(format!(
                "unexpected token '{}' after task body",
                self.current().value
            )));
        }

        Ok(TaskDefinition {
            name,
            file_name: self.file_name.clone(),
            inputs,
            steps,
            on_timeout,
            on_error,
        })
    }

    fn parse_inputs(&mut self) -> EngineResult<Vec<String>> {
        self.expect_keyword("input")?;
        let mut inputs = Vec::new();
        loop {
            let line = self.current().line;
            let name = self.expect_identifier()?;
            if inputs.contains(&name) {
                return Err(self.error_at(line, format!("duplicate input '{name}'")));
            }
            inputs.push(name);
            if self.current().token_type == TokenType::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_newline()?;
        Ok(inputs)
    }

    fn parse_step(&mut self) -> EngineResult<Step> {
        self.expect_keyword("step")?;
        let description = self.expect_string()?;
        self.expect_newline()?;

        self.skip_blank();
        let timeout_seconds = if self.at_keyword("timeout") {
            let line = self.current().line;
            self.advance();
            let value = self.expect_integer()?;
            if value == 0 {
                return Err(self.error_at(line, "step timeout must be positive"));
            }
            self.expect_newline()?;
            Some(value)
        } else {
            None
        };

        let actions = self.parse_actions(&["step", "on"])?;
        Ok(Step {
            description,
            timeout_seconds,
            actions,
        })
    }

    /// Parses actions until one of `stop` keywords or end of input.
    fn parse_actions(&mut self, stop: &[&str]) -> EngineResult<Vec<Action>> {
        let mut actions = Vec::new();
        loop {
            self.skip_blank();
            let current = self.current();
            if current.token_type == TokenType::Eof {
                break;
            }
            if current.token_type == TokenType::Keyword
                && stop.contains(&current.value.as_str())
            {
                break;
            }
            actions.push(self.parse_action()?);
        }
        Ok(actions)
    }

    fn parse_action(&mut self) -> EngineResult<Action> {
        let token = self.current().clone();
        if token.token_type != TokenType::Keyword {
            return Err(self.error(format!("expected an action, found '{}'", token.value)));
        }

        match token.value.as_str() {
            "expect" => {
                self.advance();
                let description = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Expect { description })
            }
            "click" => {
                self.advance();
                let target = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Click { target })
            }
            "double-click" => {
                self.advance();
                let target = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::DoubleClick { target })
            }
            "right-click" => {
                self.advance();
                let target = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::RightClick { target })
            }
            "type" => {
                self.advance();
                let (value, is_param) = self.expect_value()?;
                let append = if self.at_keyword("append") {
                    self.advance();
                    true
                } else {
                    false
                };
                self.expect_keyword("into")?;
                let target = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Type {
                    value,
                    is_param,
                    target,
                    append,
                })
            }
            "select" => {
                self.advance();
                let (value, is_param) = self.expect_value()?;
                self.expect_keyword("in")?;
                let target = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Select {
                    value,
                    is_param,
                    target,
                })
            }
            "key" => {
                self.advance();
                let combo = self.current().clone();
                if combo.token_type != TokenType::KeyCombo {
                    return Err(self.error(format!(
                        "expected a key combo after 'key', found '{}'",
                        combo.value
                    )));
                }
                self.advance();
                self.expect_newline()?;
                Ok(Action::Key {
                    key_combo: combo.value,
                })
            }
            "extract" => {
                self.advance();
                let variable = self.expect_identifier()?;
                self.expect_keyword("from")?;
                let source = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Extract { variable, source })
            }
            "output" => {
                self.advance();
                let variable = self.expect_identifier()?;
                self.expect_newline()?;
                Ok(Action::Output { variable })
            }
            "screenshot" => {
                self.advance();
                self.expect_newline()?;
                Ok(Action::Screenshot)
            }
            "abort" => {
                self.advance();
                let message = self.expect_string()?;
                self.expect_newline()?;
                Ok(Action::Abort { message })
            }
            "if" => self.parse_if(),
            other => Err(self.error(format!("unexpected keyword '{other}'"))),
        }
    }

    fn parse_if(&mut self) -> EngineResult<Action> {
        self.expect_keyword("if")?;
        self.expect_keyword("screen")?;
        self.expect_keyword("shows")?;
        let condition = self.expect_string()?;
        self.expect_newline()?;

        let then_actions = self.parse_actions(&["else", "end"])?;

        self.skip_blank();
        let else_actions = if self.at_keyword("else") {
            self.advance();
            self.expect_newline()?;
            Some(self.parse_actions(&["end"])?)
        } else {
            None
        };

        self.skip_blank();
        self.expect_keyword("end")?;
        self.expect_newline()?;

        Ok(Action::IfScreenShows {
            condition,
            then_actions,
            else_actions,
        })
    }

    // ── Token stream helpers ─────────────────────────────────────────────

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    /// Consumes newline and indent tokens between productions.
    fn skip_blank(&mut self) {
        while matches!(
            self.current().token_type,
            TokenType::Newline | TokenType::Indent
        ) {
            self.advance();
        }
    }

    /// Skips indentation only, without crossing to the next line.
    fn skip_indent(&mut self) {
        while self.current().token_type == TokenType::Indent {
            self.advance();
        }
    }

    fn at_keyword(&mut self, word: &str) -> bool {
        self.skip_indent();
        self.current().is_keyword(word)
    }

    fn expect_keyword(&mut self, word: &str) -> EngineResult<Token> {
        self.skip_indent();
        if self.current().is_keyword(word) {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected '{}', found '{}'",
                word,
                self.current().value
            )))
        }
    }

    fn expect_string(&mut self) -> EngineResult<String> {
        if self.current().token_type == TokenType::StringLiteral {
            Ok(self.advance().value)
        } else {
            Err(self.error(format!(
                "expected a quoted string, found '{}'",
                self.current().value
            )))
        }
    }

    fn expect_identifier(&mut self) -> EngineResult<String> {
        if self.current().token_type == TokenType::Identifier {
            Ok(self.advance().value)
        } else {
            Err(self.error(format!(
                "expected an identifier, found '{}'",
                self.current().value
            )))
        }
    }

    fn expect_integer(&mut self) -> EngineResult<u64> {
        if self.current().token_type == TokenType::Integer {
            let token = self.advance();
            token.value.parse::<u64>().map_err(|_| {
                self.error_at(token.line, format!("invalid integer '{}'", token.value))
            })
        } else {
            Err(self.error(format!(
                "expected an integer, found '{}'",
                self.current().value
            )))
        }
    }

    /// A value position accepts a string literal or a parameter identifier.
    fn expect_value(&mut self) -> EngineResult<(String, bool)> {
        match self.current().token_type {
            TokenType::StringLiteral => Ok((self.advance().value, false)),
            TokenType::Identifier => Ok((self.advance().value, true)),
            _ => Err(self.error(format!(
                "expected a quoted string or parameter name, found '{}'",
                self.current().value
            ))),
        }
    }

    fn expect_newline(&mut self) -> EngineResult<()> {
        match self.current().token_type {
            TokenType::Newline => {
                self.advance();
                Ok(())
            }
            TokenType::Eof => Ok(()),
            _ => Err(self.error(format!(
                "expected end of line, found '{}'",
                self.current().value
            ))),
        }
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        self.error_at(self.current().line, message)
    }

    fn error_at(&self, line: usize, message: impl Into<String>) -> EngineError {
        EngineError::Parse {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbl::lexer::tokenize;

    fn parse(source: &str) -> EngineResult<TaskDefinition> {
        Parser::new(tokenize(source).unwrap(), "test.mbl".into()).parse()
    }

    #[test]
    fn minimal_task() {
        let task = parse("task \"T\"\n step \"s\"\n  click \"Save\"\n").unwrap();
        assert_eq!(task.name, "T");
        assert_eq!(task.file_name, "test.mbl");
        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.steps[0].description, "s");
        assert_eq!(
            task.steps[0].actions,
            vec![Action::Click {
                target: "Save".into()
            }]
        );
    }

    #[test]
    fn inputs_are_ordered_and_unique() {
        let task = parse("task \"T\"\ninput customer, amount\nstep \"s\"\n").unwrap();
        assert_eq!(task.inputs, vec!["customer", "amount"]);

        let err = parse("task \"T\"\ninput a, a\nstep \"s\"\n").unwrap_err();
        assert!(err.to_string().contains("duplicate input 'a'"));
    }

    #[test]
    fn step_timeout() {
        let task = parse("task \"T\"\nstep \"s\"\n timeout 45\n click \"X\"\n").unwrap();
        assert_eq!(task.steps[0].timeout_seconds, Some(45));

        let err = parse("task \"T\"\nstep \"s\"\n timeout 0\n").unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn type_with_param_and_append() {
        let task = parse(
            "task \"T\"\ninput name\nstep \"s\"\n type name into \"Field\"\n type \"lit\" append into \"Notes\"\n",
        )
        .unwrap();
        assert_eq!(
            task.steps[0].actions[0],
            Action::Type {
                value: "name".into(),
                is_param: true,
                target: "Field".into(),
                append: false,
            }
        );
        assert_eq!(
            task.steps[0].actions[1],
            Action::Type {
                value: "lit".into(),
                is_param: false,
                target: "Notes".into(),
                append: true,
            }
        );
    }

    #[test]
    fn select_and_key_and_extract() {
        let task = parse(
            "task \"T\"\ninput c\nstep \"s\"\n select c in \"Country\"\n key Ctrl+S\n extract total from \"Total\"\n output total\n",
        )
        .unwrap();
        let actions = &task.steps[0].actions;
        assert_eq!(
            actions[0],
            Action::Select {
                value: "c".into(),
                is_param: true,
                target: "Country".into()
            }
        );
        assert_eq!(
            actions[1],
            Action::Key {
                key_combo: "Ctrl+S".into()
            }
        );
        assert_eq!(
            actions[2],
            Action::Extract {
                variable: "total".into(),
                source: "Total".into()
            }
        );
        assert_eq!(
            actions[3],
            Action::Output {
                variable: "total".into()
            }
        );
    }

    #[test]
    fn if_else_block() {
        let task = parse(
            "task \"T\"\nstep \"s\"\n if screen shows \"Dialog\"\n  click \"OK\"\n else\n  click \"Cancel\"\n end\n",
        )
        .unwrap();
        match &task.steps[0].actions[0] {
            Action::IfScreenShows {
                condition,
                then_actions,
                else_actions,
            } => {
                assert_eq!(condition, "Dialog");
                assert_eq!(then_actions.len(), 1);
                assert_eq!(else_actions.as_ref().unwrap().len(), 1);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn if_without_else() {
        let task =
            parse("task \"T\"\nstep \"s\"\n if screen shows \"D\"\n  screenshot\n end\n").unwrap();
        match &task.steps[0].actions[0] {
            Action::IfScreenShows { else_actions, .. } => assert!(else_actions.is_none()),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn missing_end_is_a_parse_error() {
        let err = parse("task \"T\"\nstep \"s\"\n if screen shows \"D\"\n  screenshot\n").unwrap_err();
        assert!(err.to_string().contains("expected 'end'"));
    }

    #[test]
    fn handlers_in_either_order() {
        let task = parse(
            "task \"T\"\nstep \"s\"\n click \"X\"\non error\n screenshot\non timeout\n abort \"t/o\"\n",
        )
        .unwrap();
        assert!(task.on_error.is_some());
        assert_eq!(
            task.on_timeout.as_ref().unwrap().actions,
            vec![Action::Abort {
                message: "t/o".into()
            }]
        );
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let err = parse(
            "task \"T\"\nstep \"s\"\non timeout\n screenshot\non timeout\n screenshot\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate 'on timeout'"));
    }

    #[test]
    fn parse_error_carries_line_number() {
        let err = parse("task \"T\"\nstep \"s\"\n click Save\n").unwrap_err();
        match err {
            EngineError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_steps_parse_but_keep_empty_list() {
        let task = parse("task \"T\"\n").unwrap();
        assert!(task.steps.is_empty());
    }

    #[test]
    fn identical_source_parses_identically() {
        let src = "task \"T\"\ninput a\nstep \"one\"\n type a into \"F\"\n key Enter\n";
        let first = parse(src).unwrap();
        let second = parse(src).unwrap();
        assert_eq!(first, second);
    }
}
