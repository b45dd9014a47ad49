//! Command-line tokenization for extension launch
//!
//! Splits a single command-line string into an argument vector using a small
//! subset of shell quoting rules:
//!
//! - Space and newline separate arguments.
//! - A backslash outside quotes escapes space, newline, backslash, `'` and `"`.
//!   Any other escaped character keeps its backslash.
//! - Single quotes take everything literally up to the closing quote.
//! - Double quotes allow `\\` and `\"`; other escapes keep their backslash.
//!
//! Malformed input never fails. An unterminated quote or trailing escape is
//! reported as a [`TokenizeWarning`] and the partial argument is kept.

use std::fmt;
use tracing::warn;

/// Non-fatal problem found while tokenizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeWarning {
    /// Input ended inside a single- or double-quoted section
    UnterminatedQuote,
    /// Input ended right after a backslash
    IncompleteEscape,
}

impl fmt::Display for TokenizeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizeWarning::UnterminatedQuote => {
                f.write_str("Unterminated quote at the end of the command line")
            }
            TokenizeWarning::IncompleteEscape => {
                f.write_str("Incomplete escape at the end of the command line")
            }
        }
    }
}

/// Result of tokenizing one command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokenized {
    /// Arguments in order, `args[0]` being the executable
    pub args: Vec<String>,
    /// Warnings produced along the way
    pub warnings: Vec<TokenizeWarning>,
}

impl Tokenized {
    /// Log every warning against the given extension name and return the arguments
    pub fn into_args_logged(self, name: &str) -> Vec<String> {
        for warning in &self.warnings {
            warn!("Extension '{}': {}", name, warning);
        }
        self.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    Within,
    Escape,
    SingleQuote,
    DoubleQuote,
    DoubleEscape,
}

fn is_separator(c: char) -> bool {
    c == ' ' || c == '\n'
}

/// Tokenize a command line into arguments and warnings
pub fn tokenize(cmdline: &str) -> Tokenized {
    let mut args = Vec::new();
    let mut warnings = Vec::new();
    let mut element = String::new();
    let mut state = State::Outside;

    for c in cmdline.chars() {
        // `Outside` hands a non-separator to `Within` without consuming it
        if state == State::Outside {
            if is_separator(c) {
                continue;
            }
            state = State::Within;
        }

        state = match state {
            State::Outside => unreachable!("outside state is resolved above"),
            State::Within => match c {
                '\\' => State::Escape,
                '\'' => State::SingleQuote,
                '"' => State::DoubleQuote,
                c if is_separator(c) => {
                    args.push(std::mem::take(&mut element));
                    State::Outside
                }
                c => {
                    element.push(c);
                    State::Within
                }
            },
            State::Escape => {
                if !matches!(c, ' ' | '\n' | '\\' | '\'' | '"') {
                    element.push('\\');
                }
                element.push(c);
                State::Within
            }
            State::SingleQuote => {
                if c == '\'' {
                    State::Within
                } else {
                    element.push(c);
                    State::SingleQuote
                }
            }
            State::DoubleQuote => match c {
                '"' => State::Within,
                '\\' => State::DoubleEscape,
                c => {
                    element.push(c);
                    State::DoubleQuote
                }
            },
            State::DoubleEscape => {
                if !matches!(c, '\\' | '"') {
                    element.push('\\');
                }
                element.push(c);
                State::DoubleQuote
            }
        };
    }

    match state {
        State::Outside => {}
        State::Within => {
            if !element.is_empty() {
                args.push(element);
            }
        }
        State::SingleQuote | State::DoubleQuote => {
            warnings.push(TokenizeWarning::UnterminatedQuote);
            args.push(element);
        }
        State::Escape | State::DoubleEscape => {
            warnings.push(TokenizeWarning::IncompleteEscape);
            args.push(element);
        }
    }

    Tokenized { args, warnings }
}
