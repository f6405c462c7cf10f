//! littlelang Error Types
//!
//! Every failure is fatal to the compilation that raised it: there is no
//! warning tier and no partial output.

use thiserror::Error;

use crate::x64::registers::Reg64;

/// Compilation, emission and execution errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Cannot find variable name: {name}")]
    UnknownVariable { name: String },

    #[error("Unresolved external symbol: {name}")]
    UnresolvedSymbol { name: String },

    #[error("Too many arguments in call to {function}: {count} (max 4)")]
    TooManyArguments { function: String, count: usize },

    #[error("Function defined more than once: {name}")]
    DuplicateFunction { name: String },

    #[error("No function named {name} in object")]
    MissingEntryPoint { name: String },

    #[error("Division by {register} is not encodable: rax and rdx are fixed operands of idiv")]
    InvalidDivisor { register: Reg64 },

    #[error("Jump handle is not pending in this buffer")]
    UnknownJump,

    #[error("Jump placeholder at offset {location} was already overwritten")]
    JumpAlreadyResolved { location: usize },

    #[error("{count} jump(s) still pending")]
    UnresolvedJumps { count: usize },

    #[error("String {text:?} is addressed by a host pointer and cannot be relocated")]
    AbsoluteStringReference { text: String },

    #[error("String {text:?} contains an interior NUL byte")]
    InteriorNul { text: String },

    #[error("Displacement does not fit in 32 bits")]
    DisplacementOutOfRange,

    #[error("Executable memory error: {message}")]
    ExecutableMemory { message: String },

    #[error("In-process execution requires an x86-64 Unix host")]
    UnsupportedHost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for littlelang operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Render the error, quoting the offending source line for parse errors
    pub fn format_with_source(&self, source: &str) -> String {
        let mut output = format!("error: {}\n", self);

        if let Error::Parse { line, column, .. } = self {
            if let Some(line_content) = source.lines().nth(line.saturating_sub(1)) {
                let width = line.to_string().len();
                output.push_str(&format!("{:>width$} |\n", "", width = width));
                output.push_str(&format!("{:>width$} | {}\n", line, line_content, width = width));
                output.push_str(&format!(
                    "{:>width$} | {:>start$}^\n",
                    "",
                    "",
                    width = width,
                    start = column.saturating_sub(1),
                ));
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_variable_message() {
        let err = Error::UnknownVariable {
            name: "counter".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot find variable name: counter");
    }

    #[test]
    fn test_format_with_source_points_at_column() {
        let err = Error::Parse {
            line: 2,
            column: 5,
            message: "expected ;".to_string(),
        };
        let formatted = err.format_with_source("int64 a;\na = 1\n");
        assert!(formatted.starts_with("error: Parse error at 2:5: expected ;"));
        assert!(formatted.contains("2 | a = 1"));
        assert!(formatted.contains("  |     ^"));
    }

    #[test]
    fn test_format_without_source_context() {
        let err = Error::UnknownJump;
        assert_eq!(
            err.format_with_source(""),
            "error: Jump handle is not pending in this buffer\n"
        );
    }
}
