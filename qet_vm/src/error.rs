//! Interpreter outcomes.
//!
//! Execution ends in one of three ways: success, a compile error, or a
//! runtime error. No exceptions cross the collector path.

pub use qet_compiler::CompileError;

/// A runtime failure with its call-stack context.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    /// One `[line N] in f()` entry per active frame, innermost first.
    pub trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Why an interpretation did not complete.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for InterpretError {}
