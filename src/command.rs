use crate::outcome::ExecError;
use std::fmt;

/// An immutable, non-empty argv: program followed by its arguments.
///
/// Arguments are passed to the OS as discrete elements, never through a
/// shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
}

impl CommandSpec {
    /// Build a command from an argv. Fails if the argv is empty or the program is blank.
    pub fn new<I, S>(argv: I) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            None => Err(ExecError::InvalidCommand {
                reason: "argv is empty".to_string(),
            }),
            Some(program) if program.trim().is_empty() => Err(ExecError::InvalidCommand {
                reason: "program name is blank".to_string(),
            }),
            Some(_) => Ok(Self { argv }),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The same arguments run through a different program (e.g. an elevated wrapper).
    pub fn with_program(&self, program: impl Into<String>) -> Result<Self, ExecError> {
        let mut argv = Vec::with_capacity(self.argv.len());
        argv.push(program.into());
        argv.extend(self.args().iter().cloned());
        Self::new(argv)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_splits_program_and_args() {
        let spec = CommandSpec::new(["echo", "hello", "world"]).unwrap();
        assert_eq!(spec.program(), "echo");
        assert_eq!(spec.args(), &["hello".to_string(), "world".to_string()]);
        assert_eq!(spec.args().len(), 2);
        assert_eq!(spec.to_string(), "echo hello world");
    }

    #[test]
    fn test_new_rejects_empty_argv() {
        let err = CommandSpec::new(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ExecError::InvalidCommand { .. }));
    }

    #[test]
    fn test_new_rejects_blank_program() {
        let err = CommandSpec::new(["  ", "arg"]).unwrap_err();
        assert!(err.to_string().contains("blank"));
    }

    #[test]
    fn test_program_only_has_no_args() {
        let spec = CommandSpec::new(["true"]).unwrap();
        assert!(spec.args().is_empty());
    }

    #[test]
    fn test_with_program_keeps_args() {
        let spec = CommandSpec::new(["driver_x64.exe", "find", "USB*"]).unwrap();
        let elevated = spec.with_program("driver_x64_elevate.exe").unwrap();
        assert_eq!(elevated.program(), "driver_x64_elevate.exe");
        assert_eq!(elevated.args(), spec.args());
        // original untouched
        assert_eq!(spec.program(), "driver_x64.exe");
    }
}
