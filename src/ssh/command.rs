//! Structured remote commands rendered with shell escaping.

use std::fmt;

use shell_escape::unix::escape;

/// A command executed on a remote node through the login shell.
///
/// Every component is shell-escaped when rendered, so values such as join
/// tokens can never alter the command structure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    dir: Option<String>,
    sudo: bool,
    program: String,
    args: Vec<String>,
}

impl RemoteCommand {
    /// Creates a command running `program` without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            dir: None,
            sudo: false,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builds a command from an argument vector, as typed by a user.
    /// Returns `None` for an empty vector.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Runs the command through `sudo`.
    #[must_use]
    pub const fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Changes into `dir` before running the command.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several positional arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends `--name value`.
    #[must_use]
    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(format!("--{name}")).arg(value.to_string())
    }

    /// Appends `--name value` when `value` is present.
    #[must_use]
    pub fn optional_flag<V: fmt::Display>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(inner) => self.flag(name, inner),
            None => self,
        }
    }

    /// Renders the command for the remote shell.
    #[must_use]
    pub fn render(&self) -> String {
        let mut rendered = String::new();
        if let Some(dir) = &self.dir {
            rendered.push_str("cd ");
            rendered.push_str(&escape(dir.as_str().into()));
            rendered.push_str(" && ");
        }
        if self.sudo {
            rendered.push_str("sudo ");
        }
        rendered.push_str(&escape(self.program.as_str().into()));
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&escape(arg.as_str().into()));
        }
        rendered
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
