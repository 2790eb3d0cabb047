//! Interpreter command lines built from a shell executor's config string.

use std::path::PathBuf;

use chatterm_pty::{command_flag, default_interpreter, is_known_shell, resolve_executable_path};
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("config cannot be parsed as tokens: {0}")]
    InvalidBase(String),
    #[error("executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Flags understood by the shell executor. They may appear anywhere in the
/// config; everything else is passed to the interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShellOptions {
    /// `--ts-oneshot`: a new process per command line.
    pub oneshot: bool,
    /// `--ts-shell`: treat the interpreter as a system shell.
    pub force_shell: bool,
    /// `--ts-parse`: split oneshot command lines into separate arguments.
    pub parse_args: bool,
}

/// Interpreter invocation of a shell executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub options: ShellOptions,
    /// Gets the `pwd` and `/files` buttons.
    pub is_shell: bool,
}

impl ShellCommand {
    /// Parse `[--ts-oneshot] [--ts-shell] [--ts-parse] [interpreter [args...]]`.
    ///
    /// `extra` is appended to `config` before parsing. In oneshot mode, known
    /// shells and interpreters get their command flag appended unless already
    /// present.
    ///
    /// # Errors
    /// Returns error if the config is not valid shell words.
    pub fn parse(config: &str, extra: &str) -> Result<Self, CommandBuildError> {
        let joined = [config.trim(), extra.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let tokens =
            shlex::split(&joined).ok_or_else(|| CommandBuildError::InvalidBase(joined.clone()))?;

        let mut options = ShellOptions::default();
        let mut rest = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token.as_str() {
                "--ts-oneshot" => options.oneshot = true,
                "--ts-shell" => options.force_shell = true,
                "--ts-parse" => options.parse_args = true,
                _ => rest.push(token),
            }
        }

        let (program, mut args) = if rest.is_empty() {
            (default_interpreter(), Vec::new())
        } else {
            let program = rest.remove(0);
            (program, rest)
        };

        if options.oneshot {
            if let Some(flag) = command_flag(&program) {
                if !args.iter().any(|a| a == flag) {
                    args.push(flag.to_string());
                }
            }
        }

        let is_shell = options.force_shell || is_known_shell(&program);
        tracing::debug!(%program, ?args, ?options, "Parsed shell command");
        Ok(Self {
            program,
            args,
            options,
            is_shell,
        })
    }

    /// The long-lived interactive interpreter.
    #[must_use]
    pub fn interactive(&self) -> CommandParts {
        CommandParts::new(self.program.clone(), self.args.clone())
    }

    /// One process running `cmdline`.
    #[must_use]
    pub fn oneshot(&self, cmdline: &str) -> CommandParts {
        let mut args = self.args.clone();
        if self.options.parse_args {
            match shlex::split(cmdline) {
                Some(tokens) => args.extend(tokens),
                None => args.push(cmdline.to_string()),
            }
        } else {
            args.push(cmdline.to_string());
        }
        CommandParts::new(self.program.clone(), args)
    }
}
