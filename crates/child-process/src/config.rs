//! Spawn configuration: executable, arguments and options

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ProcessError, Result};

/// Program to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    /// Filesystem reference to the program
    Path(PathBuf),
    /// Opaque program name, looked up by the OS (e.g. through `PATH`)
    Token(String),
}

impl Executable {
    /// Resolve a command string. Absolute paths become filesystem
    /// references, anything else is handed to the OS untouched.
    pub fn resolve(command: &str) -> Self {
        let path = Path::new(command);
        if path.is_absolute() {
            Self::Path(path.to_path_buf())
        } else {
            Self::Token(command.to_string())
        }
    }

    /// Whether this executable is a filesystem reference
    pub fn is_path(&self) -> bool {
        matches!(self, Self::Path(_))
    }
}

impl AsRef<OsStr> for Executable {
    fn as_ref(&self) -> &OsStr {
        match self {
            Self::Path(path) => path.as_os_str(),
            Self::Token(token) => OsStr::new(token),
        }
    }
}

impl fmt::Display for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Token(token) => f.write_str(token),
        }
    }
}

impl From<&str> for Executable {
    fn from(command: &str) -> Self {
        Self::resolve(command)
    }
}

impl From<String> for Executable {
    fn from(command: String) -> Self {
        Self::resolve(&command)
    }
}

impl From<PathBuf> for Executable {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for Executable {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

/// Validated, ordered argument list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<String>);

impl Args {
    /// Empty argument list
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a list of arguments
    pub fn try_new<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        for (index, arg) in args.iter().enumerate() {
            if arg.contains('\0') {
                return Err(ProcessError::InvalidArgument(format!(
                    "argument {index} contains a NUL byte"
                )));
            }
        }
        Ok(Self(args))
    }

    /// Build from a dynamic value. A non-array value is treated as a single
    /// argument; every element must be a string.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut args = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            match item {
                Value::String(s) => args.push(s),
                other => {
                    return Err(ProcessError::InvalidArgument(format!(
                        "args must be all strings, argument {index} is {other}"
                    )))
                }
            }
        }
        Self::try_new(args)
    }

    /// Borrow the arguments
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the inner vector
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Conversion into a validated [`Args`] list
pub trait IntoArgs {
    /// Validate and convert
    fn into_args(self) -> Result<Args>;
}

impl IntoArgs for Args {
    fn into_args(self) -> Result<Args> {
        Ok(self)
    }
}

impl IntoArgs for &str {
    fn into_args(self) -> Result<Args> {
        Args::try_new([self])
    }
}

impl IntoArgs for String {
    fn into_args(self) -> Result<Args> {
        Args::try_new([self])
    }
}

impl IntoArgs for Vec<String> {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self)
    }
}

impl IntoArgs for Vec<&str> {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self)
    }
}

impl IntoArgs for &[&str] {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self.iter().copied())
    }
}

impl IntoArgs for &[String] {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self.iter().cloned())
    }
}

impl<const N: usize> IntoArgs for &[&str; N] {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self.iter().copied())
    }
}

impl<const N: usize> IntoArgs for [&str; N] {
    fn into_args(self) -> Result<Args> {
        Args::try_new(self)
    }
}

impl IntoArgs for Value {
    fn into_args(self) -> Result<Args> {
        Args::from_value(self)
    }
}

/// Options for spawning a child process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Working directory (None = inherit the caller's)
    pub cwd: Option<PathBuf>,
    /// Extra environment entries in `KEY=VALUE` form, applied over the
    /// inherited environment
    pub env: Vec<String>,
    /// Interleave stderr into the stdout stream
    pub merge_stderr: bool,
}

impl SpawnOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add one `KEY=VALUE` environment entry
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Add several `KEY=VALUE` environment entries
    pub fn envs<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env.extend(entries.into_iter().map(Into::into));
        self
    }

    /// Enable/disable merging stderr into stdout
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    /// Split the environment list into key/value pairs
    pub(crate) fn env_pairs(&self) -> Result<Vec<(String, String)>> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, _)) if key.is_empty() => Err(ProcessError::InvalidArgument(format!(
                    "environment entry {entry:?} has an empty key"
                ))),
                Some(_) if entry.contains('\0') => Err(ProcessError::InvalidArgument(format!(
                    "environment entry {entry:?} contains a NUL byte"
                ))),
                Some((key, value)) => Ok((key.to_string(), value.to_string())),
                None => Err(ProcessError::InvalidArgument(format!(
                    "environment entry {entry:?} is not KEY=VALUE"
                ))),
            })
            .collect()
    }
}
