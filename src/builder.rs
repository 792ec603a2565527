use std::fmt::Debug;
use std::process::Command;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::core::{Blake3Hasher, Hash32};

/// Paths handed to an [`Action`] when it runs.
///
/// File and directory nodes contribute their path, aliases and values their
/// name.
#[derive(Debug)]
pub struct ActionContext<'a> {
    pub targets: &'a [Utf8PathBuf],
    pub sources: &'a [Utf8PathBuf],
}

type ActionFn = dyn Fn(&ActionContext) -> anyhow::Result<i32> + Send + Sync;

/// A shell command template.
///
/// `$TARGETS`, `$TARGET`, `$SOURCES` and `$SOURCE` are replaced with the
/// quoted paths of the task before the command is handed to the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAction {
    pub template: String,
}

/// A Rust closure. The fingerprint stands in for the closure body in
/// signatures, change it whenever the closure's behavior changes.
#[derive(Clone)]
pub struct FunctionAction {
    pub fingerprint: String,
    func: Arc<ActionFn>,
}

impl Debug for FunctionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionAction")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// The work that produces the targets of a builder invocation.
#[derive(Debug, Clone)]
pub enum Action {
    Command(CommandAction),
    Function(FunctionAction),
}

impl Action {
    pub fn command(template: impl Into<String>) -> Self {
        Action::Command(CommandAction {
            template: template.into(),
        })
    }

    pub fn function<F>(fingerprint: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ActionContext) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        Action::Function(FunctionAction {
            fingerprint: fingerprint.into(),
            func: Arc::new(func),
        })
    }

    /// Runs the action, returning its exit status. `0` means success.
    pub fn execute(&self, ctx: &ActionContext) -> anyhow::Result<i32> {
        match self {
            Action::Command(cmd) => cmd.execute(ctx),
            Action::Function(func) => (func.func)(ctx),
        }
    }

    /// Two actions with the same signature are considered equivalent.
    pub fn signature(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        match self {
            Action::Command(cmd) => hasher.field("command").field(&cmd.template),
            Action::Function(func) => hasher.field("function").field(&func.fingerprint),
        };
        hasher.finish32()
    }

    pub fn describe(&self) -> String {
        match self {
            Action::Command(cmd) => cmd.template.clone(),
            Action::Function(func) => format!("{}(...)", func.fingerprint),
        }
    }

    /// The description of one concrete invocation, as it would be logged.
    pub fn describe_for(&self, ctx: &ActionContext) -> String {
        match self {
            Action::Command(cmd) => cmd.expand(ctx),
            Action::Function(func) => format!(
                "{}({})",
                func.fingerprint,
                ctx.targets
                    .iter()
                    .map(|path| path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl CommandAction {
    pub fn expand(&self, ctx: &ActionContext) -> String {
        let join = |paths: &[Utf8PathBuf]| {
            paths
                .iter()
                .map(|p| quote(p))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let first = |paths: &[Utf8PathBuf]| paths.first().map(|p| quote(p)).unwrap_or_default();

        // Longer names first, `$TARGET` is a prefix of `$TARGETS`.
        self.template
            .replace("$TARGETS", &join(ctx.targets))
            .replace("$TARGET", &first(ctx.targets))
            .replace("$SOURCES", &join(ctx.sources))
            .replace("$SOURCE", &first(ctx.sources))
    }

    fn execute(&self, ctx: &ActionContext) -> anyhow::Result<i32> {
        let line = self.expand(ctx);
        info!("{line}");

        let status = shell(&line).status()?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(unix)]
fn shell(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

fn quote(path: &Utf8Path) -> String {
    let text = path.as_str();
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+,:@%=".contains(c));

    if plain || cfg!(windows) {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// What a [`Scanner`] sees of the node it scans.
#[derive(Debug)]
pub struct ScanContext<'a> {
    /// Targets of the builder invocation.
    pub targets: &'a [Utf8PathBuf],
    /// Sources of the builder invocation. Already up to date when scanned.
    pub sources: &'a [Utf8PathBuf],
}

/// Discovers implicit dependencies of a builder invocation, for example the
/// headers included by a C source file.
///
/// Returned paths become `File` nodes. A scan replaces the previous implicit
/// dependencies of the targets entirely.
pub trait Scanner: Send + Sync {
    fn scan(&self, ctx: &ScanContext) -> anyhow::Result<Vec<Utf8PathBuf>>;
}

/// Closure adapter for [`Scanner`].
pub struct FnScanner<F>(pub F);

impl<F> Scanner for FnScanner<F>
where
    F: Fn(&ScanContext) -> anyhow::Result<Vec<Utf8PathBuf>> + Send + Sync,
{
    fn scan(&self, ctx: &ScanContext) -> anyhow::Result<Vec<Utf8PathBuf>> {
        (self.0)(ctx)
    }
}

/// Binds an [`Action`] to the shape of its invocations.
#[derive(Clone)]
pub struct Builder {
    pub name: String,
    pub action: Arc<Action>,
    pub scanner: Option<Arc<dyn Scanner>>,
    /// Allow repeated invocations for the same targets to append sources.
    pub multi: bool,
}

impl Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("scanner", &self.scanner.is_some())
            .field("multi", &self.multi)
            .finish()
    }
}

impl Builder {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
            scanner: None,
            multi: false,
        }
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }
}
