//! Command execution
//!
//! Every external program the installer touches goes through a
//! [`CommandRunner`]. Workers never call `std::process::Command` directly, so
//! the same pipeline can run against the real system, as a dry-run preview,
//! or against canned output in tests.
//!
//! - [`SystemRunner`]: spawns the program in its own process group, registers
//!   it with the [`ChildRegistry`], elevates privileged calls when not root.
//! - [`DryRunRunner`]: queries run for real, mutations are logged and skipped.
//! - [`ScriptedRunner`]: fully offline, answers from programmed responses.

use crate::error::{InstallError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::collections::HashSet;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Invocation / Output
// ============================================================================

/// How the caller consumes a command's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Wait for exit, then hand back everything at once
    #[default]
    Blocking,
    /// Forward each stdout line while the program runs (package installs)
    Streaming,
}

/// A single external program call
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed
    pub stdin: Option<String>,
    /// Needs root; wrapped in the privilege wrapper when not already root
    pub privileged: bool,
    /// Changes disk or target state; skipped in dry-run
    pub mutating: bool,
    pub mode: RunMode,
}

impl Invocation {
    /// Read-only call that any user may make (`lsblk`)
    pub fn query(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            privileged: false,
            mutating: false,
            mode: RunMode::Blocking,
        }
    }

    /// Privileged call that changes state (`parted`, `mkfs`, `mount`)
    pub fn mutation(program: impl Into<String>) -> Self {
        Self {
            privileged: true,
            mutating: true,
            ..Self::query(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.mode = RunMode::Streaming;
        self
    }

    /// Program and arguments as a single shell-like string for logs.
    /// Stdin is never included since it may carry passwords.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command_line())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("privileged", &self.privileged)
            .field("mutating", &self.mutating)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Captured result of an invocation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the child was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into `InstallError::CommandFailed`
    pub fn ensure_success(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(InstallError::command_failed(
                invocation.command_line(),
                self.exit_code,
                self.stderr,
            ))
        }
    }
}

// ============================================================================
// Runner trait
// ============================================================================

/// Fallback locations for tools that live in sbin, which is often missing
/// from an unprivileged user's PATH
pub const SBIN_DIRS: &[&str] = &["/usr/sbin", "/sbin"];

/// Executes invocations and answers the few host questions workers need.
pub trait CommandRunner: Send + Sync {
    /// Run the invocation, calling `on_line` for each stdout line when the
    /// invocation is in streaming mode.
    fn execute(&self, invocation: &Invocation, on_line: &mut dyn FnMut(&str))
    -> Result<CommandOutput>;

    /// Blocking run with no line callback
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.execute(invocation, &mut |_| {})
    }

    /// Run and fail on non-zero exit
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.run(invocation)?.ensure_success(invocation)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Find `name` on PATH, then in the sbin directories
    fn locate_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok().or_else(|| {
            SBIN_DIRS
                .iter()
                .map(|dir| Path::new(dir).join(name))
                .find(|candidate| candidate.is_file())
        })
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// True when mutations are not really applied (dry-run)
    fn is_simulated(&self) -> bool {
        false
    }
}

// ============================================================================
// SystemRunner
// ============================================================================

/// Runs programs on the host.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    /// Prefix for privileged invocations when not running as root
    privilege_wrapper: Option<String>,
}

impl SystemRunner {
    pub fn new(privilege_wrapper: Option<String>) -> Self {
        Self { privilege_wrapper }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let wrapper = self
            .privilege_wrapper
            .as_deref()
            .filter(|_| invocation.privileged && !nix::unistd::geteuid().is_root());

        let mut cmd = match wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(&invocation.program);
                cmd
            }
            None => Command::new(&invocation.program),
        };
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        cmd
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Some("sudo".to_string()))
    }
}

impl CommandRunner for SystemRunner {
    fn execute(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        debug!(command = %invocation.command_line(), "exec");

        let mut child = self
            .build_command(invocation)
            .spawn()
            .map_err(|source| InstallError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        // stdin is fed from its own thread while stdout drains, so input
        // larger than the pipe buffer can't deadlock against a child like tee
        let stdin_writer = match (&invocation.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.clone();
                Some(std::thread::spawn(move || stdin.write_all(input.as_bytes())))
            }
            _ => None,
        };

        // stderr is drained on its own thread so a chatty child can't block on a full pipe
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let mut stdout = String::new();
        if let Some(pipe) = child.stdout.take() {
            for line in BufReader::new(pipe).lines().map_while(std::io::Result::ok) {
                if invocation.mode == RunMode::Streaming {
                    on_line(&line);
                }
                stdout.push_str(&line);
                stdout.push('\n');
            }
        }

        if let Some(handle) = stdin_writer {
            match handle.join() {
                Ok(Err(e)) => warn!("{}: could not write stdin: {}", invocation.program_name(), e),
                Err(_) => warn!("{}: stdin writer panicked", invocation.program_name()),
                Ok(Ok(())) => {}
            }
        }

        let status = child.wait();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }
        let status = status?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            debug!(
                command = %invocation.command_line(),
                code = ?status.code(),
                "non-zero exit"
            );
        }
        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

// ============================================================================
// DryRunRunner
// ============================================================================

/// Preview runner: queries are answered by the wrapped runner, mutations are
/// logged, recorded and reported as successful.
pub struct DryRunRunner {
    inner: Arc<dyn CommandRunner>,
    skipped: Mutex<Vec<Invocation>>,
}

impl DryRunRunner {
    pub fn new(inner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inner,
            skipped: Mutex::new(Vec::new()),
        }
    }

    /// Mutations that would have run, in order
    pub fn skipped(&self) -> Vec<Invocation> {
        self.skipped.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl CommandRunner for DryRunRunner {
    fn execute(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        if !invocation.mutating {
            return self.inner.execute(invocation, on_line);
        }
        info!("[dry-run] would run: {}", invocation.command_line());
        if let Ok(mut skipped) = self.skipped.lock() {
            skipped.push(invocation.clone());
        }
        Ok(CommandOutput::ok(""))
    }

    /// Device nodes never appear in a preview; pretend they did
    fn path_exists(&self, path: &Path) -> bool {
        path.starts_with("/dev") || self.inner.path_exists(path)
    }

    fn locate_program(&self, name: &str) -> Option<PathBuf> {
        self.inner
            .locate_program(name)
            .or_else(|| Some(PathBuf::from(name)))
    }

    fn sleep(&self, _duration: Duration) {}

    fn is_simulated(&self) -> bool {
        true
    }
}

// ============================================================================
// ScriptedRunner
// ============================================================================

#[derive(Debug, Clone)]
struct Rule {
    program: String,
    pattern: Vec<String>,
    output: CommandOutput,
    once: bool,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        invocation.program_name() == self.program
            && (self.pattern.is_empty()
                || invocation
                    .args
                    .windows(self.pattern.len())
                    .any(|window| window == self.pattern.as_slice()))
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    calls: Vec<Invocation>,
    existing: HashSet<PathBuf>,
    missing: HashSet<PathBuf>,
    missing_programs: HashSet<String>,
    slept: Duration,
}

/// Offline runner answering from programmed responses.
///
/// A rule matches on the program's file name plus a contiguous run of
/// arguments. One-shot rules are consulted first, in the order they were
/// added, and are consumed when used; among persistent rules the most
/// recently added match wins. Unmatched invocations succeed with empty
/// output. Paths under `/dev` exist unless marked missing.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_rule(&self, program: &str, pattern: &[&str], output: CommandOutput, once: bool) {
        if let Ok(mut script) = self.script.lock() {
            script.rules.push(Rule {
                program: program.to_string(),
                pattern: pattern.iter().map(|s| s.to_string()).collect(),
                output,
                once,
            });
        }
    }

    /// Persistent successful response
    pub fn respond(&self, program: &str, pattern: &[&str], stdout: &str) -> &Self {
        self.add_rule(program, pattern, CommandOutput::ok(stdout), false);
        self
    }

    /// Successful response used for the next matching call only
    pub fn respond_once(&self, program: &str, pattern: &[&str], stdout: &str) -> &Self {
        self.add_rule(program, pattern, CommandOutput::ok(stdout), true);
        self
    }

    /// Persistent failure
    pub fn fail(&self, program: &str, pattern: &[&str], exit_code: i32, stderr: &str) -> &Self {
        self.add_rule(program, pattern, CommandOutput::failed(exit_code, stderr), false);
        self
    }

    pub fn add_path(&self, path: impl Into<PathBuf>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.existing.insert(path.into());
        }
        self
    }

    pub fn remove_path(&self, path: impl Into<PathBuf>) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.missing.insert(path.into());
        }
        self
    }

    pub fn remove_program(&self, name: &str) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.missing_programs.insert(name.to_string());
        }
        self
    }

    /// Every invocation seen, in order
    pub fn calls(&self) -> Vec<Invocation> {
        self.script.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Command lines of every invocation, in order
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }

    /// Command lines of mutating invocations only
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|inv| inv.mutating)
            .map(Invocation::command_line)
            .collect()
    }

    /// Total time workers asked to sleep
    pub fn slept(&self) -> Duration {
        self.script.lock().map(|s| s.slept).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let output = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| InstallError::worker("scripted runner lock poisoned"))?;
            script.calls.push(invocation.clone());

            let once = script
                .rules
                .iter()
                .position(|rule| rule.once && rule.matches(invocation));
            match once {
                Some(index) => script.rules.remove(index).output,
                None => script
                    .rules
                    .iter()
                    .rev()
                    .find(|rule| !rule.once && rule.matches(invocation))
                    .map(|rule| rule.output.clone())
                    .unwrap_or_else(|| CommandOutput::ok("")),
            }
        };

        if invocation.mode == RunMode::Streaming {
            output.stdout.lines().for_each(|line| on_line(line));
        }
        Ok(output)
    }

    fn path_exists(&self, path: &Path) -> bool {
        let Ok(script) = self.script.lock() else {
            return false;
        };
        if script.missing.contains(path) {
            return false;
        }
        script.existing.contains(path) || path.starts_with("/dev")
    }

    fn locate_program(&self, name: &str) -> Option<PathBuf> {
        let script = self.script.lock().ok()?;
        if script.missing_programs.contains(name) {
            None
        } else {
            Some(Path::new("/usr/bin").join(name))
        }
    }

    fn sleep(&self, duration: Duration) {
        if let Ok(mut script) = self.script.lock() {
            script.slept += duration;
        }
    }
}
