use crate::context::DeploymentContext;
use crate::error::IslectlError;
use crate::shell::{shell_join, shell_quote};
use crate::ssh::RemoteSession;
use dialoguer::console::Term;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const SUDO_PROMPT: &str = "[sudo] password for";
const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: Vec<String>,
}

impl ExecutionResult {
    pub fn text(&self) -> String {
        self.output.concat()
    }

    pub fn last_non_empty_line(&self) -> Option<String> {
        self.text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(ToString::to_string)
    }
}

pub trait CommandRunner {
    fn run(&self, argv: &[String]) -> Result<ExecutionResult, IslectlError>;
}

/// Where live command output is mirrored. JSON mode keeps stdout for the
/// envelope, so the mirror moves to stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Echo {
    #[default]
    Stdout,
    Stderr,
}

impl Echo {
    pub fn for_json(json: bool) -> Self {
        if json {
            Echo::Stderr
        } else {
            Echo::Stdout
        }
    }

    fn writer(self) -> Box<dyn Write> {
        match self {
            Echo::Stdout => Box::new(io::stdout()),
            Echo::Stderr => Box::new(io::stderr()),
        }
    }

    fn term(self) -> Term {
        match self {
            Echo::Stdout => Term::stdout(),
            Echo::Stderr => Term::stderr(),
        }
    }
}

pub fn runner_for(ctx: &DeploymentContext, echo: Echo) -> Box<dyn CommandRunner + '_> {
    if ctx.is_remote() {
        Box::new(RemoteRunner::new(ctx, echo))
    } else {
        Box::new(LocalRunner::new(ctx, echo))
    }
}

pub fn render_command(argv: &[String]) -> String {
    shell_join(argv)
}

pub struct LocalRunner {
    project_dir: Option<PathBuf>,
    echo: Echo,
}

impl LocalRunner {
    pub fn new(ctx: &DeploymentContext, echo: Echo) -> Self {
        let dir = if ctx.project_dir.trim().is_empty() {
            None
        } else {
            Some(ctx.project_dir())
        };
        Self::in_dir(dir, echo)
    }

    pub fn in_dir(dir: Option<&Path>, echo: Echo) -> Self {
        Self {
            project_dir: dir.map(Path::to_path_buf),
            echo,
        }
    }
}

impl CommandRunner for LocalRunner {
    fn run(&self, argv: &[String]) -> Result<ExecutionResult, IslectlError> {
        let (program, args) = split_argv(argv)?;
        let command = render_command(argv);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.project_dir {
            cmd.current_dir(dir);
        }
        tracing::debug!(cmd = %command, "running local command");
        let mut child = cmd.spawn().map_err(|err| IslectlError::Command {
            command: command.clone(),
            cause: format!("error starting command: {err}"),
            output: Vec::new(),
        })?;

        let output = match child.stdout.take() {
            Some(stdout) => pump_lines(BufReader::new(stdout), &mut self.echo.writer()),
            None => Vec::new(),
        };

        let status = child.wait().map_err(|err| IslectlError::Command {
            command: command.clone(),
            cause: format!("error waiting for command: {err}"),
            output: output.clone(),
        })?;
        if !status.success() {
            return Err(IslectlError::Command {
                command,
                cause: status.to_string(),
                output,
            });
        }
        Ok(ExecutionResult { output })
    }
}

/// Echoes each line as it arrives and keeps a trimmed copy. Bytes that are
/// not UTF-8 are echoed untouched and captured lossily. After a read error the
/// rest of the stream is drained so the writer never sees a closed pipe.
pub fn pump_lines<R: BufRead, E: Write>(mut reader: R, echo: &mut E) -> Vec<String> {
    let mut output = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if !line.ends_with(b"\n") {
                    line.push(b'\n');
                }
                if let Err(err) = echo.write_all(&line).and_then(|_| echo.flush()) {
                    tracing::warn!(err = %err, "error echoing command output");
                }
                output.push(String::from_utf8_lossy(&line).trim().to_string());
            }
            Err(err) => {
                tracing::error!(err = %err, "error reading stdout");
                if let Err(err) = io::copy(&mut reader, &mut io::sink()) {
                    tracing::error!(err = %err, "error draining stdout");
                }
                break;
            }
        }
    }
    output
}

pub struct RemoteRunner<'a> {
    ctx: &'a DeploymentContext,
    echo: Echo,
}

impl<'a> RemoteRunner<'a> {
    pub fn new(ctx: &'a DeploymentContext, echo: Echo) -> Self {
        Self { ctx, echo }
    }
}

impl CommandRunner for RemoteRunner<'_> {
    fn run(&self, argv: &[String]) -> Result<ExecutionResult, IslectlError> {
        let session = RemoteSession::open(self.ctx)?;
        run_on_session(self.ctx, &session, argv, self.echo)
    }
}

pub fn remote_command_string(ctx: &DeploymentContext, argv: &[String]) -> Result<String, IslectlError> {
    let (program, args) = split_argv(argv)?;
    let mut command = format!("cd {} &&", shell_quote(&ctx.project_dir));
    if ctx.sudo {
        command.push_str(" sudo");
    }
    command.push(' ');
    command.push_str(&shell_quote(program));
    if !args.is_empty() {
        command.push(' ');
        command.push_str(&shell_join(args));
    }
    Ok(command)
}

pub fn run_on_session(
    ctx: &DeploymentContext,
    session: &RemoteSession,
    argv: &[String],
    echo: Echo,
) -> Result<ExecutionResult, IslectlError> {
    let command = remote_command_string(ctx, argv)?;
    tracing::info!(host = %session.host(), cmd = %command, "running remote command");

    let remote_err = |cause: String, output: Vec<String>| IslectlError::Command {
        command: command.clone(),
        cause,
        output,
    };

    let mut channel = session
        .pty_channel()
        .map_err(|err| remote_err(format!("error requesting pseudo terminal: {err}"), Vec::new()))?;
    channel
        .exec(&command)
        .map_err(|err| remote_err(format!("error starting remote command: {err}"), Vec::new()))?;

    let output = {
        let mut reader = channel.stream(0);
        let mut stdin = channel.stream(0);
        pump_chunks(&mut reader, &mut stdin, &mut echo.writer(), || read_masked_password(echo))?
    };

    channel
        .send_eof()
        .map_err(|err| remote_err(format!("error closing remote stdin: {err}"), output.clone()))?;
    channel
        .wait_close()
        .map_err(|err| remote_err(format!("error waiting for remote command: {err}"), output.clone()))?;
    let status = channel
        .exit_status()
        .map_err(|err| remote_err(format!("error reading exit status: {err}"), output.clone()))?;
    if status != 0 {
        return Err(remote_err(format!("exit status {status}"), output));
    }
    Ok(ExecutionResult { output })
}

fn read_masked_password(echo: Echo) -> Result<String, IslectlError> {
    Ok(echo.term().read_secure_line()?)
}

/// Reads the merged remote stream in fixed-size chunks, echoing and keeping
/// each decoded chunk in arrival order. A multi-byte character split across
/// reads is held back until it is complete. The first sudo password prompt
/// seen is answered with a password read from the operator.
pub fn pump_chunks<R, W, E, P>(
    reader: &mut R,
    stdin: &mut W,
    echo: &mut E,
    mut read_password: P,
) -> Result<Vec<String>, IslectlError>
where
    R: Read,
    W: Write,
    E: Write,
    P: FnMut() -> Result<String, IslectlError>,
{
    let mut output = Vec::new();
    let mut detector = PromptDetector::new(SUDO_PROMPT);
    let mut decoder = Utf8Carry::default();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(err = %err, "error reading remote output");
                break;
            }
        };
        let bytes = &buf[..read];
        echo.write_all(bytes)?;
        echo.flush()?;
        let chunk = decoder.decode(bytes);
        if chunk.is_empty() {
            continue;
        }
        let prompted = detector.feed(&chunk);
        output.push(chunk);
        if prompted {
            match read_password() {
                Ok(password) => {
                    if let Err(err) = writeln!(stdin, "{password}").and_then(|_| stdin.flush()) {
                        tracing::error!(err = %err, "error writing password to stdin");
                    }
                }
                Err(err) => tracing::error!(err = %err, "error reading password"),
            }
        }
    }
    if let Some(rest) = decoder.finish() {
        output.push(rest);
    }
    Ok(output)
}

/// Incremental UTF-8 decoding over arbitrary read boundaries.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        text
    }

    /// Whatever is still held when the stream ends is a truncated character.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Substring detection that survives the marker being split across chunks.
/// Fires at most once.
pub struct PromptDetector {
    marker: &'static str,
    window: String,
    fired: bool,
}

impl PromptDetector {
    pub fn new(marker: &'static str) -> Self {
        Self {
            marker,
            window: String::new(),
            fired: false,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> bool {
        if self.fired {
            return false;
        }
        self.window.push_str(chunk);
        if self.window.contains(self.marker) {
            self.fired = true;
            self.window.clear();
            return true;
        }
        let keep = self.marker.len().saturating_sub(1);
        if self.window.len() > keep {
            let mut cut = self.window.len() - keep;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }
        false
    }
}

fn split_argv(argv: &[String]) -> Result<(&String, &[String]), IslectlError> {
    argv.split_first()
        .ok_or_else(|| IslectlError::Config("no command given to run".to_string()))
}
