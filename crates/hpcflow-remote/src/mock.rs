//! Scripted in-memory remote endpoint for tests and dry runs.
//!
//! `MockRemote` keeps a file map and a table of canned command responses.
//! Responses are matched by command prefix; each prefix has a queue whose
//! last entry sticks once the earlier ones are consumed. A few commands are
//! understood natively: `sha256sum`, `mkdir -p`, `rm -f` and `hostname`.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::channel::{CommandOutput, Connector, RemoteChannel};
use crate::error::{RemoteError, RemoteResult};

/// A canned reply to a command.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return this output.
    Output(CommandOutput),
    /// Fail with a connection error.
    ConnectError(String),
    /// Sleep for the given duration, then succeed with empty output.
    Stall(Duration),
}

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    responses: Vec<(String, VecDeque<MockResponse>)>,
    history: Vec<String>,
    connects: u32,
    connect_failures: u32,
    reject_auth: bool,
    upload_failures: u32,
    corrupt_uploads: u32,
    download_failures: u32,
    corrupt_downloads: u32,
    failing_removes: bool,
}

/// Shared handle to a scripted remote endpoint.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<Mutex<MockState>>,
}

impl MockRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose channels all talk to this remote.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            remote: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a successful response with the given stdout.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.respond_with(prefix, MockResponse::Output(CommandOutput::ok(stdout)));
    }

    /// Queue a command output with an explicit exit code.
    pub fn respond_output(&self, prefix: &str, output: CommandOutput) {
        self.respond_with(prefix, MockResponse::Output(output));
    }

    /// Queue a connection error.
    pub fn respond_connect_error(&self, prefix: &str, message: &str) {
        self.respond_with(prefix, MockResponse::ConnectError(message.to_string()));
    }

    /// Queue a stall.
    pub fn stall(&self, prefix: &str, duration: Duration) {
        self.respond_with(prefix, MockResponse::Stall(duration));
    }

    /// Queue an arbitrary response for commands starting with `prefix`.
    pub fn respond_with(&self, prefix: &str, response: MockResponse) {
        let mut state = self.state();
        if let Some((_, queue)) = state.responses.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(response);
        } else {
            state
                .responses
                .push((prefix.to_string(), VecDeque::from([response])));
        }
    }

    /// Make the next `n` connection attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().connect_failures = n;
    }

    /// Reject every connection attempt with an authentication error.
    pub fn reject_auth(&self, reject: bool) {
        self.state().reject_auth = reject;
    }

    /// Interrupt the next `n` uploads half-way with a connection error.
    pub fn fail_next_uploads(&self, n: u32) {
        self.state().upload_failures = n;
    }

    /// Flip a byte in the next `n` uploaded files.
    pub fn corrupt_next_uploads(&self, n: u32) {
        self.state().corrupt_uploads = n;
    }

    /// Interrupt the next `n` downloads half-way with a connection error.
    pub fn fail_next_downloads(&self, n: u32) {
        self.state().download_failures = n;
    }

    /// Flip a byte in the local copy of the next `n` downloaded files.
    pub fn corrupt_next_downloads(&self, n: u32) {
        self.state().corrupt_downloads = n;
    }

    /// Make every remote file removal fail.
    pub fn fail_removes(&self, fail: bool) {
        self.state().failing_removes = fail;
    }

    /// Place a file on the remote.
    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.state().files.insert(path.to_string(), contents.into());
    }

    /// Read a remote file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Whether a remote file exists.
    pub fn has_file(&self, path: &str) -> bool {
        self.state().files.contains_key(path)
    }

    /// All remote file paths, sorted.
    pub fn files(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().history.clone()
    }

    /// Number of executed commands starting with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .history
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Number of connection attempts, including failed ones.
    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    fn next_response(&self, command: &str) -> Option<MockResponse> {
        let mut state = self.state();
        state.history.push(command.to_string());
        let (_, queue) = state
            .responses
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn builtin(&self, command: &str) -> CommandOutput {
        let mut state = self.state();
        if let Some(arg) = command.strip_prefix("sha256sum ") {
            let path = unquote(arg.trim());
            return match state.files.get(&path) {
                Some(bytes) => {
                    CommandOutput::ok(format!("{:x}  {}\n", Sha256::digest(bytes), path))
                }
                None => CommandOutput::failed(
                    1,
                    format!("sha256sum: {path}: No such file or directory\n"),
                ),
            };
        }
        if let Some(arg) = command.strip_prefix("rm -f ") {
            for path in arg.split_whitespace() {
                state.files.remove(&unquote(path));
            }
            return CommandOutput::ok("");
        }
        if command == "hostname" {
            return CommandOutput::ok("mock-login\n");
        }
        CommandOutput::ok("")
    }
}

fn unquote(arg: &str) -> String {
    arg.strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .unwrap_or(arg)
        .replace(r"'\''", "'")
}

/// Connector handing out channels to a [`MockRemote`].
pub struct MockConnector {
    remote: MockRemote,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> RemoteResult<Box<dyn RemoteChannel>> {
        let mut state = self.remote.state();
        state.connects += 1;
        if state.reject_auth {
            return Err(RemoteError::Auth("mock: publickey rejected".to_string()));
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RemoteError::Connect("mock: connection refused".to_string()));
        }
        Ok(Box::new(MockChannel {
            remote: self.remote.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "mock://login".to_string()
    }
}

/// One channel to a [`MockRemote`].
pub struct MockChannel {
    remote: MockRemote,
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn exec(&self, command: &str) -> RemoteResult<CommandOutput> {
        match self.remote.next_response(command) {
            Some(MockResponse::Output(output)) => Ok(output),
            Some(MockResponse::ConnectError(message)) => Err(RemoteError::Connect(message)),
            Some(MockResponse::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput::ok(""))
            }
            None => Ok(self.remote.builtin(command)),
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> RemoteResult<u64> {
        let mut bytes = tokio::fs::read(local).await?;
        let mut state = self.remote.state();
        if state.upload_failures > 0 {
            state.upload_failures -= 1;
            bytes.truncate(bytes.len() / 2);
            state.files.insert(remote.to_string(), bytes);
            return Err(RemoteError::Connect(format!(
                "mock: connection reset while uploading {remote}"
            )));
        }
        let len = bytes.len() as u64;
        if state.corrupt_uploads > 0 {
            state.corrupt_uploads -= 1;
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            }
        }
        state.files.insert(remote.to_string(), bytes);
        Ok(len)
    }

    async fn download(&self, remote: &str, local: &Path) -> RemoteResult<u64> {
        let (mut bytes, interrupted) = {
            let mut state = self.remote.state();
            let mut bytes = state
                .files
                .get(remote)
                .cloned()
                .ok_or_else(|| RemoteError::Transfer(format!("mock: no such file {remote}")))?;
            let interrupted = state.download_failures > 0;
            if interrupted {
                state.download_failures -= 1;
            } else if state.corrupt_downloads > 0 {
                state.corrupt_downloads -= 1;
                if let Some(first) = bytes.first_mut() {
                    *first ^= 0xff;
                }
            }
            (bytes, interrupted)
        };
        if interrupted {
            bytes.truncate(bytes.len() / 2);
            tokio::fs::write(local, &bytes).await?;
            return Err(RemoteError::Connect(format!(
                "mock: connection reset while downloading {remote}"
            )));
        }
        tokio::fs::write(local, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        let mut state = self.remote.state();
        let bytes = state
            .files
            .remove(from)
            .ok_or_else(|| RemoteError::Transfer(format!("mock: no such file {from}")))?;
        state.files.insert(to.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        let mut state = self.remote.state();
        if state.failing_removes {
            return Err(RemoteError::Transfer(format!(
                "mock: permission denied removing {path}"
            )));
        }
        state.files.remove(path);
        Ok(())
    }

    async fn mkdir_all(&self, path: &str) -> RemoteResult<()> {
        self.remote.state().history.push(format!("mkdir -p {path}"));
        Ok(())
    }
}
