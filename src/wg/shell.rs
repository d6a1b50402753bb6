use std::{fmt::Display, process::Stdio};

use tokio::io::AsyncWriteExt;

use crate::error::CommandError;

const SHELL: &str = "/bin/bash";
const SECRET_VAR: &str = "wg_secret";

/// Runs shell text. Secrets are written to the child's stdin, one per line,
/// in the order the text references them.
pub trait Executor {
    async fn exec(&self, command: &str, secrets: &[String]) -> Result<String, CommandError>;

    async fn run(&self, script: &Script) -> Result<String, CommandError> {
        log::debug!("run: {}", script.command());
        self.exec(&script.render(), script.secrets()).await
    }
}

/// Single-quotes `value` for bash.
pub fn quote(value: impl Display) -> String {
    format!("'{}'", value.to_string().replace('\'', r"'\''"))
}

/// Shell text under construction. Values go through [`quote`], secrets are
/// only ever referenced through `/dev/fd` and never appear in the text.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Script {
    text: String,
    secrets: Vec<String>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("text", &self.text)
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl Script {
    pub fn new(program: &str) -> Self {
        Self {
            text: program.to_string(),
            secrets: Vec::new(),
        }
    }

    /// Quoted argument.
    pub fn arg(mut self, value: impl Display) -> Self {
        self.text.push(' ');
        self.text.push_str(&quote(value));
        self
    }

    /// Unquoted shell syntax (operators, keywords, literal flags).
    pub fn raw(mut self, text: &str) -> Self {
        self.text.push(' ');
        self.text.push_str(text);
        self
    }

    /// File argument whose content is the secret.
    pub fn secret(mut self, value: impl Display) -> Self {
        let var = format!("{SECRET_VAR}_{}", self.secrets.len());
        self.secrets.push(value.to_string());
        let reference = format!(r#" <(printf '%s\n' "${var}")"#);
        self.text.push_str(&reference);
        self
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    /// Text without the secret prologue, safe to log.
    pub fn command(&self) -> &str {
        &self.text
    }

    /// Full text: reads every secret from stdin into a shell variable, then
    /// runs the command.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for idx in 0..self.secrets.len() {
            out.push_str(&format!("IFS= read -r {SECRET_VAR}_{idx}\n"));
        }
        out.push_str(&self.text);
        out
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    async fn exec(&self, command: &str, secrets: &[String]) -> Result<String, CommandError> {
        log::trace!("exec: {command}");

        let mut child = tokio::process::Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CommandError {
                command: command.to_string(),
                stderr: err.to_string(),
                code: None,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = secrets.join("\n");
            if !input.is_empty() {
                input.push('\n');
            }
            // a command that never reads stdin closes the pipe early
            if let Err(err) = stdin.write_all(input.as_bytes()).await {
                log::debug!("stdin not consumed: {err}");
            }
        }

        let out = child.wait_with_output().await.map_err(|err| CommandError {
            command: command.to_string(),
            stderr: err.to_string(),
            code: None,
        })?;

        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if !out.status.success() && !stderr.is_empty() {
            return Err(CommandError {
                command: command.to_string(),
                stderr,
                code: out.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::{Arc, Mutex};

    use crate::error::CommandError;

    use super::Executor;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Call {
        pub command: String,
        pub secrets: Vec<String>,
    }

    /// Answers commands by prefix and records every call.
    #[derive(Debug, Default, Clone)]
    pub struct FakeExecutor {
        replies: Arc<Mutex<Vec<(String, Result<String, CommandError>)>>>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl FakeExecutor {
        pub fn reply(self, prefix: &str, out: &str) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push((prefix.to_string(), Ok(out.to_string())));
            self
        }

        pub fn fail(self, prefix: &str, stderr: &str) -> Self {
            self.replies.lock().unwrap().push((
                prefix.to_string(),
                Err(CommandError {
                    command: prefix.to_string(),
                    stderr: stderr.to_string(),
                    code: Some(1),
                }),
            ));
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for FakeExecutor {
        async fn exec(&self, command: &str, secrets: &[String]) -> Result<String, CommandError> {
            self.calls.lock().unwrap().push(Call {
                command: command.to_string(),
                secrets: secrets.to_vec(),
            });

            let body = command
                .lines()
                .filter(|x| !x.starts_with("IFS= read"))
                .collect::<Vec<_>>()
                .join("\n");

            self.replies
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| body.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Ok(String::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("wg0"), "'wg0'");
        assert_eq!(quote("a'b"), r"'a'\''b'");
        assert_eq!(quote("$(rm -rf /); `x`"), "'$(rm -rf /); `x`'");
    }

    #[test]
    fn test_secret_never_in_text() {
        let script = Script::new("wg set")
            .arg("wg0")
            .raw("private-key")
            .secret("c2VjcmV0")
            .raw("peer")
            .arg("pk")
            .raw("preshared-key")
            .secret("cHNr");

        assert_eq!(script.secrets(), ["c2VjcmV0", "cHNr"]);
        assert!(!script.render().contains("c2VjcmV0"));
        assert!(!script.render().contains("cHNr"));
        assert_eq!(
            script.render(),
            "IFS= read -r wg_secret_0\nIFS= read -r wg_secret_1\n\
             wg set 'wg0' private-key <(printf '%s\\n' \"$wg_secret_0\") \
             peer 'pk' preshared-key <(printf '%s\\n' \"$wg_secret_1\")"
        );
        assert_eq!(
            script.command(),
            "wg set 'wg0' private-key <(printf '%s\\n' \"$wg_secret_0\") \
             peer 'pk' preshared-key <(printf '%s\\n' \"$wg_secret_1\")"
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let script = Script::new("wg pubkey").raw("<").secret("c2VjcmV0");
        let text = format!("{script:?}");

        assert!(!text.contains("c2VjcmV0"));
        assert!(text.contains("wg pubkey"));
        assert!(text.contains("secrets: 1"));
    }

    #[tokio::test]
    async fn test_shell_executor() {
        let shell = ShellExecutor;

        let script = Script::new("cat")
            .raw("<")
            .secret("first")
            .raw("&& echo")
            .arg("it's");
        assert_eq!(shell.run(&script).await.unwrap(), "first\nit's");

        // silent failure reads as empty output
        assert_eq!(shell.exec("false", &[]).await.unwrap(), "");

        let err = shell.exec("echo oops >&2; exit 3", &[]).await.unwrap_err();
        assert_eq!(err.stderr, "oops");
        assert_eq!(err.code, Some(3));
    }
}
