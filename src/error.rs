use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A collaborator command ran and exited non-zero. The exit code is
    /// carried so the invoking command can propagate it as its own.
    #[error("`{command}` failed{}", exit_label(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to download base image: {message}")]
    #[diagnostic(help("check the image URL and your network connection"))]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("no IPv4 address found for VM '{name}'")]
    #[diagnostic(help(
        "the VM may still be booting, or the guest agent is not ready yet; try `labvm status`"
    ))]
    GuestUnreachable { name: String },

    #[error("ssh key error: {context}")]
    SshKey {
        context: String,
        #[source]
        source: ssh_key::Error,
    },
}

impl VmError {
    /// Process exit code for this error. Collaborator failures propagate the
    /// collaborator's own code; everything else is a plain failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::CommandFailed { code, .. } => code.unwrap_or(1),
            _ => 1,
        }
    }

    /// Trailing detail lines for a collaborator failure, if any.
    pub fn stderr_excerpt(&self) -> Option<&str> {
        match self {
            VmError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
                Some(stderr.trim())
            }
            _ => None,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with exit code {c}"),
        None => " (terminated by signal)".to_string(),
    }
}
