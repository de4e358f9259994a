use crate::error::AuditError;
use std::process::Command;
use tracing::{debug, error};

/// Runs an external tool and hands back its standard output.
pub trait QueryRunner {
    fn execute(&self, argv: &[String]) -> Result<String, AuditError>;
}

impl<T: QueryRunner + ?Sized> QueryRunner for &T {
    fn execute(&self, argv: &[String]) -> Result<String, AuditError> {
        (**self).execute(argv)
    }
}

/// Executes commands directly, without a shell, after resolving the program on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl QueryRunner for ProcessRunner {
    fn execute(&self, argv: &[String]) -> Result<String, AuditError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(AuditError::ExecutableNotFound(String::new()));
        };
        debug!(command = %shell_words::join(argv), "running command");

        let resolved = which::which(program).map_err(|err| {
            error!(program = %program, "executable not found on PATH: {err}");
            AuditError::ExecutableNotFound(program.clone())
        })?;

        let output = Command::new(&resolved)
            .args(args)
            .output()
            .map_err(|err| AuditError::io(format!("failed to spawn '{program}'"), err))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                program = %program,
                code = ?output.status.code(),
                stdout = %truncate_output(&stdout),
                "command failed"
            );
            return Err(AuditError::CommandFailed {
                program: program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(stdout.trim_end().to_string())
    }
}

fn truncate_output(text: &str) -> String {
    const MAX: usize = 512;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Splits a configured command prefix such as `dotnet pac` into argv words.
pub fn command_prefix(raw: &str) -> Result<Vec<String>, AuditError> {
    let words = shell_words::split(raw)
        .map_err(|err| AuditError::InvalidAuthConfig(format!("invalid command '{raw}': {err}")))?;
    if words.is_empty() {
        return Err(AuditError::ExecutableNotFound(raw.to_string()));
    }
    Ok(words)
}
