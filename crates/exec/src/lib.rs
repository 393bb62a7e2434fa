//! Sandboxed execution for the code interpreter tool.
//!
//! Three isolation levels:
//!
//! | Level    | Mechanism                                            |
//! |----------|------------------------------------------------------|
//! | `Low`    | Denylist validation + in-process restricted eval     |
//! | `Medium` | `python3` child with CPU/memory rlimits, reset PATH  |
//! | `High`   | Denylist validation, then the `Medium` child         |
//!
//! Every outcome carries a `method` discriminator so an audit trail can
//! reconstruct which path actually executed.

use std::io::Write as _;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

mod restricted;

pub use restricted::eval_restricted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Low,
    Medium,
    High,
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Which path executed: `restricted-eval`, `subprocess`,
    /// `subprocess+validation`, or `validation` (rejected before running).
    pub method: &'static str,
}

impl SandboxOutcome {
    fn rejected(reason: String) -> Self {
        Self { success: false, output: String::new(), error: Some(reason), method: "validation" }
    }
}

/// Runs untrusted interpreter snippets with resource caps.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    timeout_secs: u64,
    memory_limit_mb: u64,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self { timeout_secs: 30, memory_limit_mb: 256 }
    }
}

const MAX_CODE_LEN: usize = 10_000;
const MAX_OUTPUT_LEN: usize = 2_000;

/// Modules a snippet may import in the subprocess levels.
const ALLOWED_MODULES: &[&str] = &[
    "math",
    "datetime",
    "json",
    "re",
    "collections",
    "itertools",
    "functools",
    "random",
    "statistics",
    "string",
    "typing",
    "decimal",
    "fractions",
];

static DENYLIST: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"__import__\s*\(",
        r"\beval\s*\(",
        r"\bexec\s*\(",
        r"\bcompile\s*\(",
        r"\bopen\s*\(",
        r"\bos\.",
        r"\bsys\.",
        r"\bsubprocess\.",
        r"import\s+os\b",
        r"import\s+sys\b",
        r"import\s+subprocess\b",
        r"import\s+pickle\b",
        r"import\s+marshal\b",
        r"import\s+ctypes\b",
        r"import\s+mmap\b",
        r"from\s+os\s+import",
        r"rm\s+-rf",
        r">\s*/dev/",
        r"2>&1",
    ]
    .iter()
    .map(|pattern| {
        Regex::new(&format!("(?i){pattern}")).expect("denylist pattern is valid")
    })
    .collect()
});

static IMPORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:import|from)\s+(\w+)").expect("valid pattern"));

impl SandboxExecutor {
    pub fn new(timeout_secs: u64, memory_limit_mb: u64) -> Self {
        Self { timeout_secs: timeout_secs.max(1), memory_limit_mb: memory_limit_mb.max(16) }
    }

    /// Denylist + import allow-list + length cap.  Returns the reason a
    /// snippet was rejected.
    pub fn validate(&self, code: &str) -> Result<(), String> {
        if code.len() > MAX_CODE_LEN {
            return Err(format!("code too long ({} bytes > {MAX_CODE_LEN})", code.len()));
        }
        for pattern in DENYLIST.iter() {
            if pattern.is_match(code) {
                return Err(format!("dangerous pattern blocked: {}", pattern.as_str()));
            }
        }
        for caps in IMPORT_PATTERN.captures_iter(code) {
            let module = &caps[1];
            if !ALLOWED_MODULES.contains(&module) {
                return Err(format!("import of module '{module}' is not allowed"));
            }
        }
        Ok(())
    }

    pub async fn execute(&self, code: &str, level: IsolationLevel) -> SandboxOutcome {
        debug!(bytes = code.len(), ?level, "sandbox execution");
        match level {
            IsolationLevel::Low => {
                if let Err(reason) = self.validate(code) {
                    return SandboxOutcome::rejected(format!("code validation failed: {reason}"));
                }
                match eval_restricted(code) {
                    Ok(output) => SandboxOutcome {
                        success: true,
                        output,
                        error: None,
                        method: "restricted-eval",
                    },
                    Err(err) => SandboxOutcome {
                        success: false,
                        output: String::new(),
                        error: Some(format!("restricted eval error: {err}")),
                        method: "restricted-eval",
                    },
                }
            }
            IsolationLevel::Medium => {
                let mut outcome = self.execute_subprocess(code).await;
                outcome.method = "subprocess";
                outcome
            }
            IsolationLevel::High => {
                if let Err(reason) = self.validate(code) {
                    return SandboxOutcome::rejected(format!("code validation failed: {reason}"));
                }
                let mut outcome = self.execute_subprocess(code).await;
                outcome.method = "subprocess+validation";
                outcome
            }
        }
    }

    /// Child process with hard resource caps: CPU seconds == wall timeout,
    /// address space == memory limit, `PATH` reset, import path emptied,
    /// stdin closed.
    async fn execute_subprocess(&self, code: &str) -> SandboxOutcome {
        let script = match self.write_script(code) {
            Ok(script) => script,
            Err(err) => {
                return SandboxOutcome {
                    success: false,
                    output: String::new(),
                    error: Some(format!("failed to stage snippet: {err}")),
                    method: "subprocess",
                };
            }
        };

        let mut command = tokio::process::Command::new("python3");
        command
            .arg(script.path())
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("PYTHONPATH", "")
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let cpu_limit = self.timeout_secs;
            let mem_limit = self.memory_limit_mb * 1024 * 1024;
            // SAFETY: only async-signal-safe syscalls between fork and exec.
            unsafe {
                command.pre_exec(move || {
                    let cpu = libc::rlimit { rlim_cur: cpu_limit, rlim_max: cpu_limit };
                    if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    let mem = libc::rlimit { rlim_cur: mem_limit, rlim_max: mem_limit };
                    if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let waited =
            tokio::time::timeout(Duration::from_secs(self.timeout_secs), command.output()).await;

        match waited {
            Err(_) => SandboxOutcome {
                success: false,
                output: String::new(),
                error: Some(format!("execution timed out after {}s", self.timeout_secs)),
                method: "subprocess",
            },
            Ok(Err(err)) => SandboxOutcome {
                success: false,
                output: String::new(),
                error: Some(format!("failed to spawn interpreter: {err}")),
                method: "subprocess",
            },
            Ok(Ok(output)) => {
                let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if output.status.success() {
                    SandboxOutcome { success: true, output: stdout, error: None, method: "subprocess" }
                } else {
                    let error = if stderr.is_empty() {
                        format!("interpreter exited with {}", output.status)
                    } else {
                        stderr
                    };
                    warn!(status = %output.status, "sandboxed snippet failed");
                    SandboxOutcome {
                        success: false,
                        output: stdout,
                        error: Some(error),
                        method: "subprocess",
                    }
                }
            }
        }
    }

    fn write_script(&self, code: &str) -> std::io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".py").tempfile()?;
        // Recursion cap belongs in the wrapper: rlimits don't bound stack
        // depth inside the interpreter.
        writeln!(file, "import sys")?;
        writeln!(file, "sys.setrecursionlimit(256)")?;
        file.write_all(code.as_bytes())?;
        writeln!(file)?;
        file.flush()?;
        Ok(file)
    }
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= MAX_OUTPUT_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_OUTPUT_LEN;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[output truncated]", &trimmed[..end])
}
