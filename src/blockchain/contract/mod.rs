//! Contract sandbox.
//!
//! Contract code is a small indentation-based scripting language. Source is tokenized,
//! parsed and statically checked before it runs, then evaluated by a
//! metered interpreter on a dedicated worker thread. The worker only ever
//! sees a copy of the contract storage; the caller commits the returned
//! storage or discards it.

pub mod check;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use super::crypto::Address;
use interpreter::Meter;

/// Persistent key/value storage of a contract account.
pub type Storage = BTreeMap<String, serde_json::Value>;

const WORKER_STACK_BYTES: usize = 8 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Forbidden construct: {0}")]
    Forbidden(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Step limit exhausted")]
    OutOfSteps,

    #[error("Memory limit exceeded")]
    MemoryLimit,

    #[error("Execution timed out")]
    Timeout,

    #[error("Storage is not serializable: {0}")]
    NonSerializable(String),

    #[error("Contract code is {size} bytes, limit is {limit}")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("Account has no contract code")]
    MissingCode,

    #[error("Contract execution crashed")]
    Crashed,

    #[error("Failed to start contract worker: {0}")]
    Spawn(String),
}

/// Resource bounds applied to every contract invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_steps: u64,
    pub max_memory_bytes: usize,
    pub timeout: Duration,
    pub max_code_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            max_steps: 200_000,
            max_memory_bytes: 8 * 1024 * 1024,
            timeout: Duration::from_millis(10_000),
            max_code_bytes: 64 * 1024,
        }
    }
}

/// What a contract sees of the invoking transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub sender: Address,
    pub payload: Option<String>,
    pub amount: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Sandbox { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Rejects code that does not parse or uses forbidden constructs,
    /// without running it.
    pub fn validate(&self, code: &str) -> Result<parser::Program, SandboxError> {
        if code.len() > self.limits.max_code_bytes {
            return Err(SandboxError::CodeTooLarge {
                size: code.len(),
                limit: self.limits.max_code_bytes,
            });
        }
        let program = parser::parse(code)?;
        check::check_program(&program)?;
        Ok(program)
    }

    /// Runs `code` against a copy of `storage` and returns the new storage.
    ///
    /// The input storage is never touched, so any error leaves the
    /// contract exactly as it was.
    pub fn execute(
        &self,
        code: &str,
        storage: &Storage,
        context: &CallContext,
    ) -> Result<Storage, SandboxError> {
        let program = self.validate(code)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();

        let worker_cancel = Arc::clone(&cancel);
        let limits = self.limits.clone();
        let storage = storage.clone();
        let context = context.clone();

        thread::Builder::new()
            .name("contract-sandbox".to_string())
            .stack_size(WORKER_STACK_BYTES)
            .spawn(move || {
                let mut meter = Meter::new(&limits, worker_cancel);
                let outcome = interpreter::run(&program, &storage, &context, &mut meter);
                // The receiver is gone if the caller already timed out.
                let _ = sender.send(outcome);
            })
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        match receiver.recv_timeout(self.limits.timeout) {
            Ok(outcome) => {
                if let Err(e) = &outcome {
                    debug!("Contract execution failed: {}", e);
                }
                outcome
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                warn!("Contract execution exceeded {:?}", self.limits.timeout);
                Err(SandboxError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Contract worker terminated without a result");
                Err(SandboxError::Crashed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COUNTER: &str = "\
if msg['data'] == 'increment':
    storage['counter'] = storage.get('counter', 0) + 1
";

    fn context(payload: &str) -> CallContext {
        CallContext {
            sender: Address("cd".repeat(32)),
            payload: Some(payload.to_string()),
            amount: 0,
        }
    }

    #[test]
    fn test_counter_contract() {
        let sandbox = Sandbox::default();
        let storage = sandbox
            .execute(COUNTER, &Storage::new(), &context("increment"))
            .unwrap();
        assert_eq!(storage.get("counter"), Some(&json!(1)));

        let unchanged = sandbox.execute(COUNTER, &storage, &context("noop")).unwrap();
        assert_eq!(unchanged, storage);
    }

    #[test]
    fn test_infinite_loop_is_stopped() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        });
        let result = sandbox.execute("while True:\n    pass\n", &Storage::new(), &context(""));
        assert_eq!(result, Err(SandboxError::OutOfSteps));
    }

    #[test]
    fn test_default_limits_run_out_of_steps_first() {
        let sandbox = Sandbox::default();
        let result = sandbox.execute(
            "s = 'x' * 60000\nwhile True:\n    t = s.upper()\n",
            &Storage::new(),
            &context(""),
        );
        assert!(matches!(
            result,
            Err(SandboxError::OutOfSteps) | Err(SandboxError::MemoryLimit)
        ));
        let result = sandbox.execute("while True:\n    pass\n", &Storage::new(), &context(""));
        assert_eq!(result, Err(SandboxError::OutOfSteps));
    }

    #[test]
    fn test_wall_clock_limit() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_steps: u64::MAX,
            timeout: Duration::from_millis(50),
            ..SandboxLimits::default()
        });
        let result = sandbox.execute("while True:\n    pass\n", &Storage::new(), &context(""));
        assert_eq!(result, Err(SandboxError::Timeout));
    }

    #[test]
    fn test_memory_bomb() {
        let sandbox = Sandbox::default();
        let result = sandbox.execute("x = 'a' * (10 ** 12)\n", &Storage::new(), &context(""));
        assert_eq!(result, Err(SandboxError::MemoryLimit));
    }

    #[test]
    fn test_forbidden_code_never_runs() {
        let sandbox = Sandbox::default();
        let result = sandbox.execute(
            "storage['x'] = 1\nimport os\n",
            &Storage::new(),
            &context(""),
        );
        assert!(matches!(result, Err(SandboxError::Forbidden(_))));
    }

    #[test]
    fn test_failure_leaves_input_untouched() {
        let sandbox = Sandbox::default();
        let mut storage = Storage::new();
        storage.insert("counter".to_string(), json!(5));

        let result = sandbox.execute(
            "storage['counter'] = 99\nraise Exception('stop')\n",
            &storage,
            &context(""),
        );
        assert!(matches!(result, Err(SandboxError::Runtime(_))));
        assert_eq!(storage.get("counter"), Some(&json!(5)));
    }

    #[test]
    fn test_code_size_limit() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_code_bytes: 8,
            ..SandboxLimits::default()
        });
        let result = sandbox.execute("storage['a'] = 1\n", &Storage::new(), &context(""));
        assert!(matches!(result, Err(SandboxError::CodeTooLarge { .. })));
    }

    #[test]
    fn test_long_expression_is_a_syntax_error() {
        let sandbox = Sandbox::default();
        let code = format!("x = 1{}\n", "+1".repeat(30_000));
        let result = sandbox.execute(&code, &Storage::new(), &context(""));
        assert!(matches!(result, Err(SandboxError::Syntax { .. })));
    }

    #[test]
    fn test_deeply_nested_list_is_released() {
        let sandbox = Sandbox::default();
        let code = "a = []\nfor i in range(100000):\n    a = [a]\n";
        let result = sandbox.execute(code, &Storage::new(), &context(""));
        assert!(matches!(result, Ok(_) | Err(SandboxError::OutOfSteps)));

        let roomy = Sandbox::new(SandboxLimits {
            max_steps: 2_000_000,
            max_memory_bytes: 64 * 1024 * 1024,
            ..SandboxLimits::default()
        });
        let result = roomy.execute(code, &Storage::new(), &context(""));
        assert_eq!(result, Ok(Storage::new()));
    }

    #[test]
    fn test_shared_string_copies_are_charged() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_memory_bytes: 1024 * 1024,
            ..SandboxLimits::default()
        });
        let code = "s = 'a' * 524288\nl = []\nfor i in range(200):\n    l.append(s)\nstorage['n'] = len(l)\n";
        let result = sandbox.execute(code, &Storage::new(), &context(""));
        assert_eq!(result, Err(SandboxError::MemoryLimit));
    }

    #[test]
    fn test_non_serializable_result() {
        let sandbox = Sandbox::default();
        let result = sandbox.execute("storage['f'] = len\n", &Storage::new(), &context(""));
        assert!(matches!(result, Err(SandboxError::NonSerializable(_))));
    }
}
