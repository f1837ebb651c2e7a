//! Test mock for `exec::run` and friends.
//!
//! Installs a thread-local script that intercepts host commands during
//! tests. Patterns are substring matches against the rendered command line;
//! each pattern carries a queue of responses (the last one repeats), so a
//! test can model "busy twice, then success". Unmatched commands succeed
//! silently, mirroring the long tail of `ip`/`nft` invocations tests don't
//! care about.
//!
//! The module is compiled unconditionally so downstream crates can drive
//! their own tests through the same seam; `intercept` is a no-op unless a
//! script is installed on the current thread.

use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

/// Scripted response for one intercepted command.
#[derive(Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn err(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn to_output(&self) -> Output {
        Output {
            // Unix exit code encoding: status = code << 8
            status: ExitStatus::from_raw(self.exit_code << 8),
            stdout: self.stdout.as_bytes().to_vec(),
            stderr: self.stderr.as_bytes().to_vec(),
        }
    }
}

struct Rule {
    pattern: String,
    responses: Vec<MockResponse>,
    next: usize,
}

struct MockState {
    rules: Vec<Rule>,
    calls: Arc<Mutex<Vec<String>>>,
}

thread_local! {
    static STATE: RefCell<Option<MockState>> = const { RefCell::new(None) };
}

/// Guard that clears the installed script on drop.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        STATE.with(|s| *s.borrow_mut() = None);
    }
}

/// Shared log of every intercepted command line, in invocation order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Try to intercept a command. Returns None when no script is installed.
pub(crate) fn intercept(program: &str, args: &[&str]) -> Option<Output> {
    STATE.with(|s| {
        let mut state = s.borrow_mut();
        let state = state.as_mut()?;

        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        state.calls.lock().unwrap().push(line.clone());

        for rule in &mut state.rules {
            if line.contains(&rule.pattern) {
                let idx = rule.next.min(rule.responses.len() - 1);
                rule.next += 1;
                return Some(rule.responses[idx].to_output());
            }
        }
        Some(MockResponse::empty().to_output())
    })
}

/// Start building a command script.
pub fn mock() -> MockBuilder {
    MockBuilder { rules: Vec::new() }
}

pub struct MockBuilder {
    rules: Vec<Rule>,
}

impl MockBuilder {
    /// Respond to commands containing `pattern`. First matching pattern wins.
    pub fn on(mut self, pattern: &str, response: MockResponse) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            responses: vec![response],
            next: 0,
        });
        self
    }

    /// Respond with a sequence; the final response repeats once exhausted.
    pub fn on_seq(mut self, pattern: &str, responses: Vec<MockResponse>) -> Self {
        assert!(!responses.is_empty(), "on_seq needs at least one response");
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            responses,
            next: 0,
        });
        self
    }

    /// Install the script on this thread. Returns a guard (clears on drop)
    /// and the shared call log.
    pub fn install(self) -> (MockGuard, CallLog) {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        STATE.with(|s| {
            *s.borrow_mut() = Some(MockState {
                rules: self.rules,
                calls: calls.clone(),
            });
        });
        (MockGuard, calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_advances_then_sticks() {
        let (_guard, _calls) = mock()
            .on_seq(
                "ip tuntap add",
                vec![
                    MockResponse::err(2, "Device or resource busy"),
                    MockResponse::empty(),
                ],
            )
            .install();

        let first = intercept("ip", &["tuntap", "add", "dev", "t0", "mode", "tap"]).unwrap();
        assert!(!first.status.success());
        let second = intercept("ip", &["tuntap", "add", "dev", "t0", "mode", "tap"]).unwrap();
        assert!(second.status.success());
        let third = intercept("ip", &["tuntap", "add", "dev", "t0", "mode", "tap"]).unwrap();
        assert!(third.status.success());
    }

    #[test]
    fn test_unmatched_commands_succeed() {
        let (_guard, calls) = mock().install();
        let out = intercept("nft", &["list", "tables"]).unwrap();
        assert!(out.status.success());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_no_script_means_no_interception() {
        assert!(intercept("ip", &["link", "show"]).is_none());
    }
}
