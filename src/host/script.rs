//! Scripted host
//!
//! Interprets targets as a small action language so plans can be written as
//! plain YAML files. Actions are separated by `;` and run left to right:
//!
//! ```text
//! pass                  succeed
//! fail <msg>            fail with a message
//! inconclusive <msg>    end inconclusive
//! sleep <ms>            block for a while, ignoring cancellation
//! wait-cancel <ms>      block until cancelled (then unwind) or until <ms>
//! panic <msg>           panic inside the phase
//! flaky <n>             fail while the attempt number is <= n
//! log <text>            write a line to the case output
//! record <label>        append a label to the host journal
//! ```
//!
//! Generator targets are `rows <n>` (n single-int rows), `empty` or
//! `fail <msg>`.

use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{HostCall, IsolationHost};
use crate::assert::Fault;
use crate::executor::TestContext;
use crate::models::{DataRow, Value};

const CANCEL_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, PartialEq)]
enum Action<'a> {
    Pass,
    Fail(&'a str),
    Inconclusive(&'a str),
    Sleep(u64),
    WaitCancel(u64),
    Panic(&'a str),
    Flaky(u32),
    Log(&'a str),
    Record(&'a str),
}

fn parse(script: &str) -> Result<Vec<Action<'_>>, Fault> {
    script
        .split(';')
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .map(|step| {
            let (verb, rest) = step.split_once(' ').unwrap_or((step, ""));
            let rest = rest.trim();
            let number = |what: &str| {
                rest.parse::<u64>().map_err(|_| {
                    Fault::infrastructure(format!("'{verb}' expects {what}, got '{rest}'"))
                })
            };
            match verb {
                "pass" => Ok(Action::Pass),
                "fail" => Ok(Action::Fail(rest)),
                "inconclusive" => Ok(Action::Inconclusive(rest)),
                "sleep" => Ok(Action::Sleep(number("milliseconds")?)),
                "wait-cancel" => Ok(Action::WaitCancel(number("milliseconds")?)),
                "panic" => Ok(Action::Panic(rest)),
                "flaky" => {
                    let count = number("an attempt count")?;
                    u32::try_from(count).map(Action::Flaky).map_err(|_| {
                        Fault::infrastructure(format!(
                            "'{verb}' attempt count {count} is out of range"
                        ))
                    })
                }
                "log" => Ok(Action::Log(rest)),
                "record" => Ok(Action::Record(rest)),
                other => Err(Fault::infrastructure(format!(
                    "Unknown action '{other}' in script '{script}'"
                ))),
            }
        })
        .collect()
}

/// Host that interprets targets as scripts
#[derive(Default)]
pub struct ScriptedHost {
    journal: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels appended by `record` actions, in invocation order
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn perform(&self, action: Action<'_>, ctx: &TestContext) -> Result<(), Fault> {
        match action {
            Action::Pass => Ok(()),
            Action::Fail(msg) => Err(Fault::failure(or_default(msg, "scripted failure"))),
            Action::Inconclusive(msg) => {
                Err(Fault::inconclusive(or_default(msg, "scripted inconclusive")))
            }
            Action::Sleep(ms) => {
                thread::sleep(Duration::from_millis(ms));
                Ok(())
            }
            Action::WaitCancel(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < deadline {
                    ctx.check_cancelled()?;
                    thread::sleep(CANCEL_POLL);
                }
                ctx.check_cancelled()
            }
            Action::Panic(msg) => panic!("{}", or_default(msg, "scripted panic")),
            Action::Flaky(n) => {
                if ctx.attempt() <= n {
                    Err(Fault::failure(format!(
                        "flaky failure on attempt {}",
                        ctx.attempt()
                    )))
                } else {
                    Ok(())
                }
            }
            Action::Log(text) => {
                ctx.write_line(text);
                Ok(())
            }
            Action::Record(label) => {
                self.journal.lock().push(label.to_string());
                Ok(())
            }
        }
    }
}

fn or_default<'a>(msg: &'a str, fallback: &'a str) -> &'a str {
    if msg.is_empty() {
        fallback
    } else {
        msg
    }
}

impl IsolationHost for ScriptedHost {
    fn invoke(&self, call: HostCall<'_>, ctx: &TestContext) -> Result<(), Fault> {
        for action in parse(call.target)? {
            self.perform(action, ctx)?;
        }
        Ok(())
    }

    fn generate_rows(&self, _boundary: &str, target: &str) -> Result<Vec<DataRow>, Fault> {
        let target = target.trim();
        let (verb, rest) = target.split_once(' ').unwrap_or((target, ""));
        match verb {
            "empty" => Ok(Vec::new()),
            "rows" => {
                let count: i64 = rest.trim().parse().map_err(|_| {
                    Fault::infrastructure(format!("'rows' expects a count, got '{rest}'"))
                })?;
                Ok((1..=count)
                    .map(|n| DataRow::new(vec![Value::Int(n)]))
                    .collect())
            }
            "fail" => Err(Fault::failure(or_default(rest.trim(), "generator failed"))),
            other => Err(Fault::infrastructure(format!(
                "Unknown generator '{other}'"
            ))),
        }
    }
}
