//! Recursive sequence interpreter
//!
//! Executes a rule's step list as a cancellable task. A list completes
//! when every step completes and stops early on the first step that
//! reports a non-continue result, except inside `Parallel`, where sibling
//! branches always run to their own terminal state.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use mg_shadow::{CommandSink, OutboundCommand, StateProvider};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::evaluate::check_external;
use crate::step::{Logic, Step};
use crate::trace::{TraceEntry, TracePhase, TraceRecorder, TraceResult};

/// Default wait for a command acknowledgement
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal state of a step list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every step completed
    Complete,

    /// A command failed or a wait timed out; later steps were skipped
    Failed,

    /// A gate blocked the remainder of the list
    Aborted,
}

impl Outcome {
    /// The trace result recorded when a sequence ends with this outcome
    pub fn as_trace_result(self) -> TraceResult {
        match self {
            Outcome::Complete => TraceResult::Complete,
            Outcome::Failed => TraceResult::Failed,
            Outcome::Aborted => TraceResult::Cancelled,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Complete => write!(f, "complete"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Control flow after one step
enum StepFlow {
    /// Move on to the next step
    Continue,

    /// Stop this list with the given outcome
    Halt(Outcome),
}

/// Executes step trees against the device shadow and command sink
///
/// Cloning is cheap; `Parallel` clones the interpreter into one spawned
/// task per branch so siblings run with real concurrency.
#[derive(Clone)]
pub struct SequenceInterpreter {
    provider: Arc<dyn StateProvider>,
    sink: Arc<dyn CommandSink>,
    trace: Arc<TraceRecorder>,
    command_timeout: Duration,
}

impl SequenceInterpreter {
    /// Create an interpreter with the default command timeout
    pub fn new(
        provider: Arc<dyn StateProvider>,
        sink: Arc<dyn CommandSink>,
        trace: Arc<TraceRecorder>,
    ) -> Self {
        Self {
            provider,
            sink,
            trace,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the command acknowledgement timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run a step list to its terminal state
    pub async fn run(&self, rule_id: &str, steps: &[Step]) -> Outcome {
        debug!(rule_id, steps = steps.len(), "Running sequence");
        self.run_list(rule_id, steps).await
    }

    /// Run a list of steps; boxed so nested lists can recurse
    fn run_list<'a>(
        &'a self,
        rule_id: &'a str,
        steps: &'a [Step],
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            for step in steps {
                match self.run_step(rule_id, step).await {
                    StepFlow::Continue => {}
                    StepFlow::Halt(outcome) => return outcome,
                }
            }
            Outcome::Complete
        })
    }

    async fn run_step(&self, rule_id: &str, step: &Step) -> StepFlow {
        match step {
            Step::Command {
                target_ieee,
                command,
                value,
                endpoint_id,
            } => {
                self.run_command(rule_id, *target_ieee, command, value.clone(), *endpoint_id)
                    .await
            }
            Step::Delay { seconds } => {
                debug!(rule_id, seconds, "Delaying sequence");
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                StepFlow::Continue
            }
            Step::WaitFor {
                ieee,
                attribute,
                operator,
                value,
                negate,
                timeout,
            } => {
                self.run_wait_for(rule_id, *ieee, attribute, *operator, value, *negate, *timeout)
                    .await
            }
            Step::Gate {
                ieee,
                attribute,
                operator,
                value,
                negate,
            } => {
                let detail = check_external(
                    self.provider.as_ref(),
                    *ieee,
                    attribute,
                    *operator,
                    value,
                    *negate,
                )
                .await;

                if detail.satisfied {
                    self.trace.record(
                        TraceEntry::new(
                            rule_id,
                            TracePhase::Step,
                            TraceResult::GatePass,
                            format!("gate on {}.{} passed", ieee, attribute),
                        )
                        .with_checks(vec![detail]),
                    );
                    StepFlow::Continue
                } else {
                    self.trace.record(
                        TraceEntry::new(
                            rule_id,
                            TracePhase::Step,
                            TraceResult::GateFail,
                            format!("gate on {}.{} blocked the sequence", ieee, attribute),
                        )
                        .with_checks(vec![detail]),
                    );
                    StepFlow::Halt(Outcome::Aborted)
                }
            }
            Step::IfThenElse {
                conditions,
                logic,
                then_steps,
                else_steps,
            } => {
                // Every inline condition is checked and traced, mirroring
                // the rule evaluator's no-short-circuit policy.
                let mut details = Vec::with_capacity(conditions.len());
                for condition in conditions {
                    details.push(
                        check_external(
                            self.provider.as_ref(),
                            condition.ieee,
                            &condition.attribute,
                            condition.operator,
                            &condition.value,
                            condition.negate,
                        )
                        .await,
                    );
                }

                let matched = match logic {
                    Logic::And => details.iter().all(|d| d.satisfied),
                    Logic::Or => details.iter().any(|d| d.satisfied),
                };

                let (result, branch) = if matched {
                    (TraceResult::IfTrue, then_steps)
                } else {
                    (TraceResult::IfFalse, else_steps)
                };

                self.trace.record(
                    TraceEntry::new(
                        rule_id,
                        TracePhase::Step,
                        result,
                        format!(
                            "if/then/else took the {} branch",
                            if matched { "then" } else { "else" }
                        ),
                    )
                    .with_checks(details),
                );

                match self.run_list(rule_id, branch).await {
                    Outcome::Complete => StepFlow::Continue,
                    outcome => StepFlow::Halt(outcome),
                }
            }
            Step::Parallel { branches } => self.run_parallel(rule_id, branches).await,
        }
    }

    async fn run_command(
        &self,
        rule_id: &str,
        target_ieee: mg_core::Ieee,
        command: &str,
        value: Option<mg_core::AttrValue>,
        endpoint_id: Option<u8>,
    ) -> StepFlow {
        let outbound = OutboundCommand {
            target_ieee,
            command: command.to_string(),
            value,
            endpoint_id,
        };

        match tokio::time::timeout(self.command_timeout, self.sink.send_command(outbound)).await {
            Ok(Ok(())) => {
                self.trace.record(TraceEntry::new(
                    rule_id,
                    TracePhase::Step,
                    TraceResult::CmdOk,
                    format!("command '{}' acknowledged by {}", command, target_ieee),
                ));
                StepFlow::Continue
            }
            Ok(Err(e)) => {
                self.trace.record(
                    TraceEntry::new(
                        rule_id,
                        TracePhase::Step,
                        TraceResult::CmdFail,
                        format!("command '{}' to {} failed", command, target_ieee),
                    )
                    .with_error(e.to_string()),
                );
                StepFlow::Halt(Outcome::Failed)
            }
            Err(_) => {
                self.trace.record(
                    TraceEntry::new(
                        rule_id,
                        TracePhase::Step,
                        TraceResult::CmdFail,
                        format!("command '{}' to {} timed out", command, target_ieee),
                    )
                    .with_error(format!(
                        "no acknowledgement within {:.1}s",
                        self.command_timeout.as_secs_f64()
                    )),
                );
                StepFlow::Halt(Outcome::Failed)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_wait_for(
        &self,
        rule_id: &str,
        ieee: mg_core::Ieee,
        attribute: &str,
        operator: mg_core::CompareOp,
        value: &serde_json::Value,
        negate: bool,
        timeout_secs: f64,
    ) -> StepFlow {
        // Subscribe before the initial check so no report is missed
        let mut rx = self.provider.subscribe();
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_secs);

        loop {
            let detail = check_external(
                self.provider.as_ref(),
                ieee,
                attribute,
                operator,
                value,
                negate,
            )
            .await;

            if detail.satisfied {
                self.trace.record(
                    TraceEntry::new(
                        rule_id,
                        TracePhase::Step,
                        TraceResult::WaitMet,
                        format!("wait_for on {}.{} satisfied", ieee, attribute),
                    )
                    .with_checks(vec![detail]),
                );
                return StepFlow::Continue;
            }

            // Sleep until a report touches this attribute or the deadline
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Err(_) => {
                        self.trace.record(TraceEntry::new(
                            rule_id,
                            TracePhase::Step,
                            TraceResult::WaitTimeout,
                            format!(
                                "wait_for on {}.{} timed out after {:.1}s",
                                ieee, attribute, timeout_secs
                            ),
                        ));
                        return StepFlow::Halt(Outcome::Failed);
                    }
                    Ok(Ok(event)) => {
                        if event.ieee == ieee && event.attributes.iter().any(|a| a == attribute) {
                            break;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(rule_id, skipped, "wait_for feed lagged, re-checking");
                        break;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        // Feed gone: the attribute can no longer change
                        tokio::time::sleep_until(deadline).await;
                        self.trace.record(TraceEntry::new(
                            rule_id,
                            TracePhase::Step,
                            TraceResult::WaitTimeout,
                            format!(
                                "wait_for on {}.{} timed out after {:.1}s (feed closed)",
                                ieee, attribute, timeout_secs
                            ),
                        ));
                        return StepFlow::Halt(Outcome::Failed);
                    }
                }
            }
        }
    }

    async fn run_parallel(&self, rule_id: &str, branches: &[Vec<Step>]) -> StepFlow {
        let mut handles = Vec::with_capacity(branches.len());

        for branch in branches {
            let this = self.clone();
            let rule_id = rule_id.to_string();
            let branch = branch.clone();
            handles.push(tokio::spawn(async move {
                this.run_list(&rule_id, &branch).await
            }));
        }

        // All branches run to a terminal state; no branch cancels another
        let joined = futures::future::join_all(handles).await;

        let mut outcomes = Vec::with_capacity(joined.len());
        for (index, result) in joined.into_iter().enumerate() {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    self.trace.record(
                        TraceEntry::new(
                            rule_id,
                            TracePhase::Step,
                            TraceResult::Exception,
                            format!("parallel branch {} panicked", index),
                        )
                        .with_error(e.to_string()),
                    );
                    outcomes.push(Outcome::Failed);
                }
            }
        }

        let summary = outcomes
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let any_failed = outcomes.iter().any(|o| *o != Outcome::Complete);

        self.trace.record(TraceEntry::new(
            rule_id,
            TracePhase::Step,
            TraceResult::ParallelDone,
            format!("parallel branches finished: [{}]", summary),
        ));

        if any_failed {
            StepFlow::Halt(Outcome::Failed)
        } else {
            StepFlow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::InlineCondition;
    use async_trait::async_trait;
    use mg_core::{AttrValue, CompareOp, Ieee};
    use mg_shadow::{DeviceShadow, DispatchError};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Command sink that records commands and fails or stalls on demand
    struct MockSink {
        sent: Mutex<Vec<OutboundCommand>>,
        fail_command: Option<String>,
        stall_command: Option<String>,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_command: None,
                stall_command: None,
            }
        }

        fn failing_on(command: &str) -> Self {
            Self {
                fail_command: Some(command.to_string()),
                ..Self::new()
            }
        }

        fn stalling_on(command: &str) -> Self {
            Self {
                stall_command: Some(command.to_string()),
                ..Self::new()
            }
        }

        fn sent(&self) -> Vec<OutboundCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandSink for MockSink {
        async fn send_command(&self, command: OutboundCommand) -> Result<(), DispatchError> {
            if self.stall_command.as_deref() == Some(command.command.as_str()) {
                futures::future::pending::<()>().await;
            }
            let fail = self.fail_command.as_deref() == Some(command.command.as_str());
            self.sent.lock().unwrap().push(command);
            if fail {
                Err(DispatchError::Rejected("device offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn harness(sink: MockSink) -> (SequenceInterpreter, Arc<DeviceShadow>, Arc<MockSink>, Arc<TraceRecorder>) {
        let shadow = Arc::new(DeviceShadow::new());
        let sink = Arc::new(sink);
        let trace = Arc::new(TraceRecorder::new(100));
        let interpreter = SequenceInterpreter::new(shadow.clone(), sink.clone(), trace.clone());
        (interpreter, shadow, sink, trace)
    }

    fn command(name: &str) -> Step {
        Step::Command {
            target_ieee: Ieee::new(0xD1),
            command: name.to_string(),
            value: None,
            endpoint_id: None,
        }
    }

    fn results(trace: &TraceRecorder) -> Vec<TraceResult> {
        // query() is most-recent-first; reverse into execution order
        trace.query(None).into_iter().rev().map(|e| e.result).collect()
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let (interpreter, _shadow, sink, _trace) = harness(MockSink::new());

        let outcome = interpreter
            .run("r1", &[command("on"), command("set_level")])
            .await;

        assert_eq!(outcome, Outcome::Complete);
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].command, "on");
        assert_eq!(sent[1].command, "set_level");
    }

    #[tokio::test]
    async fn test_command_failure_is_fail_fast() {
        let (interpreter, _shadow, sink, trace) = harness(MockSink::failing_on("on"));

        let outcome = interpreter
            .run("r1", &[command("on"), command("set_level")])
            .await;

        assert_eq!(outcome, Outcome::Failed);
        // The later step never ran
        assert_eq!(sink.sent().len(), 1);
        assert!(results(&trace).contains(&TraceResult::CmdFail));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_ack_timeout() {
        let (interpreter, _shadow, _sink, trace) = harness(MockSink::stalling_on("on"));

        let outcome = interpreter.run("r1", &[command("on")]).await;

        assert_eq!(outcome, Outcome::Failed);
        let entries = trace.query(Some("r1"));
        assert_eq!(entries[0].result, TraceResult::CmdFail);
        assert!(entries[0].error.as_ref().unwrap().contains("acknowledgement"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_suspends_only_this_sequence() {
        let (interpreter, _shadow, sink, _trace) = harness(MockSink::new());

        let start = tokio::time::Instant::now();
        let outcome = interpreter
            .run("r1", &[Step::Delay { seconds: 3.0 }, command("on")])
            .await;

        assert_eq!(outcome, Outcome::Complete);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout_fails_sequence() {
        let (interpreter, shadow, sink, trace) = harness(MockSink::new());
        shadow.apply_report(
            Ieee::new(0xE1),
            HashMap::from([("state".to_string(), AttrValue::Str("OFF".to_string()))]),
        );

        let steps = [
            Step::WaitFor {
                ieee: Ieee::new(0xE1),
                attribute: "state".to_string(),
                operator: CompareOp::Eq,
                value: json!("ON"),
                negate: false,
                timeout: 5.0,
            },
            command("on"),
        ];

        let outcome = interpreter.run("r1", &steps).await;

        assert_eq!(outcome, Outcome::Failed);
        // No further steps ran after the timeout
        assert!(sink.sent().is_empty());
        assert_eq!(trace.query(Some("r1"))[0].result, TraceResult::WaitTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_satisfied_by_report() {
        let (interpreter, shadow, sink, trace) = harness(MockSink::new());
        let device = Ieee::new(0xE1);
        shadow.apply_report(
            device,
            HashMap::from([("state".to_string(), AttrValue::Str("OFF".to_string()))]),
        );

        let reporter = {
            let shadow = shadow.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                shadow.apply_report(
                    device,
                    HashMap::from([("state".to_string(), AttrValue::Str("ON".to_string()))]),
                );
            })
        };

        let steps = [
            Step::WaitFor {
                ieee: device,
                attribute: "state".to_string(),
                operator: CompareOp::Eq,
                value: json!("ON"),
                negate: false,
                timeout: 10.0,
            },
            command("on"),
        ];

        let outcome = interpreter.run("r1", &steps).await;
        reporter.await.unwrap();

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(sink.sent().len(), 1);
        assert!(results(&trace).contains(&TraceResult::WaitMet));
    }

    #[tokio::test]
    async fn test_gate_blocks_sequence() {
        let (interpreter, shadow, sink, trace) = harness(MockSink::new());
        shadow.apply_report(
            Ieee::new(0xE2),
            HashMap::from([("mode".to_string(), AttrValue::Str("away".to_string()))]),
        );

        let steps = [
            Step::Gate {
                ieee: Ieee::new(0xE2),
                attribute: "mode".to_string(),
                operator: CompareOp::Eq,
                value: json!("home"),
                negate: false,
            },
            command("on"),
        ];

        let outcome = interpreter.run("r1", &steps).await;

        assert_eq!(outcome, Outcome::Aborted);
        assert!(sink.sent().is_empty());
        assert_eq!(trace.query(Some("r1"))[0].result, TraceResult::GateFail);
    }

    #[tokio::test]
    async fn test_gate_pass_continues() {
        let (interpreter, shadow, sink, _trace) = harness(MockSink::new());
        shadow.apply_report(
            Ieee::new(0xE2),
            HashMap::from([("mode".to_string(), AttrValue::Str("home".to_string()))]),
        );

        let steps = [
            Step::Gate {
                ieee: Ieee::new(0xE2),
                attribute: "mode".to_string(),
                operator: CompareOp::Eq,
                value: json!("home"),
                negate: false,
            },
            command("on"),
        ];

        assert_eq!(interpreter.run("r1", &steps).await, Outcome::Complete);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_if_then_else_or_logic() {
        let (interpreter, shadow, sink, trace) = harness(MockSink::new());
        let device = Ieee::new(0xE3);
        shadow.apply_report(
            device,
            HashMap::from([
                ("mode".to_string(), AttrValue::Str("away".to_string())),
                ("guest".to_string(), AttrValue::Bool(true)),
            ]),
        );

        let inline = |attribute: &str, value: serde_json::Value| InlineCondition {
            ieee: device,
            attribute: attribute.to_string(),
            operator: CompareOp::Eq,
            value,
            negate: false,
        };

        // First condition false, second true, OR logic: then branch runs
        let steps = [Step::IfThenElse {
            conditions: vec![inline("mode", json!("home")), inline("guest", json!(true))],
            logic: Logic::Or,
            then_steps: vec![command("on")],
            else_steps: vec![command("off")],
        }];

        assert_eq!(interpreter.run("r1", &steps).await, Outcome::Complete);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, "on");

        let entry = trace
            .query(Some("r1"))
            .into_iter()
            .find(|e| matches!(e.result, TraceResult::IfTrue | TraceResult::IfFalse))
            .unwrap();
        assert_eq!(entry.result, TraceResult::IfTrue);
        // Both inline checks were evaluated and recorded
        assert_eq!(entry.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_nested_branch_failure_propagates() {
        let (interpreter, shadow, sink, _trace) = harness(MockSink::failing_on("on"));
        let device = Ieee::new(0xE3);
        shadow.apply_report(
            device,
            HashMap::from([("mode".to_string(), AttrValue::Str("home".to_string()))]),
        );

        let steps = [
            Step::IfThenElse {
                conditions: vec![InlineCondition {
                    ieee: device,
                    attribute: "mode".to_string(),
                    operator: CompareOp::Eq,
                    value: json!("home"),
                    negate: false,
                }],
                logic: Logic::And,
                then_steps: vec![command("on")],
                else_steps: vec![],
            },
            command("set_level"),
        ];

        assert_eq!(interpreter.run("r1", &steps).await, Outcome::Failed);
        // The step after the failed branch never ran
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_waits_for_all_branches() {
        let (interpreter, _shadow, sink, trace) = harness(MockSink::failing_on("on"));

        // Branch A fails immediately; branch B keeps running for 3s
        let steps = [Step::Parallel {
            branches: vec![
                vec![command("on")],
                vec![Step::Delay { seconds: 3.0 }, command("set_level")],
            ],
        }];

        let start = tokio::time::Instant::now();
        let outcome = interpreter.run("r1", &steps).await;

        assert_eq!(outcome, Outcome::Failed);
        // The failing branch did not cancel its sibling
        assert!(start.elapsed() >= Duration::from_secs(3));
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);

        let trace_results = results(&trace);
        assert!(trace_results.contains(&TraceResult::CmdFail));
        assert!(trace_results.contains(&TraceResult::CmdOk));
        assert!(trace_results.contains(&TraceResult::ParallelDone));
    }

    #[tokio::test]
    async fn test_parallel_all_complete() {
        let (interpreter, _shadow, sink, _trace) = harness(MockSink::new());

        let steps = [Step::Parallel {
            branches: vec![vec![command("on")], vec![command("set_level")]],
        }];

        assert_eq!(interpreter.run("r1", &steps).await, Outcome::Complete);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_list_completes() {
        let (interpreter, _shadow, _sink, _trace) = harness(MockSink::new());
        assert_eq!(interpreter.run("r1", &[]).await, Outcome::Complete);
    }
}
