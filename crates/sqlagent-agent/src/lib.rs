//! NL-to-SQL agent loop: generate -> execute -> classify -> repair -> retry.
//!
//! Provides `AgentLoop`, the bounded retry controller, together with the
//! `QueryGenerator` capability, the repair strategist, and the prompt builder
//! used by the language-model generator.

pub mod generator;
pub mod loop_detection;
pub mod prompt_builder;
pub mod repair;

pub use generator::{GeneratedQuery, GenerationInput, LlmQueryGenerator, QueryGenerator};
pub use loop_detection::ErrorStreak;
pub use prompt_builder::PromptBuilder;
pub use repair::strategize;

use std::time::Instant;

use sqlagent_exec::QueryExecutor;
use sqlagent_types::{
    AbortReason, AgentError, ErrorKind, FailureRecord, Observation, RepairGuidance, Result,
    RunFailure, RunOutcome, RunReport, StepRecord,
};

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// Limits and generator selection for a run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of generate/execute attempts.
    pub max_iterations: u32,
    /// Consecutive identical error kinds that abort the run.
    pub max_repeat_errors: u32,
    pub model: String,
    pub provider: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            max_repeat_errors: 2,
            model: "gemini-2.5-flash".to_string(),
            provider: "gemini".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        if self.max_repeat_errors == 0 {
            return Err(AgentError::Config(
                "max_repeat_errors must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

/// Where the controller is within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Generating,
    Executing,
    ClassifyingError,
    Repairing,
    Succeeded,
    Aborted,
}

/// Mutable state of one run. Owned by a single `run` call, never shared.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub phase: RunPhase,
    /// 1-based attempt number.
    pub iteration: u32,
    pub streak: ErrorStreak,
    pub previous_query: Option<String>,
    pub previous_observation: Option<Observation>,
    pub guidance: Option<RepairGuidance>,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Generating,
            iteration: 1,
            streak: ErrorStreak::new(),
            previous_query: None,
            previous_observation: None,
            guidance: None,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::trace!(iteration = self.iteration, from = ?self.phase, to = ?phase, "Phase change");
        self.phase = phase;
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide what follows a failed attempt.
///
/// Checks run in order: repeated-error cap, recoverable allow-list, repair
/// strategy, iteration cap. Returns the guidance (when the strategist was
/// consulted) and the abort reason, if any.
fn evaluate_failure(
    config: &AgentConfig,
    state: &mut LoopState,
    kind: ErrorKind,
    query: &str,
    observation: &Observation,
) -> (Option<RepairGuidance>, Option<AbortReason>) {
    let repeats = state.streak.record(kind);
    if repeats >= config.max_repeat_errors {
        return (
            None,
            Some(AbortReason::RepeatedError {
                error_kind: kind,
                repeats,
            }),
        );
    }

    if !kind.is_recoverable() {
        return (None, Some(AbortReason::Unrecoverable { error_kind: kind }));
    }

    let guidance = repair::strategize(kind, query, observation);
    let abort = match &guidance {
        RepairGuidance::Abort { reason } => Some(AbortReason::NoStrategy {
            error_kind: kind,
            detail: reason.clone(),
        }),
        RepairGuidance::ReviseQuery { .. } if state.iteration + 1 > config.max_iterations => {
            Some(AbortReason::IterationsExhausted {
                max_iterations: config.max_iterations,
            })
        }
        RepairGuidance::ReviseQuery { .. } => None,
    };
    (Some(guidance), abort)
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

/// The retry controller: one question in, one terminal outcome out.
pub struct AgentLoop {
    generator: Box<dyn QueryGenerator>,
    executor: QueryExecutor,
    schema: String,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        generator: Box<dyn QueryGenerator>,
        executor: QueryExecutor,
        schema: impl Into<String>,
        config: AgentConfig,
    ) -> Result<Self> {
        config.validate()?;
        executor.limits().validate()?;
        Ok(Self {
            generator,
            executor,
            schema: schema.into(),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Run the loop and return only the terminal outcome.
    pub async fn run(&self, question: &str) -> Result<RunOutcome> {
        self.run_report(question)
            .await
            .map(|report| report.outcome)
            .map_err(|failure| failure.error)
    }

    /// Run the loop, recording every attempt.
    ///
    /// Execution failures never surface as `Err`; they end in
    /// `RunOutcome::Aborted`. `Err` means the generator failed or broke its
    /// contract, which ends the run without consuming an iteration. The
    /// failure still carries the steps taken so far and the rejected query.
    pub async fn run_report(&self, question: &str) -> std::result::Result<RunReport, RunFailure> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = chrono::Utc::now();
        tracing::info!(
            %run_id,
            max_iterations = self.config.max_iterations,
            max_repeat_errors = self.config.max_repeat_errors,
            "Run started"
        );

        let mut state = LoopState::new();
        let mut steps: Vec<StepRecord> = Vec::new();

        let fail = |steps: Vec<StepRecord>,
                    iteration: u32,
                    error: AgentError,
                    rejected_query: Option<String>| {
            tracing::warn!(%run_id, iteration, error = %error, "Generation failed");
            let outcome = RunOutcome::GenerationFailed {
                iteration,
                error: error.to_string(),
                rejected_query,
            };
            RunFailure {
                error,
                report: Box::new(self.report(run_id, question, started_at, steps, outcome)),
            }
        };

        let outcome = loop {
            state.enter(RunPhase::Generating);
            let input = GenerationInput {
                question,
                schema: &self.schema,
                dialect: self.executor.backend().name(),
                previous_query: state.previous_query.as_deref(),
                previous_observation: state.previous_observation.as_ref().map(Observation::digest),
                guidance: state.guidance.as_ref(),
            };
            let generated = match self.generator.generate(&input).await {
                Ok(generated) => match generated.validate() {
                    Ok(()) => generated,
                    Err(e) => {
                        return Err(fail(steps, state.iteration, e, Some(generated.sql_query)))
                    }
                },
                Err(e) => return Err(fail(steps, state.iteration, e, None)),
            };

            state.enter(RunPhase::Executing);
            let started = Instant::now();
            let observation = self
                .executor
                .execute(&generated.sql_query, state.iteration)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let GeneratedQuery {
                sql_query,
                reasoning,
                confidence,
            } = generated;

            if observation.is_success() {
                state.enter(RunPhase::Succeeded);
                tracing::info!(
                    %run_id,
                    iteration = state.iteration,
                    row_count = ?observation.digest().row_count,
                    elapsed_ms,
                    "Run succeeded"
                );
                steps.push(StepRecord {
                    iteration: state.iteration,
                    query: sql_query.clone(),
                    rationale: reasoning,
                    confidence,
                    observation: observation.clone(),
                    guidance: None,
                    elapsed_ms,
                });
                break RunOutcome::Succeeded {
                    observation,
                    query: sql_query,
                };
            }

            state.enter(RunPhase::ClassifyingError);
            let kind = observation.error_kind().unwrap_or(ErrorKind::UnknownError);
            tracing::info!(
                %run_id,
                iteration = state.iteration,
                error_kind = %kind,
                elapsed_ms,
                "Attempt failed"
            );

            let (guidance, abort) =
                evaluate_failure(&self.config, &mut state, kind, &sql_query, &observation);

            steps.push(StepRecord {
                iteration: state.iteration,
                query: sql_query.clone(),
                rationale: reasoning,
                confidence,
                observation: observation.clone(),
                guidance: guidance.clone(),
                elapsed_ms,
            });

            if let Some(reason) = abort {
                state.enter(RunPhase::Aborted);
                tracing::warn!(
                    %run_id,
                    iteration = state.iteration,
                    error_kind = %kind,
                    reason = %reason,
                    "Run aborted"
                );
                break RunOutcome::Aborted(FailureRecord::new(reason, observation, sql_query));
            }

            state.enter(RunPhase::Repairing);
            state.previous_query = Some(sql_query);
            state.previous_observation = Some(observation);
            state.guidance = guidance;
            state.iteration += 1;
        };

        Ok(self.report(run_id, question, started_at, steps, outcome))
    }

    fn report(
        &self,
        run_id: uuid::Uuid,
        question: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        steps: Vec<StepRecord>,
        outcome: RunOutcome,
    ) -> RunReport {
        RunReport {
            run_id,
            question: question.to_string(),
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            started_at,
            steps,
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sqlagent_exec::{DbFailure, FailureOrigin, QueryLimits, QueryOutput, SqlBackend};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // -----------------------------------------------------------------------
    // Scripted generator
    // -----------------------------------------------------------------------

    /// What the controller handed the generator on one call.
    #[derive(Debug, Clone)]
    struct SeenInput {
        dialect: String,
        previous_query: Option<String>,
        previous_error: Option<ErrorKind>,
        guidance: Option<RepairGuidance>,
    }

    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<GeneratedQuery>>>,
        seen: Arc<Mutex<Vec<SeenInput>>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<GeneratedQuery>>) -> Self {
            Self {
                replies: Mutex::new(VecDeque::from(replies)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn queries(sqls: &[&str]) -> Self {
            Self::new(
                sqls.iter()
                    .map(|sql| Ok(GeneratedQuery::new(*sql, "scripted", 0.7)))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl QueryGenerator for ScriptedGenerator {
        async fn generate(&self, input: &GenerationInput<'_>) -> Result<GeneratedQuery> {
            self.seen.lock().unwrap().push(SeenInput {
                dialect: input.dialect.to_string(),
                previous_query: input.previous_query.map(str::to_string),
                previous_error: input
                    .previous_observation
                    .as_ref()
                    .and_then(|d| d.error_kind),
                guidance: input.guidance.cloned(),
            });
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Other("script exhausted".into())))
        }
    }

    // -----------------------------------------------------------------------
    // Scripted backend
    // -----------------------------------------------------------------------

    struct ScriptedBackend {
        outputs: Mutex<VecDeque<std::result::Result<QueryOutput, DbFailure>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedBackend {
        fn new(outputs: Vec<std::result::Result<QueryOutput, DbFailure>>) -> Self {
            Self {
                outputs: Mutex::new(VecDeque::from(outputs)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SqlBackend for ScriptedBackend {
        async fn run_query(
            &self,
            _sql: &str,
            _limits: &QueryLimits,
        ) -> std::result::Result<QueryOutput, DbFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(QueryOutput::NoResultSet))
        }

        async fn describe_schema(&self) -> std::result::Result<String, DbFailure> {
            Ok(String::new())
        }

        async fn ping(&self) -> std::result::Result<(), DbFailure> {
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn rows() -> std::result::Result<QueryOutput, DbFailure> {
        Ok(QueryOutput::Rows {
            columns: vec!["customer_id".into(), "revenue".into()],
            rows: vec![vec![serde_json::json!("c1"), serde_json::json!(42.5)]],
        })
    }

    fn fail(kind: ErrorKind) -> std::result::Result<QueryOutput, DbFailure> {
        let (code, message) = match kind {
            ErrorKind::SyntaxError => ("42601", "syntax error at or near \"FORM\""),
            ErrorKind::TableNotFound => ("42P01", "relation \"order\" does not exist"),
            ErrorKind::ColumnNotFound => ("42703", "column \"price\" does not exist"),
            ErrorKind::AmbiguousColumn => ("42702", "column reference \"customer_id\" is ambiguous"),
            ErrorKind::AggregationError => ("42803", "column must appear in the GROUP BY clause"),
            ErrorKind::PermissionError => ("42501", "permission denied for table orders"),
            ErrorKind::Timeout => ("57014", "canceling statement due to statement timeout"),
            ErrorKind::UnknownError => ("22012", "division by zero"),
        };
        Err(DbFailure::new(FailureOrigin::Execute, Some(code), message))
    }

    struct Harness {
        agent: AgentLoop,
        seen: Arc<Mutex<Vec<SeenInput>>>,
        db_calls: Arc<AtomicUsize>,
    }

    fn harness(
        generator: ScriptedGenerator,
        outputs: Vec<std::result::Result<QueryOutput, DbFailure>>,
        config: AgentConfig,
    ) -> Harness {
        let seen = generator.seen.clone();
        let backend = ScriptedBackend::new(outputs);
        let db_calls = backend.calls.clone();
        let executor = QueryExecutor::new(Box::new(backend), QueryLimits::default());
        let agent = AgentLoop::new(
            Box::new(generator),
            executor,
            "orders(order_id text, customer_id text)",
            config,
        )
        .unwrap();
        Harness {
            agent,
            seen,
            db_calls,
        }
    }

    fn failure(outcome: &RunOutcome) -> &FailureRecord {
        match outcome {
            RunOutcome::Aborted(record) => record,
            other => panic!("expected abort, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    // Test 1: column_not_found is repaired and the second attempt succeeds
    #[tokio::test]
    async fn column_error_repaired_on_second_attempt() {
        let h = harness(
            ScriptedGenerator::queries(&[
                "SELECT customer_id, SUM(price) FROM orders GROUP BY customer_id",
                "SELECT o.customer_id, SUM(p.payment_value) FROM orders o JOIN order_payments p ON o.order_id = p.order_id GROUP BY o.customer_id",
            ]),
            vec![fail(ErrorKind::ColumnNotFound), rows()],
            AgentConfig::default(),
        );

        let report = h.agent.run_report("Revenue per customer").await.unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(report.outcome.final_observation().unwrap().iteration(), 2);
        assert_eq!(report.iterations(), 2);
        assert!(report.outcome.final_query().unwrap().contains("payment_value"));

        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].previous_query.is_none());
        assert!(seen[0].guidance.is_none());
        assert!(seen.iter().all(|s| s.dialect == "scripted"));
        assert!(seen[1]
            .previous_query
            .as_deref()
            .unwrap()
            .contains("SUM(price)"));
        assert_eq!(seen[1].previous_error, Some(ErrorKind::ColumnNotFound));
        assert!(seen[1].guidance.as_ref().unwrap().is_revise());

        assert!(report.steps[0].guidance.as_ref().unwrap().is_revise());
        assert!(report.steps[1].guidance.is_none());
    }

    // Test 2: the same recoverable kind twice in a row aborts on the repeat cap
    #[tokio::test]
    async fn repeated_table_error_aborts_at_iteration_two() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT * FROM order", "SELECT * FROM order"]),
            vec![fail(ErrorKind::TableNotFound), fail(ErrorKind::TableNotFound)],
            AgentConfig::default(),
        );

        let outcome = h.agent.run("All orders").await.unwrap();
        let record = failure(&outcome);
        assert_eq!(record.message, sqlagent_types::FAILURE_MESSAGE);
        assert_eq!(record.last_observation.iteration(), 2);
        assert_eq!(
            record.last_observation.error_kind(),
            Some(ErrorKind::TableNotFound)
        );
        assert_eq!(
            record.termination,
            AbortReason::RepeatedError {
                error_kind: ErrorKind::TableNotFound,
                repeats: 2
            }
        );
        assert_eq!(record.last_query, "SELECT * FROM order");
    }

    // Test 3: an unrecoverable kind aborts immediately without repair
    #[tokio::test]
    async fn timeout_aborts_immediately() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT * FROM huge_table"]),
            vec![fail(ErrorKind::Timeout)],
            AgentConfig::default(),
        );

        let report = h.agent.run_report("Everything").await.unwrap();
        let record = failure(&report.outcome);
        assert_eq!(record.last_observation.iteration(), 1);
        assert_eq!(
            record.termination,
            AbortReason::Unrecoverable {
                error_kind: ErrorKind::Timeout
            }
        );
        assert_eq!(report.steps.len(), 1);
        assert!(report.steps[0].guidance.is_none());
        assert_eq!(h.seen.lock().unwrap().len(), 1);
    }

    // Test 4: out-of-range confidence fails the run before any execution
    #[tokio::test]
    async fn contract_violation_fails_before_execution() {
        let h = harness(
            ScriptedGenerator::new(vec![Ok(GeneratedQuery::new("SELECT 1", "sure", 1.5))]),
            vec![rows()],
            AgentConfig::default(),
        );

        let err = h.agent.run("Anything").await.unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(h.db_calls.load(Ordering::SeqCst), 0);
    }

    // Test 5: four distinct recoverable errors exhaust the iteration cap
    #[tokio::test]
    async fn distinct_errors_exhaust_iterations() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT a", "SELECT b", "SELECT c", "SELECT d", "SELECT e"]),
            vec![
                fail(ErrorKind::ColumnNotFound),
                fail(ErrorKind::TableNotFound),
                fail(ErrorKind::AggregationError),
                fail(ErrorKind::AmbiguousColumn),
            ],
            AgentConfig::default(),
        );

        let report = h.agent.run_report("Hard question").await.unwrap();
        let record = failure(&report.outcome);
        assert_eq!(
            record.termination,
            AbortReason::IterationsExhausted { max_iterations: 4 }
        );
        assert_eq!(record.last_observation.iteration(), 4);
        assert_eq!(
            record.last_observation.error_kind(),
            Some(ErrorKind::AmbiguousColumn)
        );
        assert_eq!(record.last_query, "SELECT d");
        assert_eq!(h.seen.lock().unwrap().len(), 4);
        assert_eq!(h.db_calls.load(Ordering::SeqCst), 4);
    }

    // -----------------------------------------------------------------------
    // Policy edges
    // -----------------------------------------------------------------------

    // Test 6: syntax_error is recoverable but has no strategy
    #[tokio::test]
    async fn syntax_error_aborts_with_no_strategy() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT * FORM orders"]),
            vec![fail(ErrorKind::SyntaxError)],
            AgentConfig::default(),
        );

        let report = h.agent.run_report("Orders").await.unwrap();
        let record = failure(&report.outcome);
        match &record.termination {
            AbortReason::NoStrategy { error_kind, detail } => {
                assert_eq!(*error_kind, ErrorKind::SyntaxError);
                assert_eq!(detail, "no repair strategy for `syntax_error`");
            }
            other => panic!("expected no-strategy abort, got {other:?}"),
        }
        assert!(matches!(
            report.steps[0].guidance,
            Some(RepairGuidance::Abort { .. })
        ));
    }

    // Test 7: every unrecoverable kind aborts on first occurrence without guidance
    #[tokio::test]
    async fn unrecoverable_kinds_abort_on_first_occurrence() {
        for kind in [
            ErrorKind::PermissionError,
            ErrorKind::Timeout,
            ErrorKind::UnknownError,
        ] {
            let h = harness(
                ScriptedGenerator::queries(&["SELECT 1", "SELECT 2"]),
                vec![fail(kind)],
                AgentConfig::default(),
            );
            let report = h.agent.run_report("q").await.unwrap();
            let record = failure(&report.outcome);
            assert_eq!(record.last_observation.iteration(), 1, "{kind}");
            assert_eq!(
                record.termination,
                AbortReason::Unrecoverable { error_kind: kind }
            );
            assert!(report.steps[0].guidance.is_none(), "{kind}");
        }
    }

    // Test 8: a statement with no result set is a permission error and aborts
    #[tokio::test]
    async fn no_result_set_aborts_as_permission_error() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT 1"]),
            vec![Ok(QueryOutput::NoResultSet)],
            AgentConfig::default(),
        );
        let outcome = h.agent.run("q").await.unwrap();
        assert_eq!(
            outcome.final_observation().and_then(|o| o.error_kind()),
            Some(ErrorKind::PermissionError)
        );
    }

    // Test 9: the final iteration never exceeds max_iterations
    #[tokio::test]
    async fn iteration_never_exceeds_cap() {
        for max_iterations in 1..=5u32 {
            let outputs = (0..10)
                .map(|i| {
                    if i % 2 == 0 {
                        fail(ErrorKind::ColumnNotFound)
                    } else {
                        fail(ErrorKind::TableNotFound)
                    }
                })
                .collect();
            let sqls: Vec<String> = (0..10).map(|i| format!("SELECT {i}")).collect();
            let sql_refs: Vec<&str> = sqls.iter().map(String::as_str).collect();
            let h = harness(
                ScriptedGenerator::queries(&sql_refs),
                outputs,
                AgentConfig {
                    max_iterations,
                    ..AgentConfig::default()
                },
            );

            let outcome = h.agent.run("q").await.unwrap();
            let record = failure(&outcome);
            assert_eq!(record.last_observation.iteration(), max_iterations);
            assert_eq!(
                record.termination,
                AbortReason::IterationsExhausted { max_iterations }
            );
        }
    }

    // Test 10: repeat cap wins over iteration cap when both would trigger
    #[tokio::test]
    async fn repeat_cap_checked_before_iteration_cap() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT a", "SELECT a"]),
            vec![fail(ErrorKind::ColumnNotFound), fail(ErrorKind::ColumnNotFound)],
            AgentConfig {
                max_iterations: 2,
                ..AgentConfig::default()
            },
        );
        let outcome = h.agent.run("q").await.unwrap();
        assert!(matches!(
            failure(&outcome).termination,
            AbortReason::RepeatedError { .. }
        ));
    }

    // Test 11: a contract violation on a repair attempt still ends the run
    #[tokio::test]
    async fn contract_violation_mid_run() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT price FROM orders", "DELETE FROM orders"]),
            vec![fail(ErrorKind::ColumnNotFound), rows()],
            AgentConfig::default(),
        );
        let err = h.agent.run("q").await.unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(h.db_calls.load(Ordering::SeqCst), 1);
    }

    // Test 11b: the failure keeps the completed steps and the rejected query
    #[tokio::test]
    async fn contract_violation_keeps_partial_report() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT price FROM orders", "DELETE FROM orders"]),
            vec![fail(ErrorKind::ColumnNotFound)],
            AgentConfig::default(),
        );
        let failure = h.agent.run_report("q").await.unwrap_err();
        assert!(failure.error.is_contract_violation());
        assert!(failure.error.to_string().contains("DELETE FROM orders"));

        let report = &failure.report;
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].query, "SELECT price FROM orders");
        assert!(!report.outcome.is_success());
        assert!(report.outcome.final_observation().is_none());
        assert_eq!(report.outcome.final_query(), Some("DELETE FROM orders"));
        match &report.outcome {
            RunOutcome::GenerationFailed {
                iteration,
                rejected_query,
                ..
            } => {
                assert_eq!(*iteration, 2);
                assert_eq!(rejected_query.as_deref(), Some("DELETE FROM orders"));
            }
            other => panic!("expected generation failure, got {other:?}"),
        }
    }

    // Test 12: generator transport errors propagate unchanged
    #[tokio::test]
    async fn generator_error_propagates() {
        let h = harness(
            ScriptedGenerator::new(vec![Err(AgentError::RequestTimeout {
                provider: "google".into(),
            })]),
            vec![],
            AgentConfig::default(),
        );
        let err = h.agent.run("q").await.unwrap_err();
        assert!(matches!(err, AgentError::RequestTimeout { .. }));
        assert_eq!(h.db_calls.load(Ordering::SeqCst), 0);
    }

    // Test 13: first-try success carries no repair context
    #[tokio::test]
    async fn first_try_success() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT customer_id, revenue FROM v"]),
            vec![rows()],
            AgentConfig::default(),
        );
        let report = h.agent.run_report("q").await.unwrap();
        assert_eq!(report.iterations(), 1);
        let Observation::Success {
            row_count, rows, ..
        } = report.outcome.final_observation().unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(*row_count, rows.len());
        assert_eq!(report.provider, "gemini");
        assert_eq!(report.model, "gemini-2.5-flash");
    }

    // Test 14: outcome JSON matches the published shape
    #[tokio::test]
    async fn aborted_outcome_serializes_with_error_status() {
        let h = harness(
            ScriptedGenerator::queries(&["SELECT * FROM t"]),
            vec![fail(ErrorKind::Timeout)],
            AgentConfig::default(),
        );
        let outcome = h.agent.run("q").await.unwrap();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Query failed after multiple attempts");
        assert_eq!(json["last_observation"]["status"], "error");
        assert_eq!(json["last_observation"]["error_kind"], "timeout");
        assert_eq!(json["last_query"], "SELECT * FROM t");
    }

    #[test]
    fn invalid_config_rejected() {
        let backend = ScriptedBackend::new(vec![]);
        let executor = QueryExecutor::new(Box::new(backend), QueryLimits::default());
        let result = AgentLoop::new(
            Box::new(ScriptedGenerator::new(vec![])),
            executor,
            "",
            AgentConfig {
                max_iterations: 0,
                ..AgentConfig::default()
            },
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn zero_query_limits_rejected() {
        let backend = ScriptedBackend::new(vec![]);
        let limits = QueryLimits {
            max_rows: 0,
            ..QueryLimits::default()
        };
        let executor = QueryExecutor::new(Box::new(backend), limits);
        let result = AgentLoop::new(
            Box::new(ScriptedGenerator::new(vec![])),
            executor,
            "",
            AgentConfig::default(),
        );
        assert!(matches!(result, Err(AgentError::Config(m)) if m.contains("max_rows")));
    }
}
