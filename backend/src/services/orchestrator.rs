use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::{ExecutionResult, NaturalLanguageQueryResponse, QuerySession, QueryStage};
use crate::services::llm_service::SqlGenerator;
use crate::services::query_executor::QueryExecutor;
use crate::services::schema_context::SchemaContextBuilder;
use crate::services::session_store::{Dataset, SessionStore};
use crate::validation::SqlValidator;

/// Drives one natural-language request from question to result
pub struct QueryOrchestrator {
    sessions: Arc<SessionStore>,
    context_builder: SchemaContextBuilder,
    generator: Arc<dyn SqlGenerator>,
    executor: QueryExecutor,
}

/// Stage tracking for a single request
struct Turn<'a> {
    dataset_id: &'a str,
    stage: QueryStage,
}

impl<'a> Turn<'a> {
    fn start(dataset_id: &'a str) -> Self {
        tracing::debug!(dataset_id, stage = ?QueryStage::BuildingContext, "Query turn started");
        Self {
            dataset_id,
            stage: QueryStage::BuildingContext,
        }
    }

    fn advance(&mut self, next: QueryStage) {
        tracing::debug!(dataset_id = self.dataset_id, from = ?self.stage, to = ?next, "Query stage transition");
        self.stage = next;
    }

    /// Record a terminal failure and pass the error through
    fn fail(&mut self, err: AppError) -> AppError {
        tracing::info!(dataset_id = self.dataset_id, stage = ?self.stage, code = err.code(), "Query turn failed");
        self.stage = QueryStage::Failed;
        err
    }
}

impl QueryOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        context_builder: SchemaContextBuilder,
        generator: Arc<dyn SqlGenerator>,
        executor: QueryExecutor,
    ) -> Self {
        Self {
            sessions,
            context_builder,
            generator,
            executor,
        }
    }

    /// Answer a question about a dataset.
    ///
    /// Generated SQL that fails validation is returned with the violation and
    /// no results. Without `autorun` the validated SQL comes back as a
    /// session awaiting confirmation.
    pub async fn ask(
        &self,
        dataset_id: &str,
        prompt: &str,
        autorun: bool,
    ) -> Result<NaturalLanguageQueryResponse, AppError> {
        let mut turn = Turn::start(dataset_id);

        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(turn.fail(AppError::BadRequest("Question cannot be empty".to_string())));
        }

        let dataset = self.sessions.get(dataset_id).await.map_err(|e| turn.fail(e))?;
        let context = self.context_builder.build(dataset.schema(), Some(prompt));

        turn.advance(QueryStage::AwaitingGeneration);
        let candidate = self
            .generator
            .generate_sql(prompt, &context)
            .await
            .map_err(|e| match e {
                AppError::Generation(_) => e,
                other => AppError::Generation(other.to_string()),
            })
            .map_err(|e| turn.fail(e))?;

        turn.advance(QueryStage::Validating);
        let validated = match SqlValidator::validate_and_prepare(
            &candidate,
            dataset.store.table_name(),
            self.executor.row_cap(),
        ) {
            Ok(validated) => validated,
            Err(violation) => {
                tracing::info!(dataset_id, code = %violation.code, "Generated SQL rejected");
                turn.advance(QueryStage::Failed);
                return Ok(NaturalLanguageQueryResponse {
                    sql: candidate,
                    autorun,
                    results: None,
                    stage: turn.stage,
                    session: None,
                    violation: Some(violation),
                });
            }
        };

        if !autorun {
            turn.advance(QueryStage::AwaitingConfirmation);
            return Ok(NaturalLanguageQueryResponse {
                sql: validated.sql.clone(),
                autorun,
                results: None,
                stage: turn.stage,
                session: Some(QuerySession {
                    dataset_id: dataset_id.to_string(),
                    candidate_sql: validated.sql,
                }),
                violation: None,
            });
        }

        turn.advance(QueryStage::Executing);
        let results = self
            .executor
            .execute(&dataset.store, &validated.sql)
            .await
            .map_err(|e| turn.fail(e))?;

        turn.advance(QueryStage::Done);
        Ok(NaturalLanguageQueryResponse {
            sql: validated.sql,
            autorun,
            results: Some(results),
            stage: turn.stage,
            session: None,
            violation: None,
        })
    }

    /// Run SQL the caller has confirmed or written. It is validated again;
    /// a violation is an error here.
    pub async fn execute_confirmed(&self, dataset_id: &str, sql: &str) -> Result<ExecutionResult, AppError> {
        let mut turn = Turn::start(dataset_id);
        let dataset = self.sessions.get(dataset_id).await.map_err(|e| turn.fail(e))?;

        turn.advance(QueryStage::Validating);
        self.validate_and_run(&dataset, sql, &mut turn).await
    }

    async fn validate_and_run(
        &self,
        dataset: &Dataset,
        sql: &str,
        turn: &mut Turn<'_>,
    ) -> Result<ExecutionResult, AppError> {
        let validated = SqlValidator::validate_and_prepare(sql, dataset.store.table_name(), self.executor.row_cap())
            .map_err(|violation| turn.fail(violation.into()))?;

        turn.advance(QueryStage::Executing);
        let results = self
            .executor
            .execute(&dataset.store, &validated.sql)
            .await
            .map_err(|e| turn.fail(e))?;

        turn.advance(QueryStage::Done);
        Ok(results)
    }
}
