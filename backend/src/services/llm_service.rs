use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::json;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::config::LlmConfig;

/// Turns a question plus schema context into candidate SQL
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema_context: &str) -> Result<String, AppError>;
}

/// LLM service generating SQLite SELECT queries from natural language
pub struct LlmService {
    gateway_url: String,
    api_key: Option<String>,
    http_client: HttpClient,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self, AppError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        if config.gateway_url.is_empty() {
            tracing::warn!("No LLM gateway configured; questions will use rule-based SQL generation");
        }

        Ok(Self {
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            http_client,
        })
    }

    fn build_prompt(question: &str, schema_context: &str) -> String {
        format!(
            r#"You are a SQL expert. Given a table schema and a natural language question, generate a valid SQLite SELECT query.

{schema_context}
Question: {question}

Instructions:
1. Generate ONLY a single SQLite SELECT query against the table above
2. Do not include any explanations or markdown formatting
3. Use the exact table and column names from the schema
4. If the question asks how many, use COUNT(*)
5. If the question asks about specific columns, select only those columns
6. Use double quotes for identifiers and single quotes for strings

SQL Query:"#,
            schema_context = schema_context,
            question = question,
        )
    }

    async fn call_llm_api(&self, prompt: &str) -> Result<String, AppError> {
        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "prompt": prompt,
            "max_tokens": 500,
            "temperature": 0.1,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Generation(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Generation(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Generation(format!("Failed to parse LLM response: {}", e)))?;

        let text = result["text"]
            .as_str()
            .or_else(|| result["content"].as_str())
            .or_else(|| result["response"].as_str())
            .ok_or_else(|| AppError::Generation("LLM response does not contain SQL".to_string()))?;

        let sql = strip_code_fence(text);
        if sql.is_empty() {
            return Err(AppError::Generation("LLM returned an empty query".to_string()));
        }
        Ok(sql)
    }
}

#[async_trait]
impl SqlGenerator for LlmService {
    async fn generate_sql(&self, question: &str, schema_context: &str) -> Result<String, AppError> {
        if self.gateway_url.is_empty() {
            return Ok(fallback_sql_generation(question, schema_context));
        }
        let prompt = Self::build_prompt(question, schema_context);
        self.call_llm_api(&prompt).await
    }
}

/// Remove a surrounding markdown code fence, with or without a language tag
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag on the opening line, if any
    let body = match body.split_once('\n') {
        Some((tag, rest)) if !tag.trim().contains(' ') => rest,
        _ => body,
    };
    body.trim_end().trim_end_matches("```").trim().to_string()
}

/// Rule-based SQL used when no gateway is configured: a row count for
/// "how many" style questions, otherwise every column
fn fallback_sql_generation(question: &str, schema_context: &str) -> String {
    let table_name = schema_context
        .lines()
        .find_map(|line| line.strip_prefix("Table: "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("data");

    let lowered = question.to_lowercase();
    let is_count_query = ["how many", "count", "number of", "total rows"]
        .iter()
        .any(|pattern| lowered.contains(pattern));

    let sql = if is_count_query {
        format!("SELECT COUNT(*) FROM {}", table_name)
    } else {
        format!("SELECT * FROM {}", table_name)
    };

    tracing::warn!("Using fallback SQL generation. Configure LLM_GATEWAY_URL for better results. Generated: {}", sql);
    sql
}
