//! Generation prompt builder.
//!
//! Assembles the prompt sent to the language model from ordered sections:
//! schema, question, and (on repair attempts) the previous query, the reduced
//! last observation, and the repair strategy. The standing rules travel
//! separately as system instructions, see [`base_rules`].

use sqlagent_types::{ObservationDigest, RepairGuidance, Result};

const RULES: &str = "Return ONLY JSON with keys: sql_query, reasoning, confidence.
Rules:
- Only generate a single SELECT query (no INSERT/UPDATE/DELETE/DDL).
- Use table/column names exactly as in the schema.
- Prefer explicit JOINs and explicit GROUP BY when aggregating.";

/// Display name of the SQL dialect a backend speaks.
pub fn dialect_label(backend: &str) -> &str {
    match backend {
        "postgres" => "PostgreSQL",
        "sqlite" => "SQLite",
        other => other,
    }
}

/// System instructions for a backend, naming its dialect.
pub fn base_rules(backend: &str) -> String {
    format!(
        "You are a SQL assistant for {}.\n{}",
        dialect_label(backend),
        RULES
    )
}

pub const OUTPUT_EXAMPLE: &str =
    r#"{"sql_query":"SELECT ...","reasoning":"...","confidence":0.7}"#;

/// Builds the generation prompt.
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
}

#[derive(Debug, Clone)]
struct PromptSection {
    heading: String,
    content: String,
    priority: u8, // 0 = highest
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
        }
    }

    fn push(mut self, heading: &str, content: String, priority: u8) -> Self {
        self.sections.push(PromptSection {
            heading: heading.to_string(),
            content,
            priority,
        });
        self
    }

    pub fn with_schema(self, schema: &str) -> Self {
        self.push("DATABASE SCHEMA", schema.trim().to_string(), 1)
    }

    pub fn with_question(self, question: &str) -> Self {
        self.push("NATURAL LANGUAGE QUESTION", question.trim().to_string(), 2)
    }

    pub fn with_previous_query(self, query: Option<&str>) -> Self {
        match query {
            Some(q) if !q.trim().is_empty() => self.push("PREVIOUS SQL QUERY", q.trim().to_string(), 3),
            _ => self,
        }
    }

    pub fn with_observation(self, digest: Option<&ObservationDigest>) -> Result<Self> {
        match digest {
            Some(d) => Ok(self.push("LAST OBSERVATION", serde_json::to_string(d)?, 4)),
            None => Ok(self),
        }
    }

    pub fn with_guidance(self, guidance: Option<&RepairGuidance>) -> Result<Self> {
        match guidance {
            Some(g) => Ok(self.push("REPAIR STRATEGY", serde_json::to_string(g)?, 5)),
            None => Ok(self),
        }
    }

    pub fn with_output_example(self, example: &str) -> Self {
        self.push("Output format example", example.to_string(), 6)
    }

    /// Build the final prompt.
    pub fn build(mut self) -> String {
        self.sections.sort_by_key(|s| s.priority);
        self.sections
            .iter()
            .map(|section| format!("{}:\n{}", section.heading, section.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sqlagent_types::{ErrorKind, Observation};

    #[test]
    fn first_attempt_prompt_has_no_repair_sections() {
        let prompt = PromptBuilder::new()
            .with_schema("orders(order_id text)")
            .with_question("How many orders?")
            .with_previous_query(None)
            .with_observation(None)
            .unwrap()
            .with_guidance(None)
            .unwrap()
            .with_output_example(OUTPUT_EXAMPLE)
            .build();

        assert!(prompt.starts_with("DATABASE SCHEMA:\norders(order_id text)"));
        assert!(!prompt.contains("You are a SQL assistant"));
        assert!(prompt.contains("NATURAL LANGUAGE QUESTION:\nHow many orders?"));
        assert!(!prompt.contains("PREVIOUS SQL QUERY"));
        assert!(!prompt.contains("LAST OBSERVATION"));
        assert!(!prompt.contains("REPAIR STRATEGY"));
        assert!(prompt.ends_with(OUTPUT_EXAMPLE));
    }

    #[test]
    fn sections_ordered_by_priority_regardless_of_insertion() {
        let obs = Observation::error(1, ErrorKind::ColumnNotFound, "column \"price\" does not exist", None);
        let guidance = RepairGuidance::ReviseQuery {
            instructions: "fix columns".into(),
            constraints: vec!["Use only existing columns".into()],
        };
        let prompt = PromptBuilder::new()
            .with_guidance(Some(&guidance))
            .unwrap()
            .with_output_example(OUTPUT_EXAMPLE)
            .with_previous_query(Some("SELECT price FROM orders"))
            .with_observation(Some(&obs.digest()))
            .unwrap()
            .with_question("Total revenue?")
            .with_schema("orders(order_id text)")
            .build();

        let positions: Vec<usize> = [
            "DATABASE SCHEMA",
            "NATURAL LANGUAGE QUESTION",
            "PREVIOUS SQL QUERY",
            "LAST OBSERVATION",
            "REPAIR STRATEGY",
            "Output format example",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{prompt}");
    }

    #[test]
    fn observation_section_is_reduced() {
        let obs = Observation::success(2, vec!["n".into()], vec![vec![serde_json::json!(42)]]);
        let prompt = PromptBuilder::new()
            .with_observation(Some(&obs.digest()))
            .unwrap()
            .build();
        assert!(prompt.contains("\"row_count\":1"));
        assert!(prompt.contains("\"columns\":[\"n\"]"));
        // Row values are not echoed back to the model.
        assert!(!prompt.contains("42"));
    }

    #[test]
    fn guidance_serialized_with_action_tag() {
        let guidance = RepairGuidance::ReviseQuery {
            instructions: "qualify columns".into(),
            constraints: vec![],
        };
        let prompt = PromptBuilder::new()
            .with_guidance(Some(&guidance))
            .unwrap()
            .build();
        assert!(prompt.contains("\"action\":\"revise_query\""));
    }

    #[test]
    fn blank_previous_query_is_skipped() {
        let prompt = PromptBuilder::new().with_previous_query(Some("  ")).build();
        assert!(prompt.is_empty());
    }

    #[test]
    fn rules_name_the_backend_dialect() {
        assert!(base_rules("postgres").starts_with("You are a SQL assistant for PostgreSQL.\n"));
        assert!(base_rules("sqlite").starts_with("You are a SQL assistant for SQLite.\n"));
        assert!(base_rules("duckdb").starts_with("You are a SQL assistant for duckdb.\n"));
        assert!(base_rules("sqlite").contains("Only generate a single SELECT query"));
    }
}
