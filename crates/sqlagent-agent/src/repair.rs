//! Repair strategist: maps an error kind to guidance for the next attempt.

use sqlagent_types::{ErrorKind, Observation, RepairGuidance};

/// Choose guidance for a failed attempt.
///
/// Pure and total. Kinds without a strategy (including the unrecoverable
/// ones) yield `Abort`.
pub fn strategize(
    kind: ErrorKind,
    _previous_query: &str,
    _observation: &Observation,
) -> RepairGuidance {
    match kind {
        ErrorKind::ColumnNotFound => revise(
            "One or more referenced columns do not exist. \
             Review the schema and ensure all columns are valid. \
             Add necessary joins or correct column names.",
            &["Use only existing columns", "Verify joins explicitly"],
        ),
        ErrorKind::TableNotFound => revise(
            "One or more referenced tables do not exist. \
             Check every table name against the schema and use the exact spelling.",
            &["Use only tables listed in the schema"],
        ),
        ErrorKind::AggregationError => revise(
            "The query mixes aggregated and non-aggregated columns incorrectly. \
             Every selected column that is not inside an aggregate function must appear in GROUP BY.",
            &[
                "Add non-aggregated columns to GROUP BY",
                "Do not use aggregates in WHERE; use HAVING",
            ],
        ),
        ErrorKind::AmbiguousColumn => revise(
            "A column name exists in more than one joined table. \
             Qualify every column with its table alias.",
            &["Qualify columns with table aliases"],
        ),
        ErrorKind::SyntaxError
        | ErrorKind::PermissionError
        | ErrorKind::Timeout
        | ErrorKind::UnknownError => RepairGuidance::Abort {
            reason: format!("no repair strategy for `{kind}`"),
        },
    }
}

fn revise(instructions: &str, constraints: &[&str]) -> RepairGuidance {
    RepairGuidance::ReviseQuery {
        instructions: instructions.to_string(),
        constraints: constraints.iter().map(|c| c.to_string()).collect(),
    }
}
