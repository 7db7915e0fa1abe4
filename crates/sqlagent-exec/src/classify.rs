//! Maps a database failure to an [`ErrorKind`].
//!
//! Rules are tried in order and the first match wins, so the more specific
//! rules sit above the generic ones (an ambiguous column is reported before a
//! missing one; syntax is checked last because SQLite words many problems as
//! "syntax error"). Postgres failures are matched on SQLSTATE, SQLite failures
//! on their message text. Anything unmatched, including every connection
//! failure, is `UnknownError`.

use sqlagent_types::ErrorKind;

use crate::backend::{DbFailure, FailureOrigin};

struct Rule {
    kind: ErrorKind,
    matches: fn(&DbFailure) -> bool,
}

const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::Timeout,
        matches: is_timeout,
    },
    Rule {
        kind: ErrorKind::PermissionError,
        matches: is_permission,
    },
    Rule {
        kind: ErrorKind::AmbiguousColumn,
        matches: is_ambiguous_column,
    },
    Rule {
        kind: ErrorKind::ColumnNotFound,
        matches: is_missing_column,
    },
    Rule {
        kind: ErrorKind::TableNotFound,
        matches: is_missing_table,
    },
    Rule {
        kind: ErrorKind::AggregationError,
        matches: is_aggregation,
    },
    Rule {
        kind: ErrorKind::SyntaxError,
        matches: is_syntax,
    },
];

/// Classify a failure. Total: always returns a kind.
pub fn classify(failure: &DbFailure) -> ErrorKind {
    if failure.origin == FailureOrigin::Connect {
        return ErrorKind::UnknownError;
    }
    RULES
        .iter()
        .find(|rule| (rule.matches)(failure))
        .map(|rule| rule.kind)
        .unwrap_or(ErrorKind::UnknownError)
}

fn is_timeout(f: &DbFailure) -> bool {
    f.origin == FailureOrigin::Deadline
        || f.has_code("57014")
        || f.message_contains("canceling statement due to statement timeout")
        || f.message_contains("interrupted")
}

fn is_permission(f: &DbFailure) -> bool {
    f.has_code("42501")
        || f.has_code("25006")
        || f.message_contains("permission denied")
        || f.message_contains("read-only transaction")
        || f.message_contains("readonly database")
        || f.message_contains("not authorized")
}

fn is_ambiguous_column(f: &DbFailure) -> bool {
    f.has_code("42702") || f.message_contains("ambiguous column")
}

fn is_missing_column(f: &DbFailure) -> bool {
    f.has_code("42703") || f.message_contains("no such column")
}

fn is_missing_table(f: &DbFailure) -> bool {
    f.has_code("42P01") || f.message_contains("no such table")
}

fn is_aggregation(f: &DbFailure) -> bool {
    // 42803 is grouping_error: non-aggregated column outside GROUP BY, or an
    // aggregate in WHERE. 42P20 is windowing_error, the same mistake with
    // window functions.
    f.has_code("42803")
        || f.has_code("42P20")
        || f.message_contains("misuse of aggregate")
        || f.message_contains("misuse of window function")
        || f.message_contains("window functions are not allowed")
        || f.message_contains("must appear in the group by clause")
        || f.message_contains("aggregate functions are not allowed")
}

fn is_syntax(f: &DbFailure) -> bool {
    f.has_code("42601")
        || f.message_contains("syntax error")
        || f.message_contains("incomplete input")
        || f.message_contains("unrecognized token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::truncation::observation_message;

    fn pg(code: &str, message: &str) -> DbFailure {
        DbFailure::new(FailureOrigin::Execute, Some(code), message)
    }

    fn sqlite(message: &str) -> DbFailure {
        DbFailure::new(FailureOrigin::Execute, Some("1"), message)
    }

    #[test]
    fn postgres_sqlstates() {
        let cases = [
            ("42601", "syntax error at or near \"FORM\"", ErrorKind::SyntaxError),
            ("42P01", "relation \"order\" does not exist", ErrorKind::TableNotFound),
            ("42703", "column \"price\" does not exist", ErrorKind::ColumnNotFound),
            ("42702", "column reference \"customer_id\" is ambiguous", ErrorKind::AmbiguousColumn),
            (
                "42803",
                "column \"c.customer_city\" must appear in the GROUP BY clause or be used in an aggregate function",
                ErrorKind::AggregationError,
            ),
            (
                "42P20",
                "window functions are not allowed in WHERE",
                ErrorKind::AggregationError,
            ),
            ("42501", "permission denied for table orders", ErrorKind::PermissionError),
            ("25006", "cannot execute DELETE in a read-only transaction", ErrorKind::PermissionError),
            ("57014", "canceling statement due to statement timeout", ErrorKind::Timeout),
        ];
        for (code, message, expected) in cases {
            assert_eq!(classify(&pg(code, message)), expected, "{code}: {message}");
        }
    }

    #[test]
    fn sqlite_messages() {
        let cases = [
            ("no such table: order", ErrorKind::TableNotFound),
            ("no such column: o.price", ErrorKind::ColumnNotFound),
            ("ambiguous column name: customer_id", ErrorKind::AmbiguousColumn),
            ("near \"FORM\": syntax error", ErrorKind::SyntaxError),
            ("misuse of aggregate: COUNT()", ErrorKind::AggregationError),
            ("misuse of window function row_number()", ErrorKind::AggregationError),
            ("attempt to write a readonly database", ErrorKind::PermissionError),
            ("interrupted", ErrorKind::Timeout),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&sqlite(message)), expected, "{message}");
        }
    }

    #[test]
    fn deadline_is_timeout() {
        assert_eq!(classify(&DbFailure::deadline(100)), ErrorKind::Timeout);
    }

    #[test]
    fn connection_failures_are_unknown() {
        let f = DbFailure::new(
            FailureOrigin::Connect,
            Some("28P01"),
            "password authentication failed for user \"postgres\"",
        );
        assert_eq!(classify(&f), ErrorKind::UnknownError);

        // Even when the text would otherwise look like a known kind.
        let f = DbFailure::new(FailureOrigin::Connect, None, "no such table: pg_hba");
        assert_eq!(classify(&f), ErrorKind::UnknownError);
    }

    #[test]
    fn unmatched_is_unknown() {
        assert_eq!(
            classify(&pg("22012", "division by zero")),
            ErrorKind::UnknownError
        );
        assert_eq!(classify(&sqlite("database disk image is malformed")), ErrorKind::UnknownError);
    }

    #[test]
    fn ambiguous_wins_over_missing_column() {
        // A message naming both must resolve to the more specific kind.
        let f = sqlite("ambiguous column name: id (no such column in outer scope)");
        assert_eq!(classify(&f), ErrorKind::AmbiguousColumn);
    }

    #[test]
    fn classification_is_stable_across_reobservation() {
        // What the executor keeps of a failure must classify the same way again.
        let failures = [
            pg("42703", "column \"price\" does not exist\nLINE 1: SELECT price FROM orders\n               ^"),
            pg("42P20", "window functions are not allowed in GROUP BY"),
            pg("22012", "division by zero"),
            sqlite("ambiguous column name: customer_id"),
            sqlite("no such table: order"),
            sqlite(&format!("near \"FORM\": syntax error {}", "x".repeat(1000))),
            DbFailure::deadline(50),
        ];
        for failure in failures {
            let kind = classify(&failure);
            assert_eq!(classify(&failure), kind, "{failure}");

            let observed = DbFailure {
                message: observation_message(&failure.message),
                ..failure.clone()
            };
            assert_eq!(classify(&observed), kind, "{failure}");
            assert_eq!(classify(&observed), classify(&observed.clone()));
        }
    }
}
