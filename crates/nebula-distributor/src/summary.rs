//! End of run report

use comfy_table::{Cell, Color, Table};
use fleet_orchestration::{FailureRecord, RunSummary};

/// Hostname, address and reason for each failure
pub fn failure_table<'a>(failures: impl IntoIterator<Item = &'a FailureRecord>, color: Color) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["HOSTNAME", "ADDRESS", "REASON"]);
    for failure in failures {
        table.add_row(vec![
            Cell::new(&failure.hostname),
            Cell::new(failure.address),
            Cell::new(failure.reason()).fg(color),
        ]);
    }
    table
}

/// Print what the run did
pub fn print(summary: &RunSummary) {
    let completed: Vec<&str> = summary
        .completed()
        .map(|outcome| outcome.hostname.as_str())
        .collect();
    if !completed.is_empty() {
        println!("Completed: {}", completed.join(", "));
    }

    if summary.integrity_warnings().next().is_some() {
        println!("\nWarnings:");
        println!("{}", failure_table(summary.integrity_warnings(), Color::Yellow));
    }

    if summary.is_success() {
        println!("\nAll hosts processed successfully.");
    } else {
        println!("\nFailed hosts:");
        println!("{}", failure_table(summary.hard_failures(), Color::Red));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_orchestration::DistributionError;

    #[test]
    fn test_failure_table_rows() {
        let failures = vec![
            FailureRecord {
                hostname: "web1".to_string(),
                address: "10.42.0.10".parse().unwrap(),
                error: DistributionError::PortDown { port: 22 },
                hard: true,
            },
            FailureRecord {
                hostname: "lh1".to_string(),
                address: "10.42.0.1".parse().unwrap(),
                error: DistributionError::VerifyMismatch,
                hard: false,
            },
        ];

        let table = failure_table(&failures, Color::Red);
        assert_eq!(table.row_iter().count(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains("web1"));
        assert!(rendered.contains("10.42.0.10"));
        assert!(rendered.contains("port 22 down"));
        assert!(rendered.contains("failed to verify installed config"));
    }
}
