//! CSV export of the audit ledger for regulatory submission.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use csv::{QuoteStyle, WriterBuilder};

use super::AuditRecord;

const HEADER: [&str; 6] = [
    "Timestamp",
    "Event Type",
    "Rule Violated",
    "Severity",
    "Corrective Action",
    "AI Explanation",
];

/// Every field is quoted; absent values are empty strings.
pub fn export_csv(records: &[AuditRecord]) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .from_writer(Vec::new());
    writer.write_record(HEADER)?;

    for record in records {
        let entry = &record.entry;
        writer.write_record([
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true).as_str(),
            entry.event_type.as_str(),
            entry.rule_violated.as_deref().unwrap_or(""),
            entry.severity.map(|s| s.as_str()).unwrap_or(""),
            entry.corrective_action.as_deref().unwrap_or(""),
            record.narrative.as_deref().unwrap_or(""),
        ])?;
    }

    let bytes = writer.into_inner().context("Failed to flush CSV export")?;
    String::from_utf8(bytes).context("CSV export is not UTF-8")
}
