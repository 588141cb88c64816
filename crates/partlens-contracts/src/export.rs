use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Final answer for one listing. `predicted_number` carries the literal
/// `NONE` when every photograph session exhausted;
/// `incorrect_image_links` holds every photo of the listing other than
/// the accepted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub predicted_number: String,
    pub url: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub correct_image_link: Option<String>,
    #[serde(default)]
    pub incorrect_image_links: Vec<String>,
}

/// Append-only `results.jsonl` writer. Records land on disk the moment a
/// listing is decided so a crash late in the run loses nothing.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ListingRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        use std::io::Write;
        file.write_all(serde_json::to_string(record)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Reads every record back, skipping blank lines.
    pub fn load(path: &Path) -> anyhow::Result<Vec<ListingRecord>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading results {}", path.display()))?;
        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ListingRecord = serde_json::from_str(line)
                .with_context(|| format!("invalid result record on line {}", index + 1))?;
            records.push(record);
        }
        Ok(records)
    }
}

pub const CSV_HEADER: &[&str] = &[
    "predicted_number",
    "url",
    "price",
    "correct_image_link",
    "incorrect_image_links",
];

/// Writes the spreadsheet dump. Incorrect links are joined with `", "` in
/// a single cell, the shape the downstream sheet tooling expects.
pub fn write_csv(path: &Path, records: &[ListingRecord]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    out.push_str(&CSV_HEADER.join(","));
    out.push('\n');
    for record in records {
        let row = [
            csv_field(&record.predicted_number),
            csv_field(&record.url),
            csv_field(record.price.as_deref().unwrap_or("")),
            csv_field(record.correct_image_link.as_deref().unwrap_or("")),
            csv_field(&record.incorrect_image_links.join(", ")),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    std::fs::write(path, out)
        .with_context(|| format!("failed writing csv {}", path.display()))?;
    Ok(())
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// End-of-run accounting written next to the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub listings_total: u64,
    pub listings_resolved: u64,
    pub listings_unresolved: u64,
    pub listings_skipped: u64,
    pub prompt_tokens: u64,
    pub reply_tokens: u64,
}

pub fn write_report(
    path: &Path,
    report: &RunReport,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(report.run_id.clone()));
    payload.insert(
        "started_at".to_string(),
        Value::String(report.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(report.finished_at.clone()),
    );
    payload.insert(
        "listings_total".to_string(),
        Value::Number(report.listings_total.into()),
    );
    payload.insert(
        "listings_resolved".to_string(),
        Value::Number(report.listings_resolved.into()),
    );
    payload.insert(
        "listings_unresolved".to_string(),
        Value::Number(report.listings_unresolved.into()),
    );
    payload.insert(
        "listings_skipped".to_string(),
        Value::Number(report.listings_skipped.into()),
    );
    payload.insert(
        "prompt_tokens".to_string(),
        Value::Number(report.prompt_tokens.into()),
    );
    payload.insert(
        "reply_tokens".to_string(),
        Value::Number(report.reply_tokens.into()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_csv, write_report, ListingRecord, ResultLog, RunReport};

    fn sample_record() -> ListingRecord {
        ListingRecord {
            predicted_number: "5K0 937 087 AC".to_string(),
            url: "https://example.test/listing/1".to_string(),
            price: Some("120 PLN".to_string()),
            correct_image_link: Some("https://img.test/2.jpg".to_string()),
            incorrect_image_links: vec![
                "https://img.test/1.jpg".to_string(),
                "https://img.test/3.jpg".to_string(),
            ],
        }
    }

    #[test]
    fn result_log_appends_and_loads_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results.jsonl");
        let log = ResultLog::new(&path);

        log.append(&sample_record())?;
        let mut second = sample_record();
        second.predicted_number = "NONE".to_string();
        second.correct_image_link = None;
        log.append(&second)?;

        let loaded = ResultLog::load(&path)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], sample_record());
        assert_eq!(loaded[1].predicted_number, "NONE");
        assert_eq!(loaded[1].correct_image_link, None);
        Ok(())
    }

    #[test]
    fn csv_joins_incorrect_links_in_one_cell() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results.csv");
        write_csv(&path, &[sample_record()])?;

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "predicted_number,url,price,correct_image_link,incorrect_image_links"
        );
        assert!(lines[1].contains("\"https://img.test/1.jpg, https://img.test/3.jpg\""));
        Ok(())
    }

    #[test]
    fn csv_escapes_quotes_and_commas() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results.csv");
        let mut record = sample_record();
        record.price = Some("1,200 \"PLN\"".to_string());
        record.incorrect_image_links = Vec::new();
        write_csv(&path, &[record])?;

        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("\"1,200 \"\"PLN\"\"\""));
        Ok(())
    }

    #[test]
    fn report_write_includes_extra_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let report = RunReport {
            run_id: "run-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            listings_total: 4,
            listings_resolved: 2,
            listings_unresolved: 1,
            listings_skipped: 1,
            prompt_tokens: 1200,
            reply_tokens: 340,
        };
        let mut extra = Map::new();
        extra.insert("model".to_string(), Value::String("gemini-1.5-pro".to_string()));
        write_report(&path, &report, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["listings_resolved"], json!(2));
        assert_eq!(parsed["model"], json!("gemini-1.5-pro"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
