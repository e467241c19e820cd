//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    components: HashMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// The part of a job execution summary shown by `status`.
#[derive(Debug, Deserialize)]
struct JobSummary {
    job_id: String,
    job_name: String,
    state: String,
    position: Option<String>,
    avg_messages_per_second: f64,
    #[serde(default)]
    counters: BTreeMap<String, u64>,
    failure: Option<String>,
}

/// Show service health, jobs and metrics.
pub async fn run(url: &str) -> Result<()> {
    let base = url.trim_end_matches('/');
    println!("Checking health at {}...\n", base);

    let client = reqwest::Client::new();
    match client.get(format!("{}/health", base)).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the converter service running?");
            println!("Start it with: rawdata-converter serve --config <path-to-config>");
            return Ok(());
        }
    }

    println!("\n--- Jobs ---");
    let jobs: Vec<JobSummary> = client
        .get(format!("{}/jobs/execution-summary", base))
        .send()
        .await
        .context("Failed to fetch job summaries")?
        .json()
        .await
        .context("Failed to parse job summaries")?;
    print_jobs(&jobs);

    println!("\n--- Metrics ---");
    match client.get(format!("{}/metrics", base)).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => println!("Failed to fetch metrics: {}", e),
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        let mut names: Vec<_> = health.components.keys().collect();
        names.sort();
        for name in names {
            let status = &health.components[name];
            match &status.reason {
                Some(reason) => println!(
                    "  {} {}: {} ({})",
                    status_tag(&status.status),
                    name,
                    status.status,
                    reason
                ),
                None => println!("  {} {}: {}", status_tag(&status.status), name, status.status),
            }
        }
    }
}

fn print_jobs(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No jobs scheduled.");
        return;
    }
    for job in jobs {
        println!(
            "{} {} [{}] position={} processed={} written={} rate={:.1}/s",
            job.job_id,
            job.job_name,
            job.state,
            job.position.as_deref().unwrap_or("-"),
            format_number(job.counters.get("processed_messages").copied().unwrap_or(0)),
            format_number(job.counters.get("records_written").copied().unwrap_or(0)),
            job.avg_messages_per_second
        );
        if let Some(failure) = &job.failure {
            println!("    failure: {}", failure);
        }
    }
}

fn print_metrics(metrics_text: &str) {
    let mut values: HashMap<&str, f64> = HashMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            if let Ok(value) = parts[1].parse::<f64>() {
                values.insert(parts[0], value);
            }
        }
    }

    let rows = [
        ("converter_rawdata_messages_total{result=\"success\"}", "Converted:        "),
        ("converter_rawdata_messages_total{result=\"fail\"}", "Partial Failures: "),
        ("converter_rawdata_messages_total{result=\"skip\"}", "Skipped:          "),
        ("converter_rawdata_messages_total{result=\"unconvertible\"}", "Unconvertible:    "),
        ("converter_records_written_total", "Records Written:  "),
        ("converter_windows_flushed_total", "Windows Flushed:  "),
        ("converter_fatal_pauses_total", "Fatal Pauses:     "),
        ("converter_active_jobs", "Active Jobs:      "),
    ];
    let mut printed = false;
    for (metric, label) in rows {
        if let Some(v) = values.get(metric) {
            println!("{}{}", label, format_number(*v as u64));
            printed = true;
        }
    }

    if !printed {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }

    #[test]
    fn test_parse_job_summary() {
        let summary: JobSummary = serde_json::from_value(serde_json::json!({
            "job_id": "01H00000000000000000000000",
            "job_name": "freg",
            "state": "PAUSED",
            "position": "pos-3",
            "avg_messages_per_second": 1.5,
            "counters": { "processed_messages": 3 },
            "failure": "Storage error: boom",
            "pending_records": 3
        }))
        .unwrap();
        assert_eq!(summary.state, "PAUSED");
        assert_eq!(summary.counters["processed_messages"], 3);
    }
}
