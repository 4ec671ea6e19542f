//! Human-readable rendering for command output.

use chrono::{DateTime, Utc};
use queuectl_core::{Job, JobState};
use queuectl_infra::jobs::JobStats;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Left-aligned text table sized to its widest cells.
#[derive(Debug, Default)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(header: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, cells: Vec<String>) {
        self.rows.push(cells);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let len = cell.chars().count();
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(len),
                    None => widths.push(len),
                }
            }
        }

        let mut out = String::new();
        push_line(&mut out, &self.header, &widths);
        let rule_len = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        out.push_str(&"-".repeat(rule_len));
        out.push('\n');
        for row in &self.rows {
            push_line(&mut out, row, &widths);
        }
        out
    }
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let last = cells.len().saturating_sub(1);
    for (i, cell) in cells.iter().enumerate() {
        if i == last {
            out.push_str(cell);
        } else {
            let width = widths.get(i).copied().unwrap_or(0);
            out.push_str(&format!("{cell:<width$}  "));
        }
    }
    out.push('\n');
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let mut table = Table::new([
        "ID",
        "COMMAND",
        "STATE",
        "ATTEMPTS",
        "MAX RETRIES",
        "CREATED AT",
        "UPDATED AT",
    ]);
    for job in jobs {
        table.row(vec![
            job.id.to_string(),
            job.command.clone(),
            job.state.to_string(),
            job.attempts.to_string(),
            job.max_retries.to_string(),
            format_time(job.created_at),
            format_time(job.updated_at),
        ]);
    }
    table.render()
}

pub fn status_table(stats: &JobStats) -> String {
    let mut table = Table::new(["STATE", "COUNT"]);
    for state in JobState::ALL {
        table.row(vec![state.to_string(), stats.get(state).to_string()]);
    }
    table.row(vec!["total".to_string(), stats.total().to_string()]);
    table.render()
}
