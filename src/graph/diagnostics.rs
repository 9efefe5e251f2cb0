use std::collections::HashMap;
use std::fmt::{self, Write};
use std::time::{Duration, Instant};

use crate::core::RunMode;
use crate::resource::{ResourceId, Resources};
use crate::task::{Evaluation, Status, TaskId, TaskKind};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of every task that did work during a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    /// Gantt style SVG of the run, one row per task.
    pub fn render_waterfall(&self) -> String {
        let mut output = String::new();
        let _ = self.write_waterfall(&mut output);
        output
    }

    pub fn render_waterfall_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }

    fn write_waterfall(&self, output: &mut String) -> fmt::Result {
        let mut ran: Vec<_> = self.execution_times.iter().collect();
        ran.sort_by(|a, b| (a.1.start, a.0).cmp(&(b.1.start, b.0)));

        let (Some((_, first)), Some(end)) = (
            ran.first(),
            ran.iter().map(|(_, t)| t.start + t.duration).max(),
        ) else {
            return write!(
                output,
                r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#
            );
        };

        let global_start = first.start;
        let total_micros = end.duration_since(global_start).as_micros().max(1) as f64;

        let row_height = 30;
        let label_width = 300;
        let chart_width = 800;
        let padding = 10;
        let header_height = 30;
        let text_space = 80;

        let width = label_width + chart_width + padding * 3 + text_space;
        let height = header_height + ran.len() as u32 * row_height + padding;

        writeln!(
            output,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg">
    <style>
        .task-row:nth-child(even) {{ fill: #f9f9f9; }}
        .task-row:nth-child(odd) {{ fill: #ffffff; }}
        text {{ font-family: sans-serif; font-size: 12px; }}
        .bar {{ fill: #3b82f6; rx: 4; }}
        .label {{ fill: #333; }}
        .time {{ fill: #666; font-size: 11px; }}
        .grid-line {{ stroke: #e5e7eb; stroke-width: 1; }}
        .axis-label {{ fill: #9ca3af; font-size: 10px; }}
    </style>
    <rect width="100%" height="100%" fill="white" />"#
        )?;

        for i in 0..=5 {
            let pct = i as f64 / 5.0;
            let x = label_width as f64 + padding as f64 + chart_width as f64 * pct;
            let label = format_micros(total_micros * pct);
            writeln!(
                output,
                r#"    <line x1="{x}" y1="{header_height}" x2="{x}" y2="{height}" class="grid-line" />
    <text x="{x}" y="{y}" text-anchor="middle" class="axis-label">{label}</text>"#,
                y = header_height - 5,
            )?;
        }

        for (i, (id, exec)) in ran.iter().enumerate() {
            let y = header_height + i as u32 * row_height;
            let name = escape(&id.to_string());

            let offset = exec.start.duration_since(global_start).as_micros() as f64;
            let micros = exec.duration.as_micros() as f64;
            let bar_x = label_width as f64 + padding as f64 + offset / total_micros * chart_width as f64;
            let bar_width = (micros / total_micros * chart_width as f64).max(1.0);

            writeln!(
                output,
                r#"    <rect x="0" y="{y}" width="{width}" height="{row_height}" class="task-row" />
    <text x="{padding}" y="{mid}" class="label" dominant-baseline="middle">{name}</text>
    <rect x="{bar_x}" y="{bar_y}" width="{bar_width}" height="{bar_height}" class="bar"><title>{name}: {dur:.2?}</title></rect>
    <text x="{text_x}" y="{mid}" class="time" dominant-baseline="middle">{label}</text>"#,
                mid = y + row_height / 2,
                bar_y = y + 5,
                bar_height = row_height - 10,
                dur = exec.duration,
                text_x = bar_x + bar_width + 5.0,
                label = format_micros(micros),
            )?;
        }

        write!(output, "</svg>")
    }
}

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    pub evaluation: Evaluation,
    pub status: Status,
}

/// What a run did, in completion order.
#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    /// Every resource offered by the workflow's tasks.
    pub resources: Resources,
    pub tasks: Vec<TaskReport>,
    pub diagnostics: Diagnostics,
}

impl RunReport {
    /// Resources that changed, or would have changed under [`RunMode::Pretend`].
    pub fn dirty(&self) -> Vec<ResourceId> {
        self.resources.dirty()
    }

    fn select(&self, pick: impl Fn(&Evaluation) -> bool) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .filter(|report| report.id.kind != TaskKind::Finish)
            .filter(|report| pick(&report.evaluation))
            .map(|report| &report.id)
            .collect()
    }

    /// Tasks that ran or, in a pretend run, would have run.
    pub fn would_run(&self) -> Vec<&TaskId> {
        self.select(|e| matches!(e, Evaluation::Pretended | Evaluation::Executed))
    }

    pub fn executed(&self) -> Vec<&TaskId> {
        self.select(|e| matches!(e, Evaluation::Executed))
    }

    pub fn failed(&self) -> Vec<&TaskId> {
        self.select(Evaluation::is_failed)
    }
}
