use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::dispatcher::{Outcome, SkipReason};
use crate::engine::EngineOutput;
use crate::output::{OutputSummary, RuntimeMode};
use crate::transform::WeaveStats;

const TOOL_NAME: &str = "nullcheck-weaver";

/// JSON summary of one weaving run.
#[derive(Debug, Serialize)]
pub(crate) struct WeaveReport {
    pub(crate) tool: ToolInfo,
    pub(crate) root_package: String,
    pub(crate) runtime: RuntimeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) trace_id: Option<String>,
    pub(crate) class_count: usize,
    pub(crate) rewritten_count: usize,
    pub(crate) classpath_class_count: usize,
    pub(crate) output: OutputSummary,
    pub(crate) totals: WeaveStats,
    pub(crate) classes: Vec<ClassReport>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ToolInfo {
    pub(crate) name: &'static str,
    pub(crate) version: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ClassReport {
    pub(crate) name: String,
    /// `rewritten`, or the reason the class was left unchanged.
    pub(crate) status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) guards: Option<WeaveStats>,
}

/// Run-level values that do not come from the engine.
pub(crate) struct ReportContext<'a> {
    pub(crate) root_package: &'a str,
    pub(crate) runtime: RuntimeMode,
    pub(crate) trace_id: Option<String>,
    pub(crate) classpath_class_count: usize,
}

pub(crate) fn build_report(
    context: ReportContext<'_>,
    woven: &EngineOutput,
    output: OutputSummary,
) -> WeaveReport {
    let classes = woven
        .classes
        .iter()
        .map(|class| match &class.outcome {
            Outcome::Rewritten(rewritten) => ClassReport {
                name: class.name.clone(),
                status: "rewritten",
                detail: None,
                guards: Some(rewritten.stats.clone()),
            },
            Outcome::Unchanged(reason) => ClassReport {
                name: class.name.clone(),
                status: reason.label(),
                detail: match reason {
                    SkipReason::Malformed(message) => Some(message.clone()),
                    _ => None,
                },
                guards: None,
            },
        })
        .collect();

    WeaveReport {
        tool: ToolInfo {
            name: TOOL_NAME,
            version: env!("CARGO_PKG_VERSION"),
        },
        root_package: context.root_package.to_string(),
        runtime: context.runtime,
        trace_id: context.trace_id,
        class_count: woven.classes.len(),
        rewritten_count: woven.rewritten_count(),
        classpath_class_count: context.classpath_class_count,
        output,
        totals: woven.totals.clone(),
        classes,
    }
}

pub(crate) fn write_report(writer: &mut dyn Write, report: &WeaveReport) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, report).context("failed to serialize report")?;
    writer.write_all(b"\n").context("failed to write report")?;
    Ok(())
}
