//! Local command execution through `sh -c`
//!
//! The command output is shaped into a table in this order:
//!
//! 1. line window `beginAtLineNumber..=endAtLineNumber` (1-based, inclusive)
//! 2. `keepOnlyRegExp` / `excludeRegExp` line filters
//! 3. split on any of the `separators` characters, empty pieces kept
//! 4. `selectColumns` projection (`"1,3,5-7"`)

use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{instrument, trace};

use crate::config::HostConfiguration;
use crate::connector::{Criterion, CriterionType, Source, SourceKind, SourceType};
use crate::error::{EngineError, EngineResult};
use crate::table::{SourceTable, TABLE_SEP};

use super::{CriterionTestResult, ProtocolExtension};

/// Protocol name this extension answers to in the host configuration
const PROTOCOL: &str = "oscommand";

#[derive(Debug, Clone, Copy, Default)]
pub struct OsCommandExtension;

#[async_trait]
impl ProtocolExtension for OsCommandExtension {
    fn identifier(&self) -> &'static str {
        "oscommand"
    }

    fn is_valid_configuration(&self, protocol: &str, configuration: &serde_json::Value) -> bool {
        protocol.eq_ignore_ascii_case(PROTOCOL) && configuration.is_object()
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::OsCommand]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::OsCommand]
    }

    #[instrument(skip_all, fields(host = %host.hostname, source = %source.key))]
    async fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        host: &HostConfiguration,
    ) -> EngineResult<SourceTable> {
        let SourceKind::OsCommand {
            command_line,
            keep_only_reg_exp,
            exclude_reg_exp,
            begin_at_line_number,
            end_at_line_number,
            separators,
            select_columns,
        } = &source.kind
        else {
            return Err(EngineError::Unsupported {
                extension: "oscommand",
                variant: source.source_type().to_string(),
            });
        };

        trace!("{connector_id}: running {command_line}");
        let output = run_command(command_line).await?;

        let lines = select_lines(&output, *begin_at_line_number, *end_at_line_number);
        let lines = filter_lines(lines, keep_only_reg_exp.as_deref(), exclude_reg_exp.as_deref())?;

        let columns = select_columns
            .as_deref()
            .map(parse_column_selection)
            .unwrap_or_default();
        let separators = separators.as_deref().unwrap_or(TABLE_SEP);

        let rows = lines
            .into_iter()
            .map(|line| split_and_select(line, separators, &columns))
            .collect();

        Ok(SourceTable {
            rows,
            headers: None,
            raw_data: Some(output),
        })
    }

    async fn process_criterion(
        &self,
        criterion: &Criterion,
        _connector_id: &str,
        _host: &HostConfiguration,
    ) -> CriterionTestResult {
        let Criterion::OsCommand {
            command_line,
            expected_result,
        } = criterion
        else {
            return CriterionTestResult::failure(
                format!("oscommand cannot test {}", criterion.criterion_type()),
                None,
            );
        };

        let description = format!("OS command '{command_line}'");
        match run_command(command_line).await {
            Ok(output) => {
                CriterionTestResult::from_output(&description, output, expected_result.as_deref())
            }
            Err(e) => CriterionTestResult::failure(format!("{description} failed: {e}"), None),
        }
    }
}

/// Run a shell command and return its standard output
///
/// The child is killed if the future is dropped, so an outer timeout does not
/// leave processes behind.
async fn run_command(command_line: &str) -> EngineResult<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(EngineError::Protocol(format!(
            "'{command_line}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn select_lines(output: &str, begin: Option<usize>, end: Option<usize>) -> Vec<&str> {
    let begin = begin.unwrap_or(1).max(1);
    let end = end.unwrap_or(usize::MAX);
    output
        .lines()
        .enumerate()
        .filter(|(index, _)| (begin..=end).contains(&(index + 1)))
        .map(|(_, line)| line)
        .filter(|line| !line.trim().is_empty())
        .collect()
}

fn filter_lines<'a>(
    lines: Vec<&'a str>,
    keep_only: Option<&str>,
    exclude: Option<&str>,
) -> EngineResult<Vec<&'a str>> {
    let compile = |pattern: Option<&str>| {
        pattern
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| EngineError::Protocol(format!("invalid line filter: {e}")))
    };
    let keep_only = compile(keep_only)?;
    let exclude = compile(exclude)?;

    Ok(lines
        .into_iter()
        .filter(|line| keep_only.as_ref().is_none_or(|re| re.is_match(line)))
        .filter(|line| exclude.as_ref().is_none_or(|re| !re.is_match(line)))
        .collect())
}

/// `"1,3,5-7"` into 1-based column numbers; `"3-"` means 3 and beyond
pub(crate) fn parse_column_selection(selection: &str) -> Vec<ColumnRange> {
    selection
        .split(',')
        .map(str::trim)
        .filter_map(|part| match part.split_once('-') {
            Some((from, to)) => {
                let from = from.trim().parse().ok()?;
                let to = match to.trim() {
                    "" => usize::MAX,
                    to => to.parse().ok()?,
                };
                Some(ColumnRange { from, to })
            }
            None => part.parse().ok().map(|n| ColumnRange { from: n, to: n }),
        })
        .filter(|range| range.from >= 1 && range.from <= range.to)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnRange {
    from: usize,
    to: usize,
}

fn split_and_select(line: &str, separators: &str, columns: &[ColumnRange]) -> Vec<String> {
    let cells: Vec<&str> = if separators.is_empty() {
        vec![line]
    } else {
        line.split(|c: char| separators.contains(c)).collect()
    };

    if columns.is_empty() {
        return cells.into_iter().map(str::to_string).collect();
    }

    columns
        .iter()
        .flat_map(|range| {
            let to = range.to.min(cells.len());
            (range.from..=to).map(|n| cells[n - 1].to_string())
        })
        .collect()
}
