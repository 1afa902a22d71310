//! Robot (UI) tests, optionally at several parallelism levels.

use futures::FutureExt;
use regex::Regex;
use serde::Deserialize;
use shipwright_state::{LineKind, RobotStats};
use tracing::info;

use super::batch::{BatchItem, BatchSummary, LineReport, LineWriter};
use super::instance::Instance;
use super::TestSettings;
use crate::error::{Result, ShipwrightError};
use crate::remote::{shell_quote, ExecOptions};

/// Separates console noise from the JSON result.
const RESULT_MARKER: &str = "---!!!---###---";

/// One entry of the JSON result the robot runner prints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RobotResult {
    pub all_ok: bool,
    #[serde(default)]
    pub avg_duration: f64,
    #[serde(default)]
    pub min_duration: f64,
    #[serde(default)]
    pub max_duration: f64,
}

/// Replace characters that are awkward in file names.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| if "/\\;!()*".contains(c) { '_' } else { c })
        .collect()
}

/// Parse the JSON after the result marker.
pub fn parse_robot_output(stdout: &str) -> Result<RobotResult> {
    let (_, json) = stdout.split_once(RESULT_MARKER).ok_or_else(|| {
        ShipwrightError::Validation(format!(
            "no result marker in robot output: {}",
            stdout.lines().last().unwrap_or_default()
        ))
    })?;
    let results: Vec<RobotResult> = serde_json::from_str(json.trim())?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| ShipwrightError::Validation("robot output holds no result".into()))
}

fn parallel_levels(spec: &str) -> Result<Vec<u32>> {
    let levels: Vec<u32> = spec
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                ShipwrightError::Validation(format!("invalid robot parallelism {s:?}"))
            })
        })
        .collect::<Result<_>>()?;
    Ok(if levels.is_empty() { vec![1] } else { levels })
}

/// One item per (file, level), files sorted.
fn robot_items(files: &[String], filter: &Regex, levels: &[u32]) -> Vec<BatchItem> {
    let mut files: Vec<&String> = files.iter().filter(|f| filter.is_match(f)).collect();
    files.sort();
    files
        .into_iter()
        .flat_map(|file| {
            let name = file.rsplit('/').next().unwrap_or(file).to_string();
            levels.iter().map(move |&level| BatchItem {
                name: format!("{name} [{level}]"),
                parallelism: Some(level),
                ..BatchItem::new("", file.clone())
            })
        })
        .collect()
}

async fn run_item(instance: &Instance, item: BatchItem) -> Result<LineReport> {
    let level = item.parallelism.unwrap_or(1);
    instance.restore_snapshot().await?;
    instance.cli("up -d").await?;
    instance.wait_for_postgres().await?;

    let command = format!(
        "{} robot --parallel {level} --output-json -p password=1 {}",
        instance.settings().instance_cli,
        shell_quote(&item.target)
    );
    let out = instance
        .session()
        .execute(
            &command,
            ExecOptions::allow_error().with_timeout(instance.settings().timeout()),
        )
        .await?;
    if out.timed_out {
        return Err(ShipwrightError::Timeout {
            command,
            secs: instance.settings().timeout_secs,
        });
    }

    let result = parse_robot_output(&out.stdout)?;
    if !result.all_ok {
        return Err(ShipwrightError::Validation(format!(
            "robot tests failed:\n{}",
            out.stdout
        )));
    }
    Ok(LineReport {
        robot_stats: Some(RobotStats {
            avg_duration: result.avg_duration,
            min_duration: result.min_duration,
            max_duration: result.max_duration,
        }),
        log_ref: Some(format!("robot_output/{}_{level}", safe_filename(&item.target))),
    })
}

pub(super) async fn run(
    instance: &Instance,
    writer: &mut LineWriter,
    settings: &TestSettings,
) -> Result<BatchSummary> {
    let filter = Regex::new(&settings.robot_filter).map_err(|e| {
        ShipwrightError::Validation(format!("invalid robot filter {:?}: {e}", settings.robot_filter))
    })?;
    let levels = parallel_levels(&settings.robot_parallel)?;
    let files = instance.list_files("list-robot-test-files").await?;
    let items = robot_items(&files, &filter, &levels);
    info!(files = files.len(), lines = items.len(), "robot tests listed");

    instance.cli("build").await?;
    writer
        .run_batch(LineKind::Robottest, items, 1, |item| {
            run_item(instance, item).boxed()
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_replaces_specials() {
        assert_eq!(safe_filename("tests/a;b!(c)*.robot"), "tests_a_b__c__.robot");
        assert_eq!(safe_filename("plain.robot"), "plain.robot");
    }

    #[test]
    fn robot_output_after_marker() {
        let stdout = "starting robot\n---!!!---###---\n[{\"all_ok\": true, \"avg_duration\": 2.5, \"min_duration\": 1.0, \"max_duration\": 4.0}]\n";
        let res = parse_robot_output(stdout).unwrap();
        assert!(res.all_ok);
        assert_eq!(res.max_duration, 4.0);

        assert!(parse_robot_output("crashed before output").is_err());
    }

    #[test]
    fn one_item_per_file_and_level() {
        let files = vec![
            "tests/z_sale.robot".to_string(),
            "tests/a_stock.robot".to_string(),
            "tests/skip.txt".to_string(),
        ];
        let filter = Regex::new(r"\.robot$").unwrap();
        let items = robot_items(&files, &filter, &parallel_levels("1, 5").unwrap());
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "a_stock.robot [1]",
                "a_stock.robot [5]",
                "z_sale.robot [1]",
                "z_sale.robot [5]"
            ]
        );
        assert_eq!(items[1].parallelism, Some(5));
    }

    #[test]
    fn bad_parallelism_is_rejected() {
        assert!(parallel_levels("1,x").is_err());
        assert_eq!(parallel_levels("").unwrap(), vec![1]);
    }
}
