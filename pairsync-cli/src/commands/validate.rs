//! `pairsync validate`: per-job configuration check.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use pairsync_core::{StorageKind, ValidatedJob};

#[derive(Tabled)]
struct ValidateRow {
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "detail")]
    detail: String,
}

pub fn run(config: Option<&Path>) -> Result<()> {
    let home = super::home()?;
    let path = super::config_path(&home, config);
    let config = super::load_config(&path)?;

    let results = config.validate_jobs();
    if results.is_empty() {
        println!("no jobs configured in {}", path.display());
        return Ok(());
    }

    let total = results.len();
    let mut invalid = 0usize;
    let rows: Vec<ValidateRow> = results
        .into_iter()
        .map(|(name, result)| match result {
            Ok(job) => ValidateRow {
                job: name.to_string(),
                result: "ok".green().to_string(),
                detail: describe(&job),
            },
            Err(err) => {
                invalid += 1;
                ValidateRow {
                    job: name.to_string(),
                    result: "invalid".red().to_string(),
                    detail: err.to_string(),
                }
            }
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
    if invalid > 0 {
        bail!("{invalid} of {total} job(s) invalid");
    }
    Ok(())
}

fn describe(job: &ValidatedJob) -> String {
    let storage = match job.storage {
        StorageKind::File => "",
        StorageKind::Memory => ", memory log",
    };
    format!(
        "{} <-> {} every {}{storage}",
        job.directory.display(),
        job.peer_directory.display(),
        super::status::format_interval(job.interval.as_millis() as u64),
    )
}
