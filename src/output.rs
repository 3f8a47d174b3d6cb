use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    BatchResult, CellTypesResult, DetectResult, DownloadResult, ProgressEvent, ProgressSink,
};
use crate::detector::LoaderConfig;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_detect(result: &[DetectResult]) -> io::Result<()> {
        Self::print_json(&result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_loader_config(result: &LoaderConfig) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cell_types(result: &CellTypesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr for interactive use.
pub struct TextOutput;

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

impl TextOutput {
    pub fn print_detect(results: &[DetectResult]) {
        for result in results {
            let types = if result.data_types.is_empty() {
                "none".to_string()
            } else {
                result
                    .data_types
                    .iter()
                    .map(|data_type| data_type.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("{}: {types}", result.geo_accession);
            for sample in &result.single_cell_samples {
                println!("  {} ({})", sample.accession, sample.evidence);
            }
            if !result.additional_supplementary_files.is_empty() {
                println!("  additional files:");
                for file in &result.additional_supplementary_files {
                    println!("    {file}");
                }
            }
        }
    }

    pub fn print_download(result: &DownloadResult) {
        let data_type = result
            .data_type
            .map(|data_type| data_type.to_string())
            .unwrap_or_else(|| "none".to_string());
        if result.skipped_download {
            println!("{}: {data_type} (download skipped)", result.geo_accession);
        } else {
            println!("{}: {data_type}", result.geo_accession);
        }
        for path in &result.paths {
            println!("  {path}");
        }
    }

    pub fn print_batch(result: &BatchResult) {
        for record in &result.results {
            if record.comment.is_empty() {
                println!("{}\t{}", record.geo_accession, record.data_type);
            } else {
                println!(
                    "{}\t{}\t{}",
                    record.geo_accession, record.data_type, record.comment
                );
            }
        }
        println!(
            "processed {}, skipped {}, failed {}",
            result.processed, result.skipped, result.failed
        );
    }

    pub fn print_loader_config(config: &LoaderConfig) {
        println!("{} {}", config.data_type, config.path);
        for sample in &config.samples {
            println!("  {} {}", sample.sample, sample.matrix);
        }
    }

    pub fn print_cell_types(result: &CellTypesResult) {
        for assignment in &result.assignments {
            println!(
                "{}: {} cell(s), {} cell type(s)",
                assignment.name,
                assignment.cells.len(),
                assignment.number_of_cell_types()
            );
            for (index, label) in assignment.cell_types.iter().enumerate() {
                println!("  {index}\t{label}");
            }
        }
    }
}
