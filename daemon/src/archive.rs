use anyhow::{Context, Result};
use common::{JobRecord, TOOL_OUTPUTS_DIR};
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Package a finished job's artifacts into `{job_id}_results.zip` next to
/// the job directory.
///
/// The archive starts with a `manifest.json` describing the job and every
/// unit, followed by the contents of the `tool_outputs/` directory. Returns
/// `None` when no artifact landed on disk, so callers can skip advertising a
/// download that would be empty.
///
/// Runs blocking filesystem work; call from `spawn_blocking`.
pub fn package_job(record: &JobRecord) -> Result<Option<PathBuf>> {
    let outputs_dir = record.results_path.join(TOOL_OUTPUTS_DIR);
    let mut files = Vec::new();
    collect_files(&outputs_dir, &outputs_dir, &mut files);
    if files.is_empty() {
        log::info!("Job {} produced no artifacts, skipping archive", record.id);
        return Ok(None);
    }

    let zip_path = record
        .results_path
        .parent()
        .context("job directory has no parent")?
        .join(common::archive_file_name(&record.id));

    let file = File::create(&zip_path)
        .with_context(|| format!("Failed to create archive {:?}", zip_path))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    writer.start_file("manifest.json", options)?;
    writer.write_all(serde_json::to_string_pretty(&manifest(record))?.as_bytes())?;

    for rel in &files {
        let source = outputs_dir.join(rel);
        let data = match std::fs::read(&source) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Skipping unreadable artifact {:?}: {}", source, e);
                continue;
            }
        };
        let name = format!("{}/{}", TOOL_OUTPUTS_DIR, rel.to_string_lossy());
        writer.start_file(name, options)?;
        writer.write_all(&data)?;
    }

    writer.finish()?;
    log::info!("Wrote archive {:?} ({} artifacts)", zip_path, files.len());
    Ok(Some(zip_path))
}

fn manifest(record: &JobRecord) -> serde_json::Value {
    let units: Vec<serde_json::Value> = record
        .tool_progress
        .iter()
        .map(|(key, unit)| {
            json!({
                "unit": key,
                "tool": unit.name,
                "status": unit.status,
                "command": unit.command,
                "output_file": unit.output_file,
                "error_message": unit.error_message,
            })
        })
        .collect();
    json!({
        "job_id": record.id,
        "name": record.name,
        "status": record.status,
        "targets": record.targets,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "units": units,
    })
}

/// Regular files under `dir`, as paths relative to `base`, sorted for a
/// stable archive layout.
fn collect_files(dir: &Path, base: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if dir == base {
                log::warn!("Cannot read outputs directory {:?}: {}", dir, e);
            }
            return;
        }
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_files(&path, base, out);
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_path_buf());
        }
    }
}
