//! Agent package I/O (C12): zip-based export/import of an agent's on-disk bundle, gated by a
//! static, non-executing validator.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::platform::errors::{PlatformError, PlatformErrorCode};
use crate::platform::schemas::AgentManifest;

/// Module groups denied from agent code, checked by source-text probes rather than execution.
const DENIED_IMPORT_PATTERNS: &[&str] = &[
    "std::net",
    "std::process",
    "std::fs",
    "reqwest",
    "tokio::net",
    "tokio_postgres",
    "sqlx",
];

/// Built-in-equivalent calls denied from agent code.
const DENIED_CALL_PATTERNS: &[&str] = &["std::env::", "Command::new", "include_str!", "include_bytes!"];

/// A crude but serviceable probe for literal credential shapes (API keys, tokens) left in source.
const CREDENTIAL_PATTERNS: &[&str] = &["sk-", "AKIA", "api_key = \"", "API_KEY=\""];

/// One finding from the validator; `is_error` distinguishes a hard admission blocker from an
/// advisory warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub is_error: bool,
    pub message: String,
}

/// The validator's full report. Deployment MUST NOT proceed while `errors()` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings.iter().filter(|f| f.is_error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings.iter().filter(|f| !f.is_error)
    }

    pub fn passed(&self) -> bool {
        self.errors().next().is_none()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.findings.push(ValidationFinding {
            is_error: true,
            message: message.into(),
        });
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.findings.push(ValidationFinding {
            is_error: false,
            message: message.into(),
        });
    }
}

/// `_export_info.json` companion record written alongside the manifest on export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInfo {
    pub manifest: AgentManifest,
    pub exported_at: chrono::DateTime<Utc>,
}

/// Static, non-executing validator: the only admission gate for an agent bundle, applied both on
/// export and on import.
pub struct AgentValidator<'a> {
    pub tool_slugs: &'a HashSet<String>,
    pub connector_slugs: &'a HashSet<String>,
}

impl<'a> AgentValidator<'a> {
    pub fn new(tool_slugs: &'a HashSet<String>, connector_slugs: &'a HashSet<String>) -> Self {
        Self {
            tool_slugs,
            connector_slugs,
        }
    }

    /// Validates an agent's backend source text, its declared manifest, and its prompt asset.
    /// `system_prompt` is the contents of the bundle's `prompts/system.md`-equivalent entry, or
    /// `None` if the bundle carries no such entry at all. Does not execute any of `backend_source`.
    pub fn validate(
        &self,
        manifest: &AgentManifest,
        backend_source: &str,
        system_prompt: Option<&str>,
        frontend_present: bool,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        if !backend_source.contains("impl Agent") && !backend_source.contains("impl crate::platform::engine::Agent") {
            report.error("no type implementing the agent contract was found in the backend entry point");
        }

        for required in ["fn manifest", "fn handle_turn"] {
            if !backend_source.contains(required) {
                report.error(format!("required method missing from backend entry point: {required}"));
            } else if !has_preceding_doc_comment(backend_source, required) {
                report.error(format!("required method has no doc comment: {required}"));
            }
        }

        for pattern in DENIED_IMPORT_PATTERNS {
            if backend_source.contains(pattern) {
                report.error(format!("denied import present in backend source: {pattern}"));
            }
        }

        for pattern in DENIED_CALL_PATTERNS {
            if backend_source.contains(pattern) {
                report.error(format!("denied call present in backend source: {pattern}"));
            }
        }

        for pattern in CREDENTIAL_PATTERNS {
            if backend_source.contains(pattern) {
                report.error(format!("literal credential shape detected: {pattern}"));
            }
        }

        match system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => {}
            Some(_) => report.error("prompts/system.md is present but empty"),
            None => report.error("prompts/system.md is missing"),
        }

        for dep in &manifest.tool_dependencies {
            if !self.tool_slugs.contains(dep) {
                report.warning(format!("declared tool dependency not in current registry: {dep}"));
            }
        }
        for dep in &manifest.connector_dependencies {
            if !self.connector_slugs.contains(dep) {
                report.warning(format!("declared connector dependency not in current registry: {dep}"));
            }
        }

        if !frontend_present {
            report.warning("no frontend entry point present");
        }

        report
    }
}

/// One file to be written into an export archive, relative to the archive root.
pub struct ArchiveEntry {
    pub archive_path: String,
    pub bytes: Vec<u8>,
}

/// Assembles a zip archive for `manifest`'s agent: the manifest, backend entry point, prompt
/// assets, frontend assets, plus an `_export_info.json` record. Callers run [`AgentValidator`]
/// themselves and only call this once the report passes.
pub fn export_package(manifest: &AgentManifest, entries: Vec<ArchiveEntry>) -> Result<Vec<u8>, PlatformError> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buffer);
        let options: FileOptions<()> = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let manifest_json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| PlatformError::new(PlatformErrorCode::ProcessingError, e.to_string()))?;
        writer
            .start_file("manifest.json", options)
            .map_err(zip_err)?;
        writer.write_all(&manifest_json).map_err(io_err)?;

        for entry in entries {
            writer.start_file(&entry.archive_path, options).map_err(zip_err)?;
            writer.write_all(&entry.bytes).map_err(io_err)?;
        }

        let export_info = ExportInfo {
            manifest: manifest.clone(),
            exported_at: Utc::now(),
        };
        let export_info_json = serde_json::to_vec_pretty(&export_info)
            .map_err(|e| PlatformError::new(PlatformErrorCode::ProcessingError, e.to_string()))?;
        writer
            .start_file("_export_info.json", options)
            .map_err(zip_err)?;
        writer.write_all(&export_info_json).map_err(io_err)?;

        writer.finish().map_err(zip_err)?;
    }
    Ok(buffer.into_inner())
}

/// Result of a successful import: the installed slug plus the validator's report.
pub struct ImportOutcome {
    pub slug: String,
    pub report: ValidationReport,
}

/// Reads `manifest.json` from the archive root or `backend/`, refuses path traversal and
/// (unless `overwrite` is set) refuses clobbering an existing slug, then extracts under the
/// conventional directories and runs the validator.
pub fn import_package(
    zip_bytes: &[u8],
    agents_dir: &Path,
    existing_slugs: &HashSet<String>,
    overwrite: bool,
    validator: &AgentValidator<'_>,
) -> Result<ImportOutcome, PlatformError> {
    let reader = std::io::Cursor::new(zip_bytes);
    let mut archive =
        ZipArchive::new(reader).map_err(|e| PlatformError::new(PlatformErrorCode::ValidationError, e.to_string()))?;

    for i in 0..archive.len() {
        let file = archive.by_index(i).map_err(zip_err)?;
        let name = file.name();
        if name.contains("..") || name.starts_with('/') {
            return Err(PlatformError::new(
                PlatformErrorCode::ValidationError,
                format!("rejected path-traversal entry in archive: {name}"),
            ));
        }
    }

    let manifest_bytes = read_entry(&mut archive, "manifest.json")
        .or_else(|| read_entry(&mut archive, "backend/manifest.json"))
        .ok_or_else(|| {
            PlatformError::new(PlatformErrorCode::ValidationError, "no manifest.json found in archive root or backend/")
        })?;
    let manifest: AgentManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| PlatformError::new(PlatformErrorCode::ValidationError, e.to_string()))?;

    if existing_slugs.contains(&manifest.slug) && !overwrite {
        return Err(PlatformError::new(
            PlatformErrorCode::ValidationError,
            format!("agent slug '{}' already exists; pass overwrite to replace it", manifest.slug),
        ));
    }

    let backend_source = read_entry(&mut archive, "backend/agent.rs")
        .or_else(|| read_entry(&mut archive, "backend/main.rs"))
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    let frontend_present = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok())
        .any(|f| f.name().starts_with("frontend/"));

    let system_prompt = read_entry(&mut archive, "prompts/system.md")
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

    let report = validator.validate(&manifest, &backend_source, system_prompt.as_deref(), frontend_present);
    if !report.passed() {
        return Err(PlatformError::new(
            PlatformErrorCode::ValidationError,
            format!("agent bundle failed validation: {} error(s)", report.errors().count()),
        ));
    }

    let dest: PathBuf = agents_dir.join(&manifest.slug);
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_err)?;
        let name = file.name().to_string();
        if name.ends_with('/') {
            continue;
        }
        let out_path = dest.join(&name);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(io_err)?;
        std::fs::write(&out_path, buf).map_err(io_err)?;
    }

    Ok(ImportOutcome {
        slug: manifest.slug,
        report,
    })
}

/// True if some line containing `needle` is immediately preceded by a `///` doc-comment line.
fn has_preceding_doc_comment(source: &str, needle: &str) -> bool {
    let lines: Vec<&str> = source.lines().collect();
    lines
        .iter()
        .position(|line| line.contains(needle))
        .map(|i| i > 0 && lines[i - 1].trim_start().starts_with("///"))
        .unwrap_or(false)
}

fn read_entry(archive: &mut ZipArchive<std::io::Cursor<&[u8]>>, name: &str) -> Option<Vec<u8>> {
    let mut file = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(buf)
}

fn zip_err(e: zip::result::ZipError) -> PlatformError {
    PlatformError::new(PlatformErrorCode::ProcessingError, e.to_string())
}

fn io_err(e: std::io::Error) -> PlatformError {
    PlatformError::new(PlatformErrorCode::ProcessingError, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> AgentManifest {
        AgentManifest {
            slug: "sample-agent".to_string(),
            display_name: "Sample".to_string(),
            version: "1.0.0".to_string(),
            description: "a sample agent for tests".to_string(),
            icon: None,
            category: None,
            tags: vec![],
            tool_dependencies: vec![],
            connector_dependencies: vec![],
            triggers: vec![],
            capabilities: vec![],
            min_platform_version: "0.1.0".to_string(),
        }
    }

    /// A backend source with both required methods documented, used as the well-formed baseline
    /// across tests; individual tests mutate it to exercise one failure mode at a time.
    fn documented_backend_source() -> &'static str {
        "impl Agent for Foo {\n\
         /// Describes this agent.\n\
         fn manifest(&self){}\n\
         /// Handles one turn.\n\
         fn handle_turn(&self){}\n\
         }"
    }

    #[test]
    fn validator_flags_missing_contract_methods() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let report = validator.validate(&sample_manifest(), "struct Foo;", Some("be helpful"), true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_flags_undocumented_contract_methods() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let source = "impl Agent for Foo { fn manifest(&self){} fn handle_turn(&self){} }";
        let report = validator.validate(&sample_manifest(), source, Some("be helpful"), true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_flags_denied_import() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let source = format!("use std::fs;\n{}", documented_backend_source());
        let report = validator.validate(&sample_manifest(), &source, Some("be helpful"), true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_flags_literal_credential() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let source = format!("{}\nlet key = \"sk-abc123\";", documented_backend_source());
        let report = validator.validate(&sample_manifest(), &source, Some("be helpful"), true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_flags_missing_system_prompt() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let report = validator.validate(&sample_manifest(), documented_backend_source(), None, true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_flags_empty_system_prompt() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let report = validator.validate(&sample_manifest(), documented_backend_source(), Some("   "), true);
        assert!(!report.passed());
    }

    #[test]
    fn validator_warns_on_missing_frontend_without_blocking() {
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let report = validator.validate(&sample_manifest(), documented_backend_source(), Some("be helpful"), false);
        assert!(report.passed());
        assert!(report.warnings().count() >= 1);
    }

    #[test]
    fn export_then_import_round_trips_the_manifest() {
        let manifest = sample_manifest();
        let archive = export_package(
            &manifest,
            vec![
                ArchiveEntry {
                    archive_path: "backend/agent.rs".to_string(),
                    bytes: documented_backend_source().as_bytes().to_vec(),
                },
                ArchiveEntry {
                    archive_path: "prompts/system.md".to_string(),
                    bytes: b"be helpful".to_vec(),
                },
            ],
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let existing = HashSet::new();
        let outcome = import_package(&archive, dir.path(), &existing, false, &validator).unwrap();
        assert_eq!(outcome.slug, "sample-agent");
        assert!(outcome.report.passed());
    }

    #[test]
    fn import_rejects_existing_slug_without_overwrite() {
        let manifest = sample_manifest();
        let archive = export_package(&manifest, vec![]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tools = HashSet::new();
        let connectors = HashSet::new();
        let validator = AgentValidator::new(&tools, &connectors);
        let mut existing = HashSet::new();
        existing.insert("sample-agent".to_string());
        let err = import_package(&archive, dir.path(), &existing, false, &validator).unwrap_err();
        assert_eq!(err.code, PlatformErrorCode::ValidationError);
    }
}
