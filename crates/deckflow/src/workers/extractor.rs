//! The boundary to the external unit extractor.
//!
//! Workers never parse documents themselves; they call a [`UnitExtractor`]. The production
//! implementation, [`SubprocessExtractor`], runs an extractor program once per request and
//! reads one JSON object from its stdout. Tests substitute in-process implementations.

use crate::types::{DocumentMetadata, UnitContent};
use crate::{DeckflowError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Default timeout for a single extractor invocation (120 seconds)
pub const EXTRACTOR_TIMEOUT_SECONDS: u64 = 120;

/// Everything an extractor needs to produce one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub unit_index: usize,
    /// Extractor-specific options, passed through as JSON.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, Value>,
}

/// An external extractor able to parse one unit, read document metadata, or count units.
#[async_trait]
pub trait UnitExtractor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Fail with `MissingDependency` when the extractor cannot run on this host.
    async fn check_available(&self) -> Result<()>;

    async fn parse_unit(&self, request: &UnitRequest) -> Result<UnitContent>;

    async fn extract_metadata(&self, input_path: &Path) -> Result<DocumentMetadata>;

    async fn count_units(&self, input_path: &Path) -> Result<usize>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    #[serde(alias = "slideCount")]
    unit_count: usize,
}

/// Runs an extractor program as a child process per request.
///
/// Invocations, with `<prefix>` being the optional script followed by any extra arguments:
///
/// - unit: `program <prefix> <input> <output_dir> --unit-index N --single-unit [--options JSON]`
/// - metadata: `program <prefix> <input> --metadata-only`
/// - count: `program <prefix> <input> --count-only`
///
/// The program may print progress lines; the last non-empty stdout line must be the JSON
/// response. A response carrying an `"error"` field is treated as a failure.
///
/// A successful availability check is remembered; failures are re-checked on the next call.
#[derive(Debug, Clone)]
pub struct SubprocessExtractor {
    program: PathBuf,
    script: Option<PathBuf>,
    args: Vec<String>,
    timeout: Duration,
    available: Arc<AtomicBool>,
}

impl SubprocessExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: None,
            args: Vec::new(),
            timeout: Duration::from_secs(EXTRACTOR_TIMEOUT_SECONDS),
            available: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self.available = Arc::new(AtomicBool::new(false));
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self.available = Arc::new(AtomicBool::new(false));
        self
    }

    /// Deadline for each invocation, including the `--version` availability check.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(script) = &self.script {
            command.arg(script);
        }
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn invoke(&self, operation: &str, mut command: Command) -> Result<Value> {
        let child = command.spawn().map_err(|e| {
            // command not found and similar are system errors
            std::io::Error::other(format!("Failed to execute {}: {}", self.program.display(), e))
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(std::io::Error::other(format!("Failed to wait for extractor: {}", e)).into()),
            Err(_) => {
                // the child was moved into wait_with_output() and is killed on drop
                return Err(DeckflowError::Timeout {
                    operation: format!("extractor {}", operation),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeckflowError::extraction(format!(
                "Extractor {} exited with {}: {}",
                operation,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| DeckflowError::extraction(format!("Extractor {} produced no output", operation)))?;

        let value: Value = serde_json::from_str(line.trim()).map_err(|e| {
            DeckflowError::extraction_with_source(format!("Extractor {} produced malformed JSON", operation), e)
        })?;

        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(DeckflowError::extraction(format!("Extractor {} failed: {}", operation, message)));
        }

        Ok(value)
    }
}

#[async_trait]
impl UnitExtractor for SubprocessExtractor {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(script) = &self.script
            && !script.exists()
        {
            return Err(DeckflowError::MissingDependency(format!(
                "Extractor script '{}' does not exist",
                script.display()
            )));
        }

        let mut command = Command::new(&self.program);
        command
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let result = match timeout(self.timeout, command.status()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(DeckflowError::MissingDependency(format!(
                    "Extractor runtime '{}' did not answer '--version' within {}ms",
                    self.program.display(),
                    self.timeout.as_millis()
                )));
            }
        };

        match result {
            Ok(status) if status.success() => {
                self.available.store(true, Ordering::Release);
                Ok(())
            }
            Ok(_) => Err(DeckflowError::MissingDependency(format!(
                "Extractor runtime '{}' responded with a failure when checking '--version'",
                self.program.display()
            ))),
            Err(err) => Err(DeckflowError::MissingDependency(format!(
                "Extractor runtime '{}' could not be executed: {}",
                self.program.display(),
                err
            ))),
        }
    }

    async fn parse_unit(&self, request: &UnitRequest) -> Result<UnitContent> {
        let mut command = self.command();
        command
            .arg(&request.input_path)
            .arg(&request.output_dir)
            .arg("--unit-index")
            .arg(request.unit_index.to_string())
            .arg("--single-unit");
        if !request.options.is_empty() {
            command.arg("--options").arg(serde_json::to_string(&request.options)?);
        }

        let value = self.invoke("parse_unit", command).await?;
        let mut unit: UnitContent = serde_json::from_value(value).map_err(|e| {
            DeckflowError::extraction_with_source(format!("Unit {} has an unexpected shape", request.unit_index), e)
        })?;
        unit.index = request.unit_index;
        Ok(unit)
    }

    async fn extract_metadata(&self, input_path: &Path) -> Result<DocumentMetadata> {
        let mut command = self.command();
        command.arg(input_path).arg("--metadata-only");

        let mut value = self.invoke("extract_metadata", command).await?;
        // metadata may arrive wrapped as {"metadata": {...}}
        if let Some(inner) = value.get_mut("metadata").filter(|inner| inner.is_object()) {
            value = inner.take();
        }
        serde_json::from_value(value)
            .map_err(|e| DeckflowError::extraction_with_source("Metadata has an unexpected shape", e))
    }

    async fn count_units(&self, input_path: &Path) -> Result<usize> {
        let mut command = self.command();
        command.arg(input_path).arg("--count-only");

        let value = self.invoke("count_units", command).await?;
        let response: CountResponse = serde_json::from_value(value)
            .map_err(|e| DeckflowError::extraction_with_source("Unit count response has an unexpected shape", e))?;
        Ok(response.unit_count)
    }
}
