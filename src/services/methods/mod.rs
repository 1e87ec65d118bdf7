//! Per-method capabilities: validation, execution and result naming.
//!
//! Each transformation method is a [`MethodHandler`] registered under its name in an
//! immutable [`MethodRegistry`]. Submission validates through the registry and
//! workers execute through it, so an unknown method never reaches the queue.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::job::{Job, JobView};
use crate::models::params::{MethodParams, TargetFormat};
use crate::services::processors::{ExecutionError, Processors};

pub mod learned;
pub mod multi;
pub mod raster;

/// A request rejected before any job is created. The message is shown to the client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// How many artifacts a method consumes per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArity {
    /// One job per uploaded artifact.
    Single,
    /// One job for the whole ordered batch.
    Multi { min: usize, max: usize },
}

impl InputArity {
    pub fn check(self, method: &str, count: usize) -> Result<(), ValidationError> {
        match self {
            InputArity::Single => Ok(()),
            InputArity::Multi { min, max } if (min..=max).contains(&count) => Ok(()),
            InputArity::Multi { min, max } => Err(ValidationError(format!(
                "{method} requires between {min} and {max} files, got {count}"
            ))),
        }
    }
}

/// The output of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub scale: i32,
    pub params: MethodParams,
    pub denoise_first: bool,
    pub face_enhance: bool,
}

impl Validated {
    /// Scale 1 and no cross-cutting flags.
    pub fn plain(params: MethodParams) -> Self {
        Self {
            scale: 1,
            params,
            denoise_first: false,
            face_enhance: false,
        }
    }
}

/// Download name and media type for a completed job's result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultName {
    pub filename: String,
    pub media_type: &'static str,
}

impl ResultName {
    pub fn png(filename: String) -> Self {
        Self {
            filename,
            media_type: "image/png",
        }
    }

    /// `attachment` header value with quotes and control characters removed.
    pub fn content_disposition(&self) -> String {
        let safe: String = self
            .filename
            .chars()
            .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
            .collect();
        format!("attachment; filename=\"{safe}\"")
    }
}

/// The original filename without its last extension.
pub fn base_name(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() => base,
        _ => filename,
    }
}

/// Loosely typed request parameters as received at the transport boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawParams {
    pub scale: Option<i64>,
    pub denoise_first: bool,
    pub face_enhance: bool,
    pub target_format: Option<String>,
    pub quality: Option<String>,
    pub options: Map<String, Value>,
}

impl RawParams {
    /// Parse the `options` form field. Blank means no options.
    pub fn parse_options(raw: Option<&str>) -> Result<Map<String, Value>, ValidationError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Map::new());
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ValidationError::new("options must be valid JSON object")),
        }
    }

    pub fn target_format(
        &self,
        allowed: &[TargetFormat],
        method: &str,
    ) -> Result<TargetFormat, ValidationError> {
        let listed = allowed
            .iter()
            .map(|f| f.extension())
            .collect::<Vec<_>>()
            .join(", ");
        self.target_format
            .as_deref()
            .and_then(|f| f.parse::<TargetFormat>().ok())
            .filter(|f| allowed.contains(f))
            .ok_or_else(|| {
                ValidationError(format!(
                    "target_format required for {method}, one of: {listed}"
                ))
            })
    }

    /// Quality 1..=100 when present and non-blank.
    pub fn quality(&self) -> Result<Option<u8>, ValidationError> {
        let Some(raw) = self.quality.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let value: i64 = raw
            .parse()
            .map_err(|_| ValidationError::new("quality must be a number between 1 and 100"))?;
        if !(1..=100).contains(&value) {
            return Err(ValidationError::new("quality must be between 1 and 100"));
        }
        Ok(Some(value as u8))
    }

    /// Integer option, accepting JSON numbers or numeric strings.
    pub fn option_int(&self, key: &str) -> Result<Option<i64>, ValidationError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| ValidationError(format!("{key} must be an integer"))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ValidationError(format!("{key} must be an integer"))),
            Some(_) => Err(ValidationError(format!("{key} must be an integer"))),
        }
    }

    pub fn option_bool(&self, key: &str) -> Result<bool, ValidationError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
            Some(_) => Err(ValidationError(format!("{key} must be a boolean"))),
        }
    }

    pub fn option_str(&self, key: &str) -> Result<Option<&str>, ValidationError> {
        match self.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim())),
            Some(_) => Err(ValidationError(format!("{key} must be a string"))),
        }
    }
}

/// Turn a garde report into a client-facing message.
pub(crate) fn report(result: Result<(), garde::Report>) -> Result<(), ValidationError> {
    result.map_err(|report| {
        let message = report
            .iter()
            .map(|(path, error)| format!("{path}: {}", error.message()))
            .collect::<Vec<_>>()
            .join("; ");
        ValidationError(message)
    })
}

/// Everything the system knows about one method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> InputArity {
        InputArity::Single
    }

    /// Whether workers run the pixel-count pre-flight on the input.
    fn checks_raster(&self) -> bool {
        true
    }

    /// Pure validation of request parameters for a batch of `input_count` artifacts.
    fn validate(&self, raw: &RawParams, input_count: usize) -> Result<Validated, ValidationError>;

    async fn execute(
        &self,
        job: &JobView<'_>,
        input: &Path,
        output: &Path,
    ) -> Result<(), ExecutionError>;

    fn result_name(&self, job: &Job) -> ResultName;

    /// Scratch filename the processor writes to.
    fn output_file(&self, _job: &Job) -> &'static str {
        "output.png"
    }

    fn progress_detail(&self, job: &Job) -> String;
}

/// Immutable name → handler map.
#[derive(Clone)]
pub struct MethodRegistry {
    handlers: Arc<BTreeMap<&'static str, Arc<dyn MethodHandler>>>,
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::default()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn MethodHandler>, ValidationError> {
        self.handlers.get(name).cloned().ok_or_else(|| {
            ValidationError(format!(
                "method must be one of: {}",
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

#[derive(Default)]
pub struct MethodRegistryBuilder {
    handlers: BTreeMap<&'static str, Arc<dyn MethodHandler>>,
}

#[derive(Debug, thiserror::Error)]
#[error("method {0} registered twice")]
pub struct DuplicateMethod(pub &'static str);

impl MethodRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn MethodHandler>) -> Result<Self, DuplicateMethod> {
        let name = handler.name();
        if self.handlers.insert(name, handler).is_some() {
            return Err(DuplicateMethod(name));
        }
        Ok(self)
    }

    pub fn build(self) -> MethodRegistry {
        MethodRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// The registry of every built-in method wired to its processor.
pub fn standard_registry(processors: &Processors) -> Result<MethodRegistry, DuplicateMethod> {
    let mut builder = MethodRegistry::builder();
    for handler in learned::handlers(processors.inference.clone()) {
        builder = builder.register(handler)?;
    }
    for handler in raster::handlers(processors.raster.clone()) {
        builder = builder.register(handler)?;
    }
    for handler in multi::handlers(processors.raster.clone(), processors.pdf.clone()) {
        builder = builder.register(handler)?;
    }
    Ok(builder.build())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::services::processors::Processor;

    /// Processor that must never be reached by validation-only tests.
    pub struct Unreachable;

    #[async_trait]
    impl Processor for Unreachable {
        async fn execute(
            &self,
            _job: &JobView<'_>,
            _input: &Path,
            _output: &Path,
        ) -> Result<(), ExecutionError> {
            Err(ExecutionError::Failed("not wired".to_string()))
        }
    }

    pub fn registry() -> MethodRegistry {
        let processor: Arc<dyn Processor> = Arc::new(Unreachable);
        standard_registry(&Processors {
            raster: processor.clone(),
            inference: processor.clone(),
            pdf: processor,
        })
        .unwrap()
    }

    pub fn raw(options: Value) -> RawParams {
        RawParams {
            options: options.as_object().cloned().unwrap_or_default(),
            ..RawParams::default()
        }
    }
}
