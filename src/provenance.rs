//! Provenance logs.
//!
//! A [`LogMaker`] records, for every run, enough to reproduce it: the settings
//! as written, the settings with every path template resolved as far as the
//! context allows, a manifest of the code in use, and the log text emitted
//! while the run was going. Layout of one run:
//!
//! ```text
//! <log_dir>/<run_id>/
//!     pipeline.log
//!     config_raw.yaml
//!     config_resolved.yaml
//!     manifest.json
//!     stages/<stage>/stage.log            (opted-in stages only)
//! <stage_dir>/logs/<run_id>/              (copy of stages/<stage>/)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing_subscriber::fmt::MakeWriter;

use crate::executor::Stage;
use crate::graph::{STAGE_KEY, StageGraph};
use crate::namer::NameTracker;
use crate::settings::Settings;
use crate::spec::OrderedMap;

static GLOBAL_CAPTURE: LazyLock<LogCapture> = LazyLock::new(LogCapture::default);

#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    /// Position of `bytes[0]` since the capture was created.
    offset: usize,
    /// Marks of readers still interested in the text after them.
    pinned: Vec<usize>,
}

impl Buffer {
    fn end(&self) -> usize {
        self.offset + self.bytes.len()
    }
}

/// An in-memory sink for formatted log lines.
///
/// Positions handed out by [`LogCapture::mark`] let a caller cut out the text
/// written between two points in time. Text is only kept while some reader
/// holds a [`LogCapture::pin`] older than it; releasing the last pin drops
/// everything captured so far.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Buffer>>,
}

impl LogCapture {
    /// The capture fed by [`crate::init_logging`].
    pub fn global() -> &'static LogCapture {
        &GLOBAL_CAPTURE
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current end of the captured text.
    pub fn mark(&self) -> usize {
        self.lock().end()
    }

    /// Like [`LogCapture::mark`], but the text after the mark is kept until
    /// [`LogCapture::release`] is called with it.
    pub fn pin(&self) -> usize {
        let mut buffer = self.lock();
        let mark = buffer.end();
        buffer.pinned.push(mark);
        mark
    }

    /// Drops a pin, then discards the text no remaining pin needs.
    pub fn release(&self, mark: usize) {
        let mut buffer = self.lock();
        if let Some(i) = buffer.pinned.iter().position(|&m| m == mark) {
            buffer.pinned.swap_remove(i);
        }

        let keep_from = buffer.pinned.iter().min().copied().unwrap_or(buffer.end());
        let n = keep_from.saturating_sub(buffer.offset).min(buffer.bytes.len());
        buffer.bytes.drain(..n);
        buffer.offset += n;
    }

    /// Text captured since `mark`, as far as it is still held.
    pub fn text_since(&self, mark: usize) -> String {
        let buffer = self.lock();
        let start = mark.saturating_sub(buffer.offset).min(buffer.bytes.len());
        String::from_utf8_lossy(&buffer.bytes[start..]).into_owned()
    }

    /// Bytes currently held in memory.
    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, text: &str) {
        self.lock().bytes.extend_from_slice(text.as_bytes());
    }
}

pub struct CaptureWriter {
    capture: LogCapture,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.capture.lock().bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            capture: self.clone(),
        }
    }
}

#[derive(Serialize)]
struct ExecutorEntry {
    stage: String,
    executor: String,
}

#[derive(Serialize)]
struct SourceEntry {
    path: Utf8PathBuf,
    blake3: String,
}

#[derive(Serialize)]
struct Manifest {
    package: &'static str,
    version: &'static str,
    run_id: String,
    created: String,
    executors: Vec<ExecutorEntry>,
    handlers: Vec<String>,
    sources: Vec<SourceEntry>,
}

#[derive(Serialize)]
struct ResolvedAsset {
    handler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    path: String,
}

#[derive(Serialize)]
struct ResolvedStage {
    dir_name: String,
    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    assets_in: OrderedMap<ResolvedAsset>,
    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    assets_out: OrderedMap<ResolvedAsset>,
    make_stage_log: bool,
}

#[derive(Serialize)]
struct ResolvedConfig {
    context: BTreeMap<String, String>,
    n_workers: usize,
    stages: OrderedMap<ResolvedStage>,
}

fn resolve_config(
    settings: &Settings,
    names: &NameTracker,
    graph: &StageGraph,
) -> anyhow::Result<String> {
    let mut stages = OrderedMap::new();

    for stage in graph.stages() {
        let own = BTreeMap::from([(STAGE_KEY.to_string(), stage.dir_name.clone())]);

        let mut assets_out = OrderedMap::new();
        for decl in &stage.outputs {
            assets_out.insert(
                decl.name.as_str(),
                ResolvedAsset {
                    handler: decl.handler_name.clone(),
                    from: None,
                    path: names.render_partial(&decl.template, &own)?,
                },
            );
        }

        let mut assets_in = OrderedMap::new();
        for decl in &stage.inputs {
            let source = BTreeMap::from([(STAGE_KEY.to_string(), decl.source_dir.clone())]);
            assets_in.insert(
                decl.name.as_str(),
                ResolvedAsset {
                    handler: decl.handler_name.clone(),
                    from: Some(format!("{}.{}", decl.source_stage, decl.source_asset)),
                    path: names.render_partial(&decl.template, &source)?,
                },
            );
        }

        stages.insert(
            stage.key.as_str(),
            ResolvedStage {
                dir_name: stage.dir_name.clone(),
                assets_in,
                assets_out,
                make_stage_log: stage.make_stage_log,
            },
        );
    }

    let resolved = ResolvedConfig {
        context: names.snapshot(),
        n_workers: settings.n_workers,
        stages,
    };

    Ok(serde_yaml::to_string(&resolved)?)
}

fn hash_sources(patterns: &[String], names: &NameTracker) -> anyhow::Result<Vec<SourceEntry>> {
    let mut sources = Vec::new();

    for pattern in patterns {
        let pattern = names.render(pattern)?;
        for entry in glob::glob(&pattern)? {
            let path = entry?;
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }

            let bytes = fs::read(&path).with_context(|| format!("reading {path}"))?;
            sources.push(SourceEntry {
                blake3: blake3::hash(&bytes).to_hex().to_string(),
                path,
            });
        }
    }

    sources.sort_by(|a, b| a.path.cmp(&b.path));
    sources.dedup_by(|a, b| a.path == b.path);
    Ok(sources)
}

fn write_file(path: &Utf8Path, contents: &str) -> anyhow::Result<()> {
    crate::io::write_bytes(path, contents)?;
    Ok(())
}

/// Writes the provenance log of one pipeline run.
pub struct LogMaker {
    run_id: String,
    run_dir: Utf8PathBuf,
    stage_dir: String,
    names: NameTracker,
    capture: LogCapture,
    start: usize,
    stage_start: usize,
    config_raw: String,
    config_resolved: String,
    manifest: Manifest,
}

impl LogMaker {
    /// Prepares a run. Nothing is written until a stage finishes or the run
    /// is finalized, but every template is rendered here, so a bad
    /// `log_dir` fails before the first stage runs.
    pub fn new(
        settings: &Settings,
        names: &NameTracker,
        graph: &StageGraph,
        executors: &[(String, &'static str)],
    ) -> anyhow::Result<Self> {
        let now = chrono::Local::now();
        let base = now.format("%Y-%m-%d_%H-%M-%S").to_string();
        let log_dir = Utf8PathBuf::from(names.render(&settings.logging.log_dir)?);

        let mut run_id = base.clone();
        let mut n = 1;
        while log_dir.join(&run_id).exists() {
            run_id = format!("{base}_{n}");
            n += 1;
        }

        let manifest = Manifest {
            package: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            run_id: run_id.clone(),
            created: now.to_rfc3339(),
            executors: executors
                .iter()
                .map(|(stage, executor)| ExecutorEntry {
                    stage: stage.clone(),
                    executor: executor.to_string(),
                })
                .collect(),
            handlers: graph.handler_names().into_iter().map(String::from).collect(),
            sources: hash_sources(&settings.logging.sources, names)?,
        };

        let capture = LogCapture::global().clone();
        let start = capture.pin();

        Ok(Self {
            run_dir: log_dir.join(&run_id),
            run_id,
            stage_dir: settings.logging.stage_dir.clone(),
            names: names.clone(),
            start,
            stage_start: start,
            config_raw: settings.to_yaml_string()?,
            config_resolved: resolve_config(settings, names, graph)?,
            manifest,
            capture,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Utf8Path {
        &self.run_dir
    }

    /// Marks the point from which the next stage log is cut.
    pub fn begin_stage(&mut self) {
        self.stage_start = self.capture.mark();
    }

    /// Writes the log of a stage that just returned from `execute`.
    /// Stages that did not opt in only get an advisory.
    pub fn end_stage(&mut self, stage: &Stage) -> anyhow::Result<()> {
        if !stage.makes_stage_log() {
            tracing::warn!(
                "Stage {} does not make a stage log, skipping its provenance copy",
                stage.key()
            );
            return Ok(());
        }

        let text = self.capture.text_since(self.stage_start);
        let log_dir = self.run_dir.join("stages").join(stage.key());
        write_file(
            &log_dir.join("stage.log"),
            &format!("# stage {} run {}\n{text}", stage.key(), self.run_id),
        )?;
        write_file(&log_dir.join("config_raw.yaml"), &self.config_raw)?;
        write_file(&log_dir.join("config_resolved.yaml"), &self.config_resolved)?;

        let bound = BTreeMap::from([(STAGE_KEY.to_string(), stage.dir_name().to_string())]);
        let stage_dir = Utf8PathBuf::from(self.names.render_with(&self.stage_dir, &bound)?);
        let target = stage_dir.join("logs").join(&self.run_id);
        crate::io::copy_rec(&log_dir, &target).with_context(|| format!("copying stage log to {target}"))?;

        tracing::debug!("Stage log for {} written to {target}", stage.key());
        Ok(())
    }

    /// Writes the run-level files. Called exactly once per run, whether the
    /// run succeeded or not.
    pub fn finalize(self, outcome: &str) -> anyhow::Result<Utf8PathBuf> {
        let mut text = self.capture.text_since(self.start);
        text.push_str(&format!("# run {} {outcome}\n", self.run_id));

        write_file(&self.run_dir.join("pipeline.log"), &text)?;
        write_file(&self.run_dir.join("config_raw.yaml"), &self.config_raw)?;
        write_file(&self.run_dir.join("config_resolved.yaml"), &self.config_resolved)?;
        write_file(
            &self.run_dir.join("manifest.json"),
            &serde_json::to_string_pretty(&self.manifest)?,
        )?;

        tracing::info!("Provenance log written to {}", self.run_dir);
        Ok(self.run_dir.clone())
    }
}

impl Drop for LogMaker {
    fn drop(&mut self) {
        self.capture.release(self.start);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::spec::{PipelineSpec, StageSpec};

    #[test]
    fn test_capture_marks() {
        let capture = LogCapture::default();
        capture.append("before\n");
        let mark = capture.mark();

        let mut writer = capture.make_writer();
        writer.write_all(b"after\n").unwrap();

        assert_eq!(capture.text_since(mark), "after\n");
        assert_eq!(capture.text_since(0), "before\nafter\n");
        assert_eq!(capture.text_since(1000), "");
    }

    #[test]
    fn test_capture_trimmed_on_release() {
        let capture = LogCapture::default();
        capture.append("old\n");

        let outer = capture.pin();
        capture.append("first\n");
        let inner = capture.pin();
        capture.append("second\n");

        capture.release(inner);
        assert_eq!(capture.text_since(outer), "first\nsecond\n");

        capture.release(outer);
        assert!(capture.is_empty());
        assert_eq!(capture.text_since(outer), "");

        // positions keep counting after a trim
        let mark = capture.pin();
        assert_eq!(mark, "old\nfirst\nsecond\n".len());
        capture.append("third\n");
        assert_eq!(capture.text_since(mark), "third\n");
        capture.release(mark);
        assert!(capture.is_empty());
    }

    #[test]
    fn test_resolved_config_uses_producer_dir() {
        let spec = PipelineSpec::new()
            .stage(
                "ps_setup",
                StageSpec::default()
                    .dir_name("Setup")
                    .output("cmb_ps", "text_array", "{root}/{stage}/{split}/ps.txt"),
            )
            .stage("ps2map", StageSpec::default().input("cmb_ps", "ps_setup"));
        let settings = Settings::new(spec).with_context("root", "/r");
        let names = NameTracker::new([("root", "/r")]);
        let graph = StageGraph::resolve(&settings.pipeline, &HandlerRegistry::with_builtins()).unwrap();

        let text = resolve_config(&settings, &names, &graph).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();

        let input = &value["stages"]["ps2map"]["assets_in"]["cmb_ps"];
        assert_eq!(input["path"].as_str(), Some("/r/Setup/{split}/ps.txt"));
        assert_eq!(input["from"].as_str(), Some("ps_setup.cmb_ps"));
        assert_eq!(value["context"]["root"].as_str(), Some("/r"));
    }

    #[test]
    fn test_hash_sources() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("b.txt"), "ignored").unwrap();

        let names = NameTracker::new([("src_root", root.as_str())]);
        let sources = hash_sources(&["{src_root}/*.rs".to_string()], &names).unwrap();

        assert_eq!(sources.len(), 1);
        assert!(sources[0].path.as_str().ends_with("a.rs"));
        assert_eq!(
            sources[0].blake3,
            blake3::hash(b"fn main() {}").to_hex().to_string()
        );
    }
}
