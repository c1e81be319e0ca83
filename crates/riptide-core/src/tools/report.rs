//! Tabular runtime report
//!
//! Formats a list of variables as `name=value` columns and writes them to
//! stdout or a file when the iteration-count (`ipf`) or wall-time (`fps`)
//! threshold is met. Semicolons in the field list break lines; commas or
//! spaces separate columns. Reading happens in a completion callback
//! gated on the inputs' writing events; the out-event registers the
//! report as a reader so writers wait until the snapshot is taken.

use crate::error::{Error, Result};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::variables::Variable;
use parking_lot::Mutex;
use riptide_backends::{Event, EventStatus, STATUS_EXEC_ERROR};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

enum Sink {
    Stdout,
    File(Arc<Mutex<std::fs::File>>),
}

/// Periodic tabular output of scalar variables
pub struct Report {
    meta: ToolMeta,
    fields_spec: String,
    ipf: u32,
    fps: f32,
    path: Option<PathBuf>,
    sink: Option<Sink>,
    lines: Vec<Vec<Arc<Variable>>>,
    last_iter: u32,
    last_time: f32,
}

impl Report {
    /// Report `fields` every `ipf` iterations or `fps` outputs per
    /// simulated second (either may be zero); `path` selects a file sink
    /// over stdout
    pub fn new(name: &str, fields: &str, ipf: u32, fps: f32, path: Option<PathBuf>) -> Self {
        Self {
            meta: ToolMeta::new(name, false),
            fields_spec: fields.to_string(),
            ipf,
            fps,
            path,
            sink: None,
            lines: Vec::new(),
            last_iter: 0,
            last_time: 0.0,
        }
    }

    fn process_fields(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();
        for line in self.fields_spec.split(';') {
            let mut columns = Vec::new();
            for name in line.split(|c| c == ',' || c == ' ').filter(|s| !s.is_empty()) {
                columns.push(vars.require(name)?);
            }
            if !columns.is_empty() {
                self.lines.push(columns);
            }
        }
        Ok(())
    }

    /// Whether a threshold fired for the current iteration/time
    fn must_update(&mut self, server: &Arc<CalcServer>) -> bool {
        let vars = server.variables();
        let iter = vars
            .get("iter")
            .and_then(|v| v.scalar().ok())
            .and_then(|v| v.as_u32())
            .unwrap_or(0);
        let time = vars
            .get("t")
            .and_then(|v| v.scalar().ok())
            .map(|v| v.component(0) as f32)
            .unwrap_or(0.0);

        if self.ipf > 0 && iter.wrapping_sub(self.last_iter) >= self.ipf {
            self.last_iter = iter;
            self.last_time = time;
            return true;
        }
        if self.fps > 0.0 && time - self.last_time >= 1.0 / self.fps {
            self.last_iter = iter;
            self.last_time = time;
            return true;
        }
        false
    }

    fn format_lines(lines: &[Vec<Arc<Variable>>]) -> Result<String> {
        let mut out = String::new();
        for columns in lines {
            for (index, variable) in columns.iter().enumerate() {
                if index > 0 {
                    out.push(' ');
                }
                if variable.is_array() {
                    out.push_str(&format!("{}[{}]", variable.name(), variable.len()?));
                } else {
                    out.push_str(&format!("{}={}", variable.name(), variable.scalar()?));
                }
            }
            out.push('\n');
        }
        Ok(out)
    }
}

impl Tool for Report {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        self.process_fields(server)?;
        let inputs: Vec<Arc<Variable>> = self.lines.iter().flatten().cloned().collect();
        self.meta.set_dependencies(inputs, Vec::new());

        self.sink = Some(match &self.path {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|err| Error::Communication(format!("cannot open report file: {err}")))?;
                Sink::File(Arc::new(Mutex::new(file)))
            }
            None => Sink::Stdout,
        });
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        if !self.must_update(server) {
            return Ok(None);
        }

        let queue = server.context().queue();
        let trigger = queue.marker(wait)?;
        let user_event = Event::user();

        let server = server.clone();
        let lines = self.lines.clone();
        let name = self.meta.name().to_string();
        let sink = match self.sink.as_ref() {
            Some(Sink::File(file)) => Some(file.clone()),
            _ => None,
        };
        let done = user_event.clone();

        trigger.on_complete(move |status| {
            if let EventStatus::Error(code) = status {
                done.fail(code);
                return;
            }
            let write = || -> Result<()> {
                let text = Report::format_lines(&lines)?;
                match &sink {
                    Some(file) => file
                        .lock()
                        .write_all(text.as_bytes())
                        .map_err(|err| Error::Communication(format!("report write failed: {err}")))?,
                    None => print!("{name}:\n{text}"),
                }
                Ok(())
            };
            match write() {
                Ok(()) => done.complete(),
                Err(err) => {
                    server.latch_fatal(err);
                    done.fail(STATUS_EXEC_ERROR);
                }
            }
        });

        Ok(Some(queue.marker(&[user_event])?))
    }
}
