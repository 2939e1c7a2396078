//! File sink: one JSON record per line, with optional flush-per-event
//! and event-count rotation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use crate::error::{StreamError, StreamResult};
use crate::publish::api::{Publisher, PublisherConfig, PublisherContext};
use crate::record::CdcEvent;

pub struct FilePublisher {
    ctx: PublisherContext,
    file_path: String,
    fp: Option<BufWriter<File>>,
    flush_every_event: bool,
    events_written: u64,
    /// 0 disables rotation.
    rotate_max_events: u64,
    rotate_max_files: u32,
    events_in_file: u64,
}

impl FilePublisher {
    pub fn new() -> FilePublisher {
        FilePublisher {
            ctx: PublisherContext::default(),
            file_path: String::new(),
            fp: None,
            flush_every_event: false,
            events_written: 0,
            rotate_max_events: 0,
            rotate_max_files: 0,
            events_in_file: 0,
        }
    }

    fn open(&mut self) -> StreamResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|e| {
                StreamError::Publisher(format!("open {}: {}", self.file_path, e))
            })?;
        self.fp = Some(BufWriter::new(file));
        self.events_in_file = 0;
        Ok(())
    }

    /// Shift `path.(n-1)` up to `path.n`, move the live file to `path.0`,
    /// reopen fresh.
    fn rotate(&mut self) -> StreamResult<()> {
        if self.rotate_max_files == 0 {
            return Ok(());
        }
        self.ctx
            .log_info(&format!("rotating file publisher output: {}", self.file_path));
        if let Some(mut fp) = self.fp.take() {
            fp.flush().ok();
        }
        for i in (1..self.rotate_max_files).rev() {
            let from = format!("{}.{}", self.file_path, i - 1);
            let to = format!("{}.{}", self.file_path, i);
            if std::path::Path::new(&from).exists() {
                std::fs::rename(&from, &to).ok();
            }
        }
        std::fs::rename(&self.file_path, format!("{}.0", self.file_path)).ok();
        self.open()
    }
}

impl Default for FilePublisher {
    fn default() -> Self {
        FilePublisher::new()
    }
}

impl Publisher for FilePublisher {
    fn name(&self) -> &str {
        "file"
    }

    fn version(&self) -> &str {
        "1.1.0"
    }

    fn init(&mut self, ctx: &PublisherContext, config: &PublisherConfig) -> StreamResult<()> {
        self.ctx = ctx.clone();
        self.file_path = ctx
            .get(config, "file_path")
            .ok_or_else(|| StreamError::Publisher("file sink needs file_path".to_string()))?
            .to_string();
        self.flush_every_event = ctx.get_bool(config, "flush_every_event", false);
        self.rotate_max_events = ctx.get_int(config, "rotate_max_events", 0).max(0) as u64;
        self.rotate_max_files = ctx.get_int(config, "rotate_max_files", 5).max(0) as u32;
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        self.open()
    }

    fn publish(&mut self, event: &CdcEvent) -> StreamResult<()> {
        if self.rotate_max_events > 0 && self.events_in_file >= self.rotate_max_events {
            self.rotate()?;
        }
        let fp = self
            .fp
            .as_mut()
            .ok_or_else(|| StreamError::Publisher("file sink not started".to_string()))?;
        fp.write_all(event.json.as_bytes())
            .and_then(|_| fp.write_all(b"\n"))
            .map_err(|e| StreamError::Publisher(format!("write {}: {}", self.file_path, e)))?;
        if self.flush_every_event {
            fp.flush()
                .map_err(|e| StreamError::Publisher(format!("flush {}: {}", self.file_path, e)))?;
        }
        self.events_written += 1;
        self.events_in_file += 1;
        Ok(())
    }

    fn stop(&mut self) -> StreamResult<()> {
        if let Some(mut fp) = self.fp.take() {
            fp.flush().ok();
        }
        self.ctx.log_info(&format!(
            "file sink wrote {} event(s) to {}",
            self.events_written, self.file_path
        ));
        Ok(())
    }

    fn health_check(&self) -> bool {
        self.fp.is_some()
    }
}
