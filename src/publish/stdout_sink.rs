//! Debug sink: one JSON record per line on stdout.

use std::io::Write;

use crate::error::StreamResult;
use crate::publish::api::{Publisher, PublisherConfig, PublisherContext};
use crate::record::CdcEvent;

pub struct StdoutPublisher {
    prefix: String,
    events_written: u64,
}

impl StdoutPublisher {
    pub fn new() -> StdoutPublisher {
        StdoutPublisher {
            prefix: String::new(),
            events_written: 0,
        }
    }
}

impl Default for StdoutPublisher {
    fn default() -> Self {
        StdoutPublisher::new()
    }
}

impl Publisher for StdoutPublisher {
    fn name(&self) -> &str {
        "stdout"
    }

    fn init(&mut self, ctx: &PublisherContext, config: &PublisherConfig) -> StreamResult<()> {
        self.prefix = ctx.get(config, "prefix").unwrap_or_default().to_string();
        Ok(())
    }

    fn publish(&mut self, event: &CdcEvent) -> StreamResult<()> {
        let mut stdout = std::io::stdout().lock();
        if self.prefix.is_empty() {
            writeln!(stdout, "{}", event.json)?;
        } else {
            writeln!(stdout, "{} {}", self.prefix, event.json)?;
        }
        self.events_written += 1;
        Ok(())
    }
}
