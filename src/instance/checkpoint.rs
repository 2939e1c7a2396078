//! Durable resume position.
//!
//! One small text file per stream: MySQL writes `file\nposition\n`,
//! PostgreSQL a single `HEX/HEX` line. Writes are full-file rewrites
//! serialized by a mutex; durability between checkpoints is best-effort
//! by design (sinks must tolerate at-least-once replay).

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};
use crate::instance::metadata::{EntryPosition, Lsn};

struct CheckpointState {
    events_since_save: u64,
    last_mysql: Option<EntryPosition>,
    last_lsn: Option<Lsn>,
}

pub struct CheckpointStore {
    path: Option<PathBuf>,
    /// 0 means checkpoint after every event.
    save_position_event_count: u64,
    state: Mutex<CheckpointState>,
}

impl CheckpointStore {
    pub fn new(path: Option<PathBuf>, save_position_event_count: u64) -> CheckpointStore {
        CheckpointStore {
            path,
            save_position_event_count,
            state: Mutex::new(CheckpointState {
                events_since_save: 0,
                last_mysql: None,
                last_lsn: None,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn load_mysql(&self) -> StreamResult<Option<EntryPosition>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StreamError::Checkpoint(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut lines = text.lines();
        let (Some(file), Some(position)) = (lines.next(), lines.next()) else {
            return Err(StreamError::Checkpoint(format!(
                "malformed checkpoint file {}",
                path.display()
            )));
        };
        let position = position.trim().parse().map_err(|_| {
            StreamError::Checkpoint(format!("bad position in {}", path.display()))
        })?;
        Ok(Some(EntryPosition::from_position(
            file.trim().to_string(),
            position,
        )))
    }

    pub fn load_lsn(&self) -> StreamResult<Option<Lsn>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StreamError::Checkpoint(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let line = text.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line.parse()?))
    }

    /// Persist a MySQL position. Regressions are refused so the stored
    /// checkpoint never moves backwards within a run.
    pub fn save_mysql(&self, position: &EntryPosition) -> StreamResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap();
        if let Some(last) = &state.last_mysql {
            if position.is_before(last) {
                warn!("refusing checkpoint regression {} -> {}", last, position);
                return Ok(());
            }
        }
        fs::write(
            path,
            format!("{}\n{}\n", position.journal_name, position.position),
        )
        .map_err(|e| StreamError::Checkpoint(format!("write {}: {}", path.display(), e)))?;
        debug!("checkpoint saved: {}", position);
        state.last_mysql = Some(position.clone());
        state.events_since_save = 0;
        Ok(())
    }

    pub fn save_lsn(&self, lsn: Lsn) -> StreamResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_lsn {
            if lsn < last {
                warn!("refusing checkpoint regression {} -> {}", last, lsn);
                return Ok(());
            }
        }
        fs::write(path, format!("{}\n", lsn))
            .map_err(|e| StreamError::Checkpoint(format!("write {}: {}", path.display(), e)))?;
        debug!("checkpoint saved: {}", lsn);
        state.last_lsn = Some(lsn);
        state.events_since_save = 0;
        Ok(())
    }

    /// Event-count advancement policy: with a zero threshold every tick
    /// checkpoints; otherwise only after the configured number of events
    /// (or when `force` is set, as on ROTATE/COMMIT).
    pub fn should_save(&self, force: bool) -> bool {
        if force {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        state.events_since_save += 1;
        self.save_position_event_count == 0
            || state.events_since_save >= self.save_position_event_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.txt");
        let store = CheckpointStore::new(Some(path.clone()), 0);
        assert_eq!(store.load_mysql().unwrap(), None);
        let pos = EntryPosition::from_position("mysql-bin.000042".into(), 12345);
        store.save_mysql(&pos).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "mysql-bin.000042\n12345\n"
        );
        assert_eq!(store.load_mysql().unwrap(), Some(pos));
    }

    #[test]
    fn test_lsn_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.txt");
        let store = CheckpointStore::new(Some(path.clone()), 0);
        let lsn: Lsn = "16/B2B80".parse().unwrap();
        store.save_lsn(lsn).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "16/B2B80\n");
        assert_eq!(store.load_lsn().unwrap(), Some(lsn));
    }

    #[test]
    fn test_monotonic_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.txt");
        let store = CheckpointStore::new(Some(path.clone()), 0);
        store
            .save_mysql(&EntryPosition::from_position("mysql-bin.000042".into(), 500))
            .unwrap();
        store
            .save_mysql(&EntryPosition::from_position("mysql-bin.000042".into(), 100))
            .unwrap();
        // the earlier position was refused
        assert_eq!(
            store.load_mysql().unwrap().unwrap().position,
            500
        );
        // a later file always wins
        store
            .save_mysql(&EntryPosition::from_position("mysql-bin.000043".into(), 4))
            .unwrap();
        assert_eq!(
            store.load_mysql().unwrap().unwrap().journal_name,
            "mysql-bin.000043"
        );
    }

    #[test]
    fn test_event_count_policy() {
        let store = CheckpointStore::new(None, 3);
        assert!(!store.should_save(false));
        assert!(!store.should_save(false));
        assert!(store.should_save(false));
        // counter resets only on an actual save; force bypasses it
        assert!(store.should_save(true));
    }

    #[test]
    fn test_zero_threshold_saves_every_event() {
        let store = CheckpointStore::new(None, 0);
        assert!(store.should_save(false));
        assert!(store.should_save(false));
    }

    #[test]
    fn test_disabled_store_is_noop() {
        let store = CheckpointStore::new(None, 0);
        assert!(!store.enabled());
        store
            .save_mysql(&EntryPosition::from_position("f".into(), 1))
            .unwrap();
        assert_eq!(store.load_mysql().unwrap(), None);
    }
}
