//! Per-task log streams.
//!
//! Each task owns `<log_root>/<task_id>/` with three files: `debug`
//! (free-form lines), `event` (JSON lines marking stage progress) and
//! `result` (written once at the end). The debug and event streams are
//! append-only while the task runs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

pub struct TaskLogger {
    dir: PathBuf,
    debug: Mutex<File>,
    event: Mutex<File>,
}

impl TaskLogger {
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            debug: Mutex::new(open("debug")?),
            event: Mutex::new(open("event")?),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a line to the debug stream.
    pub fn debug(&self, line: &str) {
        let mut file = self.debug.lock().unwrap();
        let _ = writeln!(file, "[{}] {line}", epoch_secs());
    }

    /// Append a stage-progress event (JSON line).
    pub fn event(&self, stage: &str, task: &str, index: usize, total: usize, state: &str) {
        let entry = json!({
            "time": epoch_secs(),
            "stage": stage,
            "task": task,
            "index": index,
            "total": total,
            "state": state,
        });
        let mut file = self.event.lock().unwrap();
        let _ = writeln!(file, "{entry}");
    }

    /// Write the result stream (once, at task completion).
    pub fn write_result(&self, text: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.join("result"), text)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_land_in_the_task_directory() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("7");
        let logger = TaskLogger::create(&task_dir).unwrap();

        logger.debug("binding plan");
        logger.debug("compiling packages");
        logger.event("Updating job", "web/0", 1, 3, "started");
        logger.write_result("/deployments/prod").unwrap();

        let debug = std::fs::read_to_string(task_dir.join("debug")).unwrap();
        assert_eq!(debug.lines().count(), 2);
        assert!(debug.contains("binding plan"));

        let event = std::fs::read_to_string(task_dir.join("event")).unwrap();
        let line: serde_json::Value = serde_json::from_str(event.lines().next().unwrap()).unwrap();
        assert_eq!(line["stage"], "Updating job");
        assert_eq!(line["total"], 3);

        assert_eq!(
            std::fs::read_to_string(task_dir.join("result")).unwrap(),
            "/deployments/prod"
        );
    }

    #[test]
    fn debug_is_append_only_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("8");
        {
            let logger = TaskLogger::create(&task_dir).unwrap();
            logger.debug("first");
        }
        {
            let logger = TaskLogger::create(&task_dir).unwrap();
            logger.debug("second");
        }
        let debug = std::fs::read_to_string(task_dir.join("debug")).unwrap();
        assert!(debug.contains("first"));
        assert!(debug.contains("second"));
    }
}
