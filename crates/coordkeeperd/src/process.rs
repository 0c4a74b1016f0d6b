//! Concrete [`BrokerProcess`]/[`BrokerProperties`] implementations backing
//! an actual broker subprocess and its on-disk properties file.

use std::collections::HashMap;
use std::process::{Child, Command};

use coordkeeper_scheduler::{BrokerProcess, BrokerProperties};
use coordkeeper_scheduler::{Result as SchedResult, SchedulerError};

/// Launches and supervises the broker subprocess via a plain command line.
pub struct SubprocessBrokerProcess {
    command: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl SubprocessBrokerProcess {
    /// Build a process handle that will run `command args...` on
    /// [`BrokerProcess::start`].
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        SubprocessBrokerProcess {
            command: command.into(),
            args,
            child: None,
        }
    }
}

impl BrokerProcess for SubprocessBrokerProcess {
    fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn start(&mut self) -> SchedResult<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let child = Command::new(&self.command)
            .args(&self.args)
            .spawn()
            .map_err(|e| SchedulerError::Process(e.to_string()))?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> SchedResult<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().map_err(|e| SchedulerError::Process(e.to_string()))?;
            child.wait().map_err(|e| SchedulerError::Process(e.to_string()))?;
        }
        Ok(())
    }
}

/// Holds the broker's properties file in memory, loaded once on
/// construction. `set`/`delete` edit the in-memory map only; [`Self::dump`]
/// flushes it back to disk in one write, so a batch of edits (`broker.id`,
/// `zookeeper.connect`) lands on disk atomically with respect to the file's
/// previous contents.
pub struct FileBrokerProperties {
    path: String,
    values: HashMap<String, String>,
}

impl FileBrokerProperties {
    /// Load the properties file at `path` into memory.
    pub fn open(path: impl Into<String>) -> SchedResult<Self> {
        let path = path.into();
        let values = if std::path::Path::new(&path).exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| SchedulerError::Properties(e.to_string()))?;
            Self::parse(&contents)
        } else {
            HashMap::new()
        };
        Ok(FileBrokerProperties { path, values })
    }

    fn parse(contents: &str) -> HashMap<String, String> {
        contents
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                line.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

impl BrokerProperties for FileBrokerProperties {
    fn get(&self, key: &str) -> SchedResult<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> SchedResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> SchedResult<()> {
        self.values.remove(key);
        Ok(())
    }

    fn dump(&mut self) -> SchedResult<()> {
        std::fs::write(&self.path, self.render()).map_err(|e| SchedulerError::Properties(e.to_string()))
    }
}
