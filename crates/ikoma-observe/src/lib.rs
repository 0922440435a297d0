use anyhow::Result;
use chrono::Utc;
use ikoma_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only run log under the runtime directory. Warnings are mirrored
/// to stderr; everything else stays quiet unless verbose mode is on.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record a run event, e.g. a phase transition or a stop reason.
    pub fn event(&self, run_id: &str, msg: &str) {
        let _ = self.append_log_line(&format!(
            "{} EVENT run={run_id} {msg}",
            Utc::now().to_rfc3339()
        ));
        if self.verbose {
            eprintln!("[ikoma] {run_id}: {msg}");
        }
    }

    /// Log a message to stderr with `[ikoma]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[ikoma] {msg}");
        }
    }

    /// Log a warning. Written to the log file and mirrored to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[ikoma WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_and_warnings_land_in_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(dir.path()).expect("observer");
        observer.event("run-1", "phase=plan");
        observer.warn_log("something odd");

        let log = fs::read_to_string(runtime_dir(dir.path()).join("observe.log")).expect("log");
        assert!(log.contains("EVENT run=run-1 phase=plan"));
        assert!(log.contains("WARN something odd"));
    }
}
