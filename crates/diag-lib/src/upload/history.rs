//! Recently returned upload URLs

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Entries kept on disk
pub const HISTORY_LIMIT: usize = 10;

const HISTORY_FILE: &str = "history.txt";

/// `history.txt`, newest entry first
#[derive(Debug, Clone)]
pub struct History {
    file: PathBuf,
    entries: Vec<String>,
}

impl History {
    pub fn load(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(HISTORY_FILE);
        let entries = match std::fs::read_to_string(&file) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { file, entries })
    }

    pub fn push(&mut self, url: &str) {
        self.entries.insert(0, url.to_string());
        self.entries.truncate(HISTORY_LIMIT);
    }

    pub fn store(&self) -> Result<()> {
        let mut content = self.entries.join("\n");
        content.push('\n');
        std::fs::write(&self.file, content)?;
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
