//! Benchmark tracks.
//!
//! A track is a YAML file naming a benchmark and the task tree it runs:
//!
//! ```yaml
//! name: geonames
//! description: Index and query geographic points
//! schedule:
//!   type: sequential
//!   tasks:
//!     - type: task
//!       name: index-append
//!       operation: bulk
//!       clients: 8
//!       warmup_iterations: 100
//!       iterations: 1000
//!     - type: task
//!       name: search
//!       operation: query
//!       target_throughput: 50
//!       time_period: 2m
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use loaddriver_types::TaskNode;
use serde::Deserialize;

/// A named benchmark with its task tree.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Track {
    /// Name of the benchmark.
    pub name: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// The task tree executed by the run.
    pub schedule: TaskNode,
}

impl Track {
    /// Reads and validates a track file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open track file {}", path.display()))?;
        let track: Self = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse track file {}", path.display()))?;

        track.validate()?;
        Ok(track)
    }

    /// Parses and validates a track from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let track: Self = serde_yaml::from_str(yaml).context("failed to parse track")?;
        track.validate()?;
        Ok(track)
    }

    fn validate(&self) -> Result<()> {
        self.schedule
            .validate()
            .with_context(|| format!("invalid schedule in track `{}`", self.name))
    }

    /// Prints an outline of the track's tasks.
    pub fn print_outline(&self) {
        println!("{}", self.name);
        if let Some(ref description) = self.description {
            println!("  {description}");
        }
        for task in self.schedule.leaves() {
            println!(
                "  - {} ({}, {} client(s))",
                task.name, task.operation, task.clients
            );
        }
    }
}
