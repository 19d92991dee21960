//! Exit-stats side channel written by the stats shim.
//!
//! Docker's own CPU accounting is unreliable once a container has been
//! removed, so when the shim wraps the program its JSON document is treated
//! as the source of truth for CPU time. The document lands in the working
//! directory, which is bind-mounted and therefore survives removal.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::error::StatsError;

/// File name of the stats document, written into the working directory.
pub const STATS_LOG_FILE_NAME: &str = "exit_stats.json";

const NANOS_PER_SEC: f64 = 1e9;

#[derive(Debug, Deserialize)]
struct ExitStats {
    cgroups: Cgroups,
}

#[derive(Debug, Deserialize)]
struct Cgroups {
    cpu_stats: CpuStats,
}

#[derive(Debug, Deserialize)]
struct CpuStats {
    cpu_usage: CpuUsage,
}

#[derive(Debug, Deserialize)]
struct CpuUsage {
    usage_in_usermode: u64,
    usage_in_kernelmode: u64,
}

/// Reads `(user, system)` CPU seconds from an exit-stats document.
///
/// The shim records nanosecond counters; both are scaled to seconds here.
pub fn read_cpu_times(path: &Path) -> Result<(f64, f64), StatsError> {
    let file = File::open(path)?;
    let stats: ExitStats = serde_json::from_reader(BufReader::new(file))?;
    let usage = stats.cgroups.cpu_stats.cpu_usage;
    Ok((
        usage.usage_in_usermode as f64 / NANOS_PER_SEC,
        usage.usage_in_kernelmode as f64 / NANOS_PER_SEC,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_stats(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write stats");
        file
    }

    #[test]
    fn test_reads_cpu_seconds_from_nanosecond_counters() {
        let file = write_stats(
            r#"{"cgroups":{"cpu_stats":{"cpu_usage":{
                "usage_in_usermode": 1500000000,
                "usage_in_kernelmode": 250000000
            }}}}"#,
        );

        let (user, sys) = read_cpu_times(file.path()).expect("parse");
        assert!((user - 1.5).abs() < f64::EPSILON);
        assert!((sys - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = read_cpu_times(Path::new("/nonexistent/exit_stats.json"));
        assert!(matches!(err, Err(StatsError::Io(_))));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let file = write_stats("{not json");
        assert!(matches!(
            read_cpu_times(file.path()),
            Err(StatsError::Json(_))
        ));
    }

    #[test]
    fn test_missing_fields_are_an_error() {
        let file = write_stats(r#"{"cgroups":{"cpu_stats":{}}}"#);
        assert!(matches!(
            read_cpu_times(file.path()),
            Err(StatsError::Json(_))
        ));
    }
}
