//! Line-oriented debug/trace log (§6 "File formats"): a single-character
//! tag per line, `i\t<path>` for an image load, `t\t<path>` for a testcase
//! boundary. Distinct from `trace_writer`'s binary `TraceEntry` records —
//! this one is a plain text log meant to be read or grepped directly.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub struct DebugLog {
    file: File,
}

impl DebugLog {
    pub fn create(path: &Path) -> io::Result<DebugLog> {
        Ok(DebugLog { file: File::create(path)? })
    }

    pub fn log_image(&mut self, path: &Path) -> io::Result<()> {
        writeln!(self.file, "i\t{}", path.display())
    }

    pub fn log_testcase(&mut self, path: &Path) -> io::Result<()> {
        writeln!(self.file, "t\t{}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("rvdbm-debug-log-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn writes_tagged_lines_for_image_and_testcase_events() {
        let path = scratch_path("basic");
        {
            let mut log = DebugLog::create(&path).unwrap();
            log.log_image(Path::new("/bin/guest")).unwrap();
            log.log_testcase(Path::new("/tmp/case-1")).unwrap();
        }
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let _ = std::fs::remove_file(&path);
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("i\t/bin/guest"));
        assert_eq!(lines.next(), Some("t\t/tmp/case-1"));
        assert_eq!(lines.next(), None);
    }
}
