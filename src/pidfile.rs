//! PID file helper (§6): ASCII decimal PID followed by a newline, written
//! once at startup and never removed on exit.

use std::fs;
use std::path::Path;

use crate::error::Result;

pub fn write(path: &Path) -> Result<()> {
    let pid = std::process::id();
    fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid_followed_by_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bearerbox.pid");
        write(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        let pid: u32 = contents.trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
