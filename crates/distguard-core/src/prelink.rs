//! Canonical hashing of prelinked executables.
//!
//! `prelink` rewrites binaries in place with load addresses chosen per
//! installation, so their raw bytes differ between hosts. Hashing the
//! original image reproduced by `prelink --verify` gives a host-independent
//! digest.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::digest::{Digest256, sha256_reader};

/// Default location of the prelink tool.
pub const DEFAULT_PRELINK_PROGRAM: &str = "/usr/sbin/prelink";

/// Arguments that make `prelink` print the un-relocated image on stdout.
pub const DEFAULT_PRELINK_ARGS: &[&str] = &["--verify"];

/// Produces the original bytes of a prelinked binary.
pub trait Unprelinker: Send + Sync {
    /// Streams the unprelinked content of `path` into the hasher and returns
    /// the digest and length of that content.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot run, fails, or the stream breaks.
    fn unprelinked_digest(&self, path: &Path) -> io::Result<(Digest256, u64)>;
}

/// Runs an external prelink-compatible program.
#[derive(Debug, Clone)]
pub struct PrelinkTool {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for PrelinkTool {
    fn default() -> Self {
        Self::new(
            DEFAULT_PRELINK_PROGRAM,
            DEFAULT_PRELINK_ARGS.iter().map(ToString::to_string),
        )
    }
}

impl PrelinkTool {
    /// Creates a tool invocation `<program> <args...> <path>`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    fn spawn(&self, path: &Path) -> io::Result<(Child, ChildStdout)> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("prelink stdout was not captured"))?;
        Ok((child, stdout))
    }
}

impl Unprelinker for PrelinkTool {
    fn unprelinked_digest(&self, path: &Path) -> io::Result<(Digest256, u64)> {
        let (mut child, stdout) = self.spawn(path)?;
        let hashed = sha256_reader(stdout);
        // Reap before surfacing a stream error so no zombie is left behind.
        let status = child.wait()?;
        let (digest, len) = hashed?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {status} for {}",
                self.program.display(),
                path.display()
            )));
        }
        Ok((digest, len))
    }
}

/// Hashes any reader-producing closure; lets tests stand in for the tool.
pub struct FnUnprelinker<F>(pub F);

impl<F, R> Unprelinker for FnUnprelinker<F>
where
    F: Fn(&Path) -> io::Result<R> + Send + Sync,
    R: Read,
{
    fn unprelinked_digest(&self, path: &Path) -> io::Result<(Digest256, u64)> {
        sha256_reader((self.0)(path)?)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// Stand-in tool: drops the first line (the "load address") of the file.
    fn fake_tool(dir: &Path) -> PrelinkTool {
        let script = dir.join("fake-prelink");
        fs::write(&script, "tail -n +2 \"$2\"\n").unwrap();
        PrelinkTool::new(
            "/bin/sh",
            [script.display().to_string(), "--verify".to_string()],
        )
    }

    #[test]
    fn digest_is_independent_of_load_address() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "BASE=0x400000\nELF payload\n").unwrap();
        fs::write(&b, "BASE=0x7f0000000000\nELF payload\n").unwrap();

        let (da, la) = tool.unprelinked_digest(&a).unwrap();
        let (db, lb) = tool.unprelinked_digest(&b).unwrap();
        assert_eq!(da, db);
        assert_eq!(la, lb);
        assert_eq!(la, "ELF payload\n".len() as u64);
        assert_eq!(tool.unprelinked_digest(&a).unwrap().0, da);
    }

    #[test]
    fn failing_tool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        assert!(tool.unprelinked_digest(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn missing_program_is_an_error() {
        let tool = PrelinkTool::new("/nonexistent/prelink", Vec::new());
        assert!(tool.unprelinked_digest(Path::new("/bin/sh")).is_err());
    }

    #[test]
    fn closure_unprelinker_hashes_returned_stream() {
        let unprelinker = FnUnprelinker(|_: &Path| Ok::<_, io::Error>(&b"abc"[..]));
        let (digest, len) = unprelinker.unprelinked_digest(Path::new("/x")).unwrap();
        assert_eq!(digest, Digest256::of(b"abc"));
        assert_eq!(len, 3);
    }
}
