//! Session state snapshots.
//!
//! A snapshot is the runtime's opaque state buffer, byte for byte. Files hold
//! exactly that buffer with no header; a snapshot is only meaningful to the
//! same model with the same context size.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use llama_engine::{LlamaError, Result, Runtime};
use tracing::{debug, warn};

use crate::session::Session;

/// Copy the runtime's full state into a new buffer of exactly `state_size()` bytes.
pub fn snapshot<R: Runtime + ?Sized>(rt: &R) -> Result<Vec<u8>> {
    let size = rt.state_size();
    let mut buf = vec![0u8; size];
    let written = rt.state_get(&mut buf);
    if written != size {
        return Err(LlamaError::State(format!(
            "runtime wrote {written} of {size} state bytes"
        )));
    }
    Ok(buf)
}

/// Replace the runtime's state with `bytes`.
///
/// A buffer of the wrong length is rejected before the runtime sees it.
pub fn restore<R: Runtime + ?Sized>(rt: &mut R, bytes: &[u8]) -> Result<()> {
    let expected = rt.state_size();
    if bytes.len() != expected {
        return Err(LlamaError::State(format!(
            "snapshot is {} bytes, runtime expects {expected}",
            bytes.len()
        )));
    }
    if rt.state_set(bytes) == 0 {
        return Err(LlamaError::State("runtime rejected the snapshot".into()));
    }
    Ok(())
}

/// Write a snapshot to `path`, replacing any existing file atomically.
pub fn write_snapshot(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| LlamaError::Io(e.error))?;
    Ok(())
}

/// Read a snapshot file that must be exactly `expected` bytes long.
pub fn read_snapshot(path: impl AsRef<Path>, expected: usize) -> Result<Vec<u8>> {
    let file = File::open(path.as_ref())?;
    let mut buf = Vec::with_capacity(expected);
    file.take(expected as u64 + 1).read_to_end(&mut buf)?;
    if buf.len() != expected {
        let found = if buf.len() > expected {
            format!("more than {expected}")
        } else {
            buf.len().to_string()
        };
        return Err(LlamaError::State(format!(
            "{}: expected {expected} bytes, found {found}",
            path.as_ref().display()
        )));
    }
    Ok(buf)
}

impl Session {
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot(self.runtime())
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let id = self.id();
        restore(self.runtime_mut(), bytes)
            .inspect_err(|e| warn!(session = %id, error = %e, "state restore failed"))
    }

    /// Save the runtime state to `path`. Returns the number of bytes written.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = self.snapshot()?;
        write_snapshot(path.as_ref(), &bytes)?;
        debug!(session = %self.id(), path = %path.as_ref().display(), bytes = bytes.len(), "state saved");
        Ok(bytes.len())
    }

    /// Load runtime state from `path`. Returns the number of bytes read.
    ///
    /// On any error the runtime state is left as it was.
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = read_snapshot(path.as_ref(), self.runtime().state_size())
            .inspect_err(|e| warn!(session = %self.id(), error = %e, "state file rejected"))?;
        self.restore(&bytes)?;
        debug!(session = %self.id(), path = %path.as_ref().display(), bytes = bytes.len(), "state loaded");
        Ok(bytes.len())
    }
}
