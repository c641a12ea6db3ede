//! # Profiling Data
//!
//! Collects call/ret/syscall events and a resolved symbol table from every
//! scheduled thread into a single JSON document, matching the layout the
//! reference profiler visualizer already expects.

#![warn(missing_docs)]

use emu_sched::Thread;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Errors raised while writing a [`ProfileDocument`] to disk.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The document could not be serialized to JSON.
    #[error("failed to serialize profiling data: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The output file could not be written.
    #[error("failed to write profiling data to {path}: {source}")]
    Io {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// One thread's recorded events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadProfile {
    /// Owning process id.
    pub pid: i32,
    /// Thread id.
    pub tid: u32,
    /// `[tick, callee_address]` pairs, in call order.
    #[serde(rename = "callEvents")]
    pub call_events: Vec<[u64; 2]>,
    /// Tick of every `ret`, in occurrence order.
    #[serde(rename = "retEvents")]
    pub ret_events: Vec<u64>,
    /// `[tick, syscall_number]` pairs, in occurrence order.
    #[serde(rename = "syscallEvents")]
    pub syscall_events: Vec<[u64; 2]>,
}

impl ThreadProfile {
    /// Snapshot a [`Thread`]'s recorded events.
    pub fn from_thread(thread: &Thread) -> Self {
        Self {
            pid: thread.pid(),
            tid: thread.tid(),
            call_events: thread.call_events().iter().map(|&(t, a)| [t, a]).collect(),
            ret_events: thread.ret_events().to_vec(),
            syscall_events: thread.syscall_events().iter().map(|&(t, n)| [t, n]).collect(),
        }
    }
}

/// The full profiling output: one entry per thread, plus a symbol table
/// covering every address any thread called into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDocument {
    /// Per-thread event logs.
    pub threads: Vec<ThreadProfile>,
    /// `[address, name]` pairs. Addresses with no resolved symbol are
    /// recorded as `"???"`, matching the reference profiler's placeholder.
    pub symbols: Vec<(u64, String)>,
}

impl ProfileDocument {
    /// Build a document from a set of threads and a symbol resolver.
    ///
    /// `resolve` is called once per distinct call-event address across all
    /// threads; addresses it cannot resolve are recorded as `"???"`.
    pub fn build<'a>(
        threads: impl IntoIterator<Item = &'a Thread>,
        mut resolve: impl FnMut(u64) -> Option<String>,
    ) -> Self {
        let mut profiles = Vec::new();
        let mut addresses = BTreeMap::new();
        for thread in threads {
            for &(_, addr) in thread.call_events() {
                addresses.entry(addr).or_insert(());
            }
            profiles.push(ThreadProfile::from_thread(thread));
        }
        let symbols = addresses
            .into_keys()
            .map(|addr| (addr, resolve(addr).unwrap_or_else(|| "???".to_string())))
            .collect();
        Self { threads: profiles, symbols }
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the document to `path` as JSON.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ProfileError> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let mut file = std::fs::File::create(path)
            .map_err(|source| ProfileError::Io { path: path.display().to_string(), source })?;
        file.write_all(json.as_bytes())
            .map_err(|source| ProfileError::Io { path: path.display().to_string(), source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_sched::Thread;

    #[test]
    fn document_schema_matches_expected_keys() {
        let mut t = Thread::new(1, 2, true);
        t.push_call(emu_addr::GuestAddr::new(0x1010), emu_addr::GuestAddr::new(0x2000));
        t.pop_return();
        t.record_syscall(60);
        let doc = ProfileDocument::build([&t], |_| Some("main".to_string()));
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"callEvents\""));
        assert!(json.contains("\"retEvents\""));
        assert!(json.contains("\"syscallEvents\""));
        assert!(json.contains("\"symbols\""));
        assert_eq!(doc.symbols, vec![(0x2000, "main".to_string())]);
    }

    #[test]
    fn unresolved_symbol_falls_back_to_placeholder() {
        let mut t = Thread::new(1, 2, true);
        t.push_call(emu_addr::GuestAddr::new(0x10), emu_addr::GuestAddr::new(0x99));
        let doc = ProfileDocument::build([&t], |_| None);
        assert_eq!(doc.symbols, vec![(0x99, "???".to_string())]);
    }
}
