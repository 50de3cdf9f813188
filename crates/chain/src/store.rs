//! Local persistence of process descriptors.

use borsh::BorshDeserialize;
use scrutiny_db::{keys, Db};
use scrutiny_interface::{Process, ProcessId, SequencerError};

/// Process records under the `pr_` prefix of the main store. The monitor
/// writes them; the pipeline, finalizer and ingress read them.
#[derive(Clone, Debug)]
pub struct ProcessStore {
    db: Db,
}

impl ProcessStore {
    pub fn new(main: &Db) -> Self {
        Self {
            db: main.prefixed(keys::PROCESS),
        }
    }

    pub fn put(&self, process: &Process) -> Result<(), SequencerError> {
        let bytes =
            borsh::to_vec(process).map_err(|e| SequencerError::Internal(e.to_string()))?;
        self.db.put(&process.id.to_bytes(), &bytes)?;
        Ok(())
    }

    pub fn get(&self, id: &ProcessId) -> Result<Process, SequencerError> {
        match self.db.get(&id.to_bytes())? {
            Some(bytes) => Process::try_from_slice(&bytes)
                .map_err(|e| SequencerError::Io(format!("corrupt process record: {e}"))),
            None => Err(SequencerError::NotFound(format!("process {id}"))),
        }
    }

    pub fn contains(&self, id: &ProcessId) -> Result<bool, SequencerError> {
        Ok(self.db.get(&id.to_bytes())?.is_some())
    }

    /// Every known process. Order is by process id bytes.
    pub fn list(&self) -> Result<Vec<Process>, SequencerError> {
        let mut processes = Vec::new();
        let mut corrupt = None;
        self.db.iter_prefix(b"", |_, value| {
            match Process::try_from_slice(value) {
                Ok(process) => processes.push(process),
                Err(e) => {
                    corrupt = Some(e.to_string());
                    return false;
                }
            }
            true
        })?;
        if let Some(e) = corrupt {
            return Err(SequencerError::Io(format!("corrupt process record: {e}")));
        }
        Ok(processes)
    }
}
