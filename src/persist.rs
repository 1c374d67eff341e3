//! Restartable channel state.
//!
//! Every transition that commits a fully signed state is appended to a
//! per-channel log. On restart, replaying the log reconstructs the state
//! machine in its last persisted phase; the controller resumes from there.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::channel::machine::Phase;
use crate::channel::state::State;
use crate::types::{ChannelId, Signature, PARTICIPANTS};

/// One committed signed state, with the phase the machine entered when it
/// was committed.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub phase: Phase,
    pub state: State,
    pub sigs: [Signature; PARTICIPANTS],
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persistence backend: {0}")]
    Backend(String),
    #[error("no log for channel {0:?}")]
    UnknownChannel(ChannelId),
}

/// Append-only log of committed states, keyed by channel id.
pub trait Persister: Send + Sync {
    fn append(&self, channel: ChannelId, record: StateRecord) -> Result<(), PersistError>;

    /// The full log, in append order.
    fn log(&self, channel: ChannelId) -> Result<Vec<StateRecord>, PersistError>;

    /// All channels with at least one record.
    fn channels(&self) -> Result<Vec<ChannelId>, PersistError>;
}

/// In-memory persister, useful for tests and as a reference for real
/// backends.
#[derive(Debug, Default)]
pub struct MemPersister {
    inner: Mutex<HashMap<ChannelId, Vec<StateRecord>>>,
}

impl MemPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemPersister {
    fn append(&self, channel: ChannelId, record: StateRecord) -> Result<(), PersistError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| PersistError::Backend(e.to_string()))?;
        inner.entry(channel).or_default().push(record);
        Ok(())
    }

    fn log(&self, channel: ChannelId) -> Result<Vec<StateRecord>, PersistError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PersistError::Backend(e.to_string()))?;
        inner
            .get(&channel)
            .cloned()
            .ok_or(PersistError::UnknownChannel(channel))
    }

    fn channels(&self) -> Result<Vec<ChannelId>, PersistError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PersistError::Backend(e.to_string()))?;
        Ok(inner.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::Allocation;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn record(version: u64, phase: Phase, id: ChannelId) -> StateRecord {
        let mut state = State::initial(
            id,
            Allocation::single_asset([1.into(), 1.into()]),
            vec![],
        );
        for _ in 0..version {
            state = state.make_next();
        }
        StateRecord {
            phase,
            state,
            sigs: [Signature::default(); PARTICIPANTS],
        }
    }

    #[test]
    fn log_preserves_append_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let id: ChannelId = rng.gen();
        let store = MemPersister::new();

        store.append(id, record(0, Phase::Funding, id)).unwrap();
        store.append(id, record(1, Phase::Acting, id)).unwrap();
        store.append(id, record(2, Phase::Acting, id)).unwrap();

        let log = store.log(id).unwrap();
        let versions: Vec<u64> = log.iter().map(|r| r.state.version()).collect();
        assert_eq!(versions, vec![0, 1, 2]);
        assert_eq!(log.last().unwrap().phase, Phase::Acting);
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let store = MemPersister::new();
        let id = ChannelId::default();
        assert!(matches!(
            store.log(id),
            Err(PersistError::UnknownChannel(_))
        ));
        assert!(store.channels().unwrap().is_empty());
    }
}
