use indexmap::IndexMap;

use crate::error::LedgerError;
use crate::ledger::{Analysis, Ledger};

/// Analyses held in memory, counting writes so tests can check the
/// one-write-per-unit-per-cycle contract
#[derive(Debug, Default)]
pub struct MemoryLedger {
    analyses: IndexMap<String, Analysis>,
    writes: usize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        MemoryLedger::default()
    }

    /// Number of `update` calls so far
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl FromIterator<Analysis> for MemoryLedger {
    fn from_iter<I: IntoIterator<Item = Analysis>>(iter: I) -> Self {
        MemoryLedger {
            analyses: iter.into_iter().map(|a| (a.name.clone(), a)).collect(),
            writes: 0,
        }
    }
}

impl Ledger for MemoryLedger {
    fn analyses(&self) -> Result<Vec<Analysis>, LedgerError> {
        Ok(self.analyses.values().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Analysis, LedgerError> {
        self.analyses
            .get(name)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAnalysis(name.to_string()))
    }

    fn insert(&mut self, analysis: &Analysis) -> Result<(), LedgerError> {
        if self.analyses.contains_key(&analysis.name) {
            return Err(LedgerError::DuplicateAnalysis(analysis.name.clone()));
        }
        self.analyses.insert(analysis.name.clone(), analysis.clone());
        Ok(())
    }

    fn update(&mut self, analysis: &Analysis) -> Result<(), LedgerError> {
        let slot = self
            .analyses
            .get_mut(&analysis.name)
            .ok_or_else(|| LedgerError::UnknownAnalysis(analysis.name.clone()))?;
        *slot = analysis.clone();
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::state::LifecycleState;

    #[test]
    fn updates_are_counted() {
        let mut ledger: MemoryLedger = vec![Analysis::new("a", "generic")].into_iter().collect();
        let a = ledger.get("a").unwrap().with_state(LifecycleState::Ready);
        ledger.update(&a).unwrap();
        assert_eq!(ledger.writes(), 1);
        assert_eq!(ledger.get("a").unwrap().state, LifecycleState::Ready);
        assert!(ledger.update(&Analysis::new("b", "generic")).is_err());
        assert_eq!(ledger.writes(), 1);
    }
}
