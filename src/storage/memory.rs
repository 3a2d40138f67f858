use super::engine::{Engine, KeyRange, ScanIterator, Status};
use crate::error::Result;

use std::collections::BTreeMap;

/// An in-memory storage engine backed by a B-tree. Data is not persisted,
/// but lives as long as the engine does, which lets the simulator restart a
/// node on top of its previous log.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new, empty in-memory engine.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Memory {
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&mut self, range: KeyRange) -> Box<dyn ScanIterator + '_> {
        Box::new(self.data.range(range).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        let size = self.data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        Ok(Status { name: "memory".to_string(), keys: self.data.len() as u64, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::ops::Bound::{Excluded, Included, Unbounded};

    fn keys(scan: Box<dyn ScanIterator + '_>) -> Result<Vec<Vec<u8>>> {
        scan.map(|r| r.map(|(k, _)| k)).collect()
    }

    #[test]
    fn point_ops() -> Result<()> {
        let mut engine = Memory::new();
        assert_eq!(engine.get(b"a")?, None);
        engine.set(b"a", vec![1])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));
        engine.set(b"a", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![2]));
        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);
        engine.delete(b"a")?;
        Ok(())
    }

    #[test]
    fn scan() -> Result<()> {
        let mut engine = Memory::new();
        for key in [b"b", b"a", b"d", b"c"] {
            engine.set(key, key.to_vec())?;
        }
        assert_eq!(
            keys(engine.scan((Included(b"b".to_vec()), Excluded(b"d".to_vec()))))?,
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(keys(engine.scan((Unbounded, Unbounded)))?.len(), 4);
        let last = engine.scan((Unbounded, Unbounded)).next_back().transpose()?.map(|(k, _)| k);
        assert_eq!(last, Some(b"d".to_vec()));
        assert_eq!(engine.status()?, Status { name: "memory".into(), keys: 4, size: 8 });
        Ok(())
    }
}
