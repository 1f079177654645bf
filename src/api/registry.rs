//! Registry of open files
//!
//! Maps handle ids to [`FileDesc`]s. The registry is owned by the
//! [`crate::api::Pio`] instance of a rank, not global, so independent
//! instances never see each other's files. Entries are only inserted after
//! a successful collective open/create and only removed after a successful
//! collective close.

use std::collections::HashMap;

use super::types::FileDesc;
use crate::error::{PioError, PioResult};

#[derive(Debug, Default)]
pub struct FileRegistry {
    files: HashMap<i32, FileDesc>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open file
    ///
    /// # Returns
    /// * `Err(HandleInUse)` - A file with the same id is still open
    pub fn insert(&mut self, desc: FileDesc) -> PioResult<()> {
        if self.files.contains_key(&desc.id) {
            tracing::error!("Handle {} is already registered", desc.id);
            return Err(PioError::HandleInUse(desc.id));
        }
        tracing::debug!(
            "Registered file {} ({}, {} open)",
            desc.id,
            desc.path,
            self.files.len() + 1
        );
        self.files.insert(desc.id, desc);
        Ok(())
    }

    /// Look up an open file; unknown and closed ids are `BadHandle`
    pub fn lookup(&self, id: i32) -> PioResult<&FileDesc> {
        self.files.get(&id).ok_or(PioError::BadHandle(id))
    }

    pub fn lookup_mut(&mut self, id: i32) -> PioResult<&mut FileDesc> {
        self.files.get_mut(&id).ok_or(PioError::BadHandle(id))
    }

    pub fn remove(&mut self, id: i32) -> PioResult<FileDesc> {
        let desc = self.files.remove(&id).ok_or(PioError::BadHandle(id))?;
        tracing::debug!("Removed file {} ({} open)", id, self.files.len());
        Ok(desc)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.files.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Ids of the files opened through session `iosysid`, ascending
    pub fn ids_for_session(&self, iosysid: i32) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .files
            .values()
            .filter(|f| f.session_id() == iosysid)
            .map(|f| f.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::iosystem::IoSystem;
    use crate::storage::{IoFormat, OpenMode};
    use std::rc::Rc;

    fn desc(id: i32, ios: &Rc<IoSystem>) -> FileDesc {
        FileDesc::new(
            id,
            ios.clone(),
            IoFormat::Classic,
            OpenMode::WRITE,
            "f.nc",
            Some(id),
            4,
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let ios = Rc::new(IoSystem::intracomm(1, Box::new(LocalComm::world(1).remove(0))));
        let mut registry = FileRegistry::new();
        registry.insert(desc(3, &ios)).unwrap();
        registry.insert(desc(4, &ios)).unwrap();
        assert!(matches!(
            registry.insert(desc(3, &ios)),
            Err(PioError::HandleInUse(3))
        ));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(3).unwrap().path, "f.nc");

        registry.remove(3).unwrap();
        assert!(matches!(registry.lookup(3), Err(PioError::BadHandle(3))));
        assert!(matches!(registry.remove(3), Err(PioError::BadHandle(3))));
        assert!(matches!(registry.lookup(99), Err(PioError::BadHandle(99))));
    }

    #[test]
    fn test_ids_per_session() {
        let a = Rc::new(IoSystem::intracomm(1, Box::new(LocalComm::world(1).remove(0))));
        let b = Rc::new(IoSystem::intracomm(2, Box::new(LocalComm::world(1).remove(0))));
        let mut registry = FileRegistry::new();
        registry.insert(desc(7, &a)).unwrap();
        registry.insert(desc(2, &b)).unwrap();
        registry.insert(desc(5, &a)).unwrap();
        assert_eq!(registry.ids_for_session(1), vec![5, 7]);
        assert_eq!(registry.ids_for_session(2), vec![2]);
        assert!(registry.ids_for_session(3).is_empty());
    }
}
