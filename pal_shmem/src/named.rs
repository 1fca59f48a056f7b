//! Named-object directory.
//!
//! A singly linked list of [`NamedObject`] nodes in shared memory, anchored
//! at the [`ShmInfoId::NamedObjects`] info slot. Names are wide strings
//! stored in their own blocks. Every walk and every link update happens
//! under the shared memory lock.

use crate::context::{ShmContext, ShmLockGuard};
use crate::error::{ShmError, ShmResult};
use crate::layout::ShmInfoId;
use crate::shmptr::ShmPtr;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use tracing::{debug, error, trace, warn};

/// Kind of object registered under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NamedObjectType {
    /// File mapping
    Mapping = 0,
    /// Event
    Event = 1,
    /// Mutex
    Mutex = 2,
    /// Semaphore
    Semaphore = 3,
}

impl NamedObjectType {
    /// Convert from raw `u32` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Mapping),
            1 => Some(Self::Event),
            2 => Some(Self::Mutex),
            3 => Some(Self::Semaphore),
            _ => None,
        }
    }
}

/// Directory node as laid out in shared memory.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NamedObject {
    /// Handle of this node
    pub shm_self: ShmPtr,
    /// Next node, null at the tail
    pub shm_next: ShmPtr,
    /// Wide-string name
    pub shm_object_name: ShmPtr,
    /// Raw [`NamedObjectType`]
    pub object_type: u32,
}

const_assert_eq!(core::mem::size_of::<NamedObject>(), 16);

/// Outcome of a lookup by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedObjectLookup {
    /// Name and type match
    Found(ShmPtr),
    /// No object carries this name
    NotFound,
    /// The name is taken by an object of another type
    WrongType,
}

impl ShmContext {
    fn node(&self, ptr: ShmPtr) -> ShmResult<NonNull<NamedObject>> {
        self.ptr_to_ptr(ptr)
            .map(NonNull::cast)
            .ok_or(ShmError::InvalidPointer { ptr })
    }

    fn read_node(&self, ptr: ShmPtr) -> ShmResult<NamedObject> {
        // SAFETY: nodes are 8-aligned blocks of at least 16 bytes, read under the lock.
        Ok(unsafe { self.node(ptr)?.read() })
    }

    fn find_locked(
        &self,
        guard: &ShmLockGuard<'_>,
        name: &[u16],
        object_type: NamedObjectType,
    ) -> ShmResult<NamedObjectLookup> {
        let mut current = self.get_info(guard, ShmInfoId::NamedObjects)?;
        while !current.is_null() {
            let node = self.read_node(current)?;
            if self.read_wstr(node.shm_object_name)? == name {
                if node.object_type != object_type as u32 {
                    debug!(
                        found = ?NamedObjectType::from_u32(node.object_type),
                        wanted = ?object_type,
                        "name exists with another object type"
                    );
                    return Ok(NamedObjectLookup::WrongType);
                }
                return Ok(NamedObjectLookup::Found(node.shm_self));
            }
            current = node.shm_next;
        }
        Ok(NamedObjectLookup::NotFound)
    }

    /// Look up a named object.
    pub fn find_named_object(
        &self,
        name: &[u16],
        object_type: NamedObjectType,
    ) -> ShmResult<NamedObjectLookup> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        self.find_locked(&guard, name, object_type)
    }

    /// Push an initialized node at the head of the directory.
    pub fn add_named_object(&self, node: ShmPtr) -> ShmResult<()> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        self.push_locked(&guard, node)
    }

    fn push_locked(&self, guard: &ShmLockGuard<'_>, node: ShmPtr) -> ShmResult<()> {
        let addr = self.node(node)?;
        let head = self.get_info(guard, ShmInfoId::NamedObjects)?;
        // SAFETY: the node is a live block, written under the lock.
        unsafe { (*addr.as_ptr()).shm_next = head };
        self.set_info(guard, ShmInfoId::NamedObjects, node)?;
        trace!(%node, "named object added");
        Ok(())
    }

    /// Write a fresh node and link it. On failure both blocks are freed.
    fn install_locked(&self, guard: &ShmLockGuard<'_>, record: NamedObject) -> ShmResult<()> {
        let installed = self.node(record.shm_self).and_then(|addr| {
            // SAFETY: freshly allocated block of at least 16 bytes.
            unsafe { addr.write(record) };
            self.push_locked(guard, record.shm_self)
        });
        if let Err(e) = installed {
            error!(
                node = %record.shm_self,
                error = %e,
                "named object not registered; releasing it"
            );
            self.free(record.shm_object_name)?;
            self.free(record.shm_self)?;
            return Err(e);
        }
        Ok(())
    }

    /// Unlink a node from the directory without freeing it.
    ///
    /// Returns `false` if the node is not in the directory.
    pub fn remove_named_object(&self, node: ShmPtr) -> ShmResult<bool> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        self.remove_locked(&guard, node)
    }

    fn remove_locked(&self, guard: &ShmLockGuard<'_>, target: ShmPtr) -> ShmResult<bool> {
        let mut previous: Option<NonNull<NamedObject>> = None;
        let mut current = self.get_info(guard, ShmInfoId::NamedObjects)?;
        while !current.is_null() {
            let addr = self.node(current)?;
            // SAFETY: live node, read under the lock.
            let node = unsafe { addr.read() };
            if node.shm_self == target {
                match previous {
                    None => self.set_info(guard, ShmInfoId::NamedObjects, node.shm_next)?,
                    // SAFETY: live node, written under the lock.
                    Some(prev) => unsafe { (*prev.as_ptr()).shm_next = node.shm_next },
                }
                trace!(node = %target, "named object removed");
                return Ok(true);
            }
            previous = Some(addr);
            current = node.shm_next;
        }
        warn!(node = %target, "named object not found in directory");
        Ok(false)
    }

    /// Allocate a node named `name` and register it.
    ///
    /// # Errors
    ///
    /// `ShmError::NameInUse` if any object already carries the name.
    pub fn create_named_object(
        &self,
        name: &[u16],
        object_type: NamedObjectType,
    ) -> ShmResult<ShmPtr> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        if self.find_locked(&guard, name, object_type)? != NamedObjectLookup::NotFound {
            return Err(ShmError::NameInUse);
        }

        let node = self.allocate(std::mem::size_of::<NamedObject>())?;
        let name_ptr = match self.wstrdup(name) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.free(node)?;
                return Err(e);
            }
        };
        let record = NamedObject {
            shm_self: node,
            shm_next: ShmPtr::NULL,
            shm_object_name: name_ptr,
            object_type: object_type as u32,
        };
        self.install_locked(&guard, record)?;
        drop(guard);

        debug!(%node, ?object_type, "named object created");
        Ok(node)
    }

    /// Unlink a node and free it together with its name, in one critical
    /// section.
    ///
    /// Returns `false`, freeing nothing, if the node is not in the directory.
    pub fn delete_named_object(&self, node: ShmPtr) -> ShmResult<bool> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        if !self.remove_locked(&guard, node)? {
            return Ok(false);
        }
        let record = self.read_node(node)?;
        self.free(record.shm_object_name)?;
        self.free(node)?;
        drop(guard);

        debug!(%node, "named object deleted");
        Ok(true)
    }

    /// Copy of a node.
    pub fn named_object(&self, node: ShmPtr) -> ShmResult<NamedObject> {
        let _guard = self.lock();
        self.read_node(node)
    }

    /// Name of a node.
    pub fn named_object_name(&self, node: ShmPtr) -> ShmResult<Vec<u16>> {
        let _guard = self.lock();
        let record = self.read_node(node)?;
        self.read_wstr(record.shm_object_name)
    }

    /// Handles of every registered node, head first.
    pub fn named_objects(&self) -> ShmResult<Vec<ShmPtr>> {
        let guard = self.lock();
        self.sync_segments(&guard)?;
        let mut nodes = Vec::new();
        let mut current = self.get_info(&guard, ShmInfoId::NamedObjects)?;
        while !current.is_null() {
            nodes.push(current);
            current = self.read_node(current)?.shm_next;
        }
        Ok(nodes)
    }
}
