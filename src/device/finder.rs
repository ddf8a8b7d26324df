/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::any::type_name;
use core::cell::{OnceCell, Ref, RefCell, RefMut};
use core::fmt;
use std::rc::Rc;

use super::InterfaceSet;

/// The outcome of resolving a single reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Found,
    MissingDevice,
    /// The device exists but doesn't provide the named capability.
    MissingInterface(&'static str),
}

type ResolveFn = Box<dyn Fn(&InterfaceSet) -> bool>;

/// A reference to resolve before the machine starts.
pub struct FinderEntry {
    path: String,
    required: bool,
    interface: &'static str,
    resolve: ResolveFn,
}

impl FinderEntry {
    /// The path relative to the owning device.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    /// Resolve against the capabilities of the device found at the path, if any.
    pub fn resolve(&self, target: Option<&InterfaceSet>) -> Resolution {
        match target {
            None => Resolution::MissingDevice,
            Some(set) if (self.resolve)(set) => Resolution::Found,
            Some(_) => Resolution::MissingInterface(self.interface)
        }
    }
}

impl fmt::Debug for FinderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinderEntry")
         .field("path", &self.path)
         .field("required", &self.required)
         .field("interface", &self.interface)
         .finish()
    }
}

/// References declared by a device, see [Device::device_finders][super::Device::device_finders].
#[derive(Debug, Default)]
pub struct FinderList {
    entries: Vec<FinderEntry>,
}

impl FinderList {
    pub fn new() -> Self {
        FinderList::default()
    }

    pub fn required<T: ?Sized + 'static>(&mut self, finder: &RequiredDevice<T>) {
        self.entries.push(finder.entry(true));
    }

    pub fn optional<T: ?Sized + 'static>(&mut self, finder: &OptionalDevice<T>) {
        self.entries.push(finder.0.entry(false));
    }

    pub fn entries(&self) -> &[FinderEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<FinderEntry> {
        self.entries
    }
}

/// A reference to a capability of another device which must exist.
///
/// The path follows the device tag rules (see [subtag][super::subtag]) relative to the owner.
/// Cloning produces another handle to the same reference.
pub struct RequiredDevice<T: ?Sized> {
    path: Rc<str>,
    cell: Rc<OnceCell<Rc<RefCell<T>>>>,
}

/// A reference to a capability of another device which may be absent.
pub struct OptionalDevice<T: ?Sized>(RequiredDevice<T>);

impl<T: ?Sized> Clone for RequiredDevice<T> {
    fn clone(&self) -> Self {
        RequiredDevice { path: Rc::clone(&self.path), cell: Rc::clone(&self.cell) }
    }
}

impl<T: ?Sized> Clone for OptionalDevice<T> {
    fn clone(&self) -> Self {
        OptionalDevice(self.0.clone())
    }
}

impl<T: ?Sized + 'static> RequiredDevice<T> {
    pub fn new(path: &str) -> Self {
        RequiredDevice { path: path.into(), cell: Rc::new(OnceCell::new()) }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The resolved target.
    ///
    /// # Panics
    /// Panics if called before the machine resolved its references.
    pub fn target(&self) -> &Rc<RefCell<T>> {
        match self.cell.get() {
            Some(target) => target,
            None => panic!("required device `{}` accessed before resolution", self.path)
        }
    }

    /// # Panics
    /// Panics if unresolved or already mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.target().borrow()
    }

    /// # Panics
    /// Panics if unresolved or already borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.target().borrow_mut()
    }

    fn entry(&self, required: bool) -> FinderEntry {
        let cell = Rc::clone(&self.cell);
        let resolve: ResolveFn = Box::new(move |set: &InterfaceSet| {
            match set.get::<T>() {
                Some(target) => {
                    let _ = cell.set(target);
                    true
                }
                None => false
            }
        });
        FinderEntry { path: self.path.to_string(), required, interface: type_name::<T>(), resolve }
    }
}

impl<T: ?Sized + 'static> OptionalDevice<T> {
    pub fn new(path: &str) -> Self {
        OptionalDevice(RequiredDevice::new(path))
    }

    pub fn path(&self) -> &str {
        self.0.path()
    }

    /// The target, if it was found.
    pub fn get(&self) -> Option<&Rc<RefCell<T>>> {
        self.0.cell.get()
    }

    pub fn is_found(&self) -> bool {
        self.0.is_resolved()
    }
}

impl<T: ?Sized> fmt::Debug for RequiredDevice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequiredDevice({:?}, resolved: {})", self.path, self.cell.get().is_some())
    }
}

impl<T: ?Sized> fmt::Debug for OptionalDevice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionalDevice({:?}, found: {})", self.0.path, self.0.cell.get().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Port {
        fn read(&self) -> u8;
    }

    struct Latch(u8);

    impl Port for Latch {
        fn read(&self) -> u8 {
            self.0
        }
    }

    #[test]
    fn finder_resolution() {
        let req: RequiredDevice<dyn Port> = RequiredDevice::new("^latch");
        let opt: OptionalDevice<Latch> = OptionalDevice::new("missing");
        let mut list = FinderList::new();
        list.required(&req);
        list.optional(&opt);
        let entries = list.into_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_required());
        assert!(!entries[1].is_required());
        assert_eq!(entries[0].path(), "^latch");

        let mut set = InterfaceSet::new();
        let latch = Rc::new(RefCell::new(Latch(0x5a)));
        set.add::<dyn Port>(latch);
        assert!(!req.is_resolved());
        assert_eq!(entries[0].resolve(Some(&set)), Resolution::Found);
        assert_eq!(req.borrow().read(), 0x5a);
        assert!(matches!(entries[1].resolve(Some(&set)), Resolution::MissingInterface(name) if name.ends_with("Latch")));
        assert_eq!(entries[1].resolve(None), Resolution::MissingDevice);
        assert!(opt.get().is_none());
        assert!(!opt.is_found());
    }

    #[test]
    #[should_panic(expected = "accessed before resolution")]
    fn finder_unresolved_panics() {
        let req: RequiredDevice<Latch> = RequiredDevice::new("latch");
        req.borrow();
    }
}
