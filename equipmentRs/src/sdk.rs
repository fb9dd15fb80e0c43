//! This module loads the shared library that a manufacturer provides to control its equipment.
//!
//! An `SDK::<path>` connection is not message-based. The library stays loaded for as long as the
//! connection is open, a driver looks up the functions it needs with [`SdkLibrary::symbol`].

use std::fmt;

use libloading::{Library, Symbol};

use crate::{Address, AddressFields, EquipmentError};

/// A loaded vendor library.
pub struct SdkLibrary {
    path: String,
    library: Library,
}

impl SdkLibrary {
    /// Load the library of an `SDK` address.
    pub fn open(address: &Address) -> Result<Self, EquipmentError> {
        let AddressFields::Sdk { path } = address.fields() else {
            return Err(EquipmentError::connection(address, "not an SDK address"));
        };
        Self::load(path).map_err(|e| EquipmentError::connection(address, e))
    }

    /// Load a library from a path, or a file name that the platform loader can find.
    pub fn load(path: &str) -> Result<Self, EquipmentError> {
        // SAFETY: loading the library runs its initialisers, the caller chose to trust the vendor
        // library by connecting to it.
        let library = unsafe { Library::new(path)? };
        log::debug!("Loaded SDK library {path}");
        Ok(SdkLibrary {
            path: path.to_string(),
            library,
        })
    }

    /// The path that the library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a function or variable of the library by name.
    ///
    /// # Safety
    ///
    /// `T` must match the type of the symbol, e.g., the exact `extern "C" fn` signature of a
    /// function. The returned symbol cannot outlive the library.
    pub unsafe fn symbol<T>(&self, name: &str) -> Result<Symbol<'_, T>, EquipmentError> {
        // SAFETY: upheld by the caller.
        Ok(unsafe { self.library.get::<T>(name.as_bytes())? })
    }

    /// Whether the library exports a symbol with this name.
    pub fn has_symbol(&self, name: &str) -> bool {
        // SAFETY: the symbol is only looked up as an opaque pointer and never used.
        unsafe { self.library.get::<*const ()>(name.as_bytes()).is_ok() }
    }

    /// The underlying library.
    pub fn library(&self) -> &Library {
        &self.library
    }
}

impl fmt::Debug for SdkLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkLibrary").field("path", &self.path).finish()
    }
}

impl Drop for SdkLibrary {
    fn drop(&mut self) {
        log::debug!("Unloading SDK library {}", self.path);
    }
}
