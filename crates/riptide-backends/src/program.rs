//! Build options, kernel objects, and the compile cache
//!
//! Kernel source text is the opaque device payload: the runtime injects a
//! standard macro set (`HAVE_2D`/`HAVE_3D`, `DEBUG`/`NDEBUG`, `-D`
//! definitions) and the device resolves the requested entry point.
//! Compiled routines are cached by (source, options, entry point) so
//! repeated compilations are free.

use crate::driver::Routine;
use crate::error::{BackendError, Result};
use crate::types::ArgValue;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Compile options for a kernel build
///
/// Carries the standard injected macros plus tool-specific `-D`
/// definitions (`T=<type>`, `LOCAL_WORK_SIZE=<n>`, `OPERATION=...`,
/// `IDENTITY=...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    three_d: bool,
    debug: bool,
    defines: Vec<(String, String)>,
}

impl BuildOptions {
    /// Options for a 2D or 3D build; `DEBUG` follows the host build profile
    pub fn new(three_d: bool) -> Self {
        Self {
            three_d,
            debug: cfg!(debug_assertions),
            defines: Vec::new(),
        }
    }

    /// Add a `-D key=value` definition
    pub fn define(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((key.into(), value.into()));
        self
    }

    /// Look up a definition
    pub fn get(&self, key: &str) -> Option<&str> {
        self.defines
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the build targets three spatial dimensions (`HAVE_3D`)
    pub fn three_d(&self) -> bool {
        self.three_d
    }

    /// Components of the platform-default vector type (2 in 2D, 4 in 3D)
    pub fn vec_components(&self) -> usize {
        if self.three_d {
            4
        } else {
            2
        }
    }

    /// Canonical flag string, used for cache keying and diagnostics
    pub fn to_flags(&self) -> String {
        let mut flags = String::new();
        flags.push_str(if self.three_d { "-DHAVE_3D" } else { "-DHAVE_2D" });
        flags.push_str(if self.debug { " -DDEBUG" } else { " -DNDEBUG" });
        let mut defines: Vec<_> = self.defines.clone();
        defines.sort();
        for (key, value) in defines {
            flags.push_str(" -D");
            flags.push_str(&key);
            if !value.is_empty() {
                flags.push('=');
                flags.push_str(&value);
            }
        }
        flags
    }
}

/// A cache key for compiled kernels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    /// Hash of the kernel source payload
    pub source: u64,
    /// Canonical compile flags
    pub flags: String,
    /// Entry point name
    pub entry: String,
}

impl ProgramKey {
    /// Build a key from source text, options, and entry point
    pub fn new(source: &str, options: &BuildOptions, entry: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        Self {
            source: hasher.finish(),
            flags: options.to_flags(),
            entry: entry.to_string(),
        }
    }
}

/// Thread-safe compile cache
///
/// The first resolution compiles (resolves) the routine; subsequent
/// lookups return the shared routine with a read lock only.
pub struct ProgramCache {
    cache: OnceLock<RwLock<HashMap<ProgramKey, Routine>>>,
}

impl ProgramCache {
    /// Create a new empty cache
    pub const fn new() -> Self {
        Self { cache: OnceLock::new() }
    }

    /// Get a routine from the cache, or resolve and cache it
    pub fn get_or_resolve<F>(&self, key: &ProgramKey, resolve: F) -> Result<Routine>
    where
        F: FnOnce() -> Result<Routine>,
    {
        let cache = self.cache.get_or_init(|| RwLock::new(HashMap::new()));

        {
            let read_guard = cache.read();
            if let Some(routine) = read_guard.get(key) {
                return Ok(routine.clone());
            }
        }

        let routine = resolve()?;
        let mut write_guard = cache.write();
        Ok(write_guard.entry(key.clone()).or_insert(routine).clone())
    }

    /// Number of cached routines
    pub fn len(&self) -> usize {
        self.cache.get().map(|cache| cache.read().len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A compiled kernel with its per-instance argument slots
///
/// Several kernels can share a cached routine; each instance carries its
/// own bound arguments and compile options.
pub struct Kernel {
    routine: Routine,
    options: BuildOptions,
    args: Vec<Option<ArgValue>>,
    max_work_group_size: usize,
}

impl Kernel {
    pub(crate) fn new(routine: Routine, options: BuildOptions, max_work_group_size: usize) -> Self {
        let slots = routine.params.len();
        Self {
            routine,
            options,
            args: vec![None; slots],
            max_work_group_size,
        }
    }

    /// Entry point name
    pub fn entry(&self) -> &str {
        &self.routine.name
    }

    /// Declared parameter names, in argument order
    pub fn params(&self) -> &[String] {
        &self.routine.params
    }

    /// Largest local work size the device supports for this kernel
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    /// Compile options the kernel was built with
    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub(crate) fn routine(&self) -> &Routine {
        &self.routine
    }

    /// Bind an argument slot
    pub fn set_arg(&mut self, index: usize, value: ArgValue) -> Result<()> {
        let slot = self.args.get_mut(index).ok_or_else(|| {
            BackendError::bad_arg(self.routine.name.clone(), index, "argument index out of range")
        })?;
        *slot = Some(value);
        Ok(())
    }

    /// Snapshot the bound arguments, failing on unset slots
    pub(crate) fn snapshot_args(&self) -> Result<Vec<ArgValue>> {
        self.args
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.clone()
                    .ok_or_else(|| BackendError::bad_arg(self.routine.name.clone(), index, "argument is unset"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Routine;
    use std::sync::Arc;

    fn dummy_routine(name: &str) -> Routine {
        Routine {
            name: name.to_string(),
            params: vec!["a".to_string(), "b".to_string()],
            func: Arc::new(|_, _| Ok(())),
        }
    }

    #[test]
    fn test_build_options_flags() {
        let options = BuildOptions::new(false).define("T", "float").define("LOCAL_WORK_SIZE", "64");
        let flags = options.to_flags();
        assert!(flags.contains("-DHAVE_2D"));
        assert!(flags.contains("-DT=float"));
        assert!(flags.contains("-DLOCAL_WORK_SIZE=64"));
        assert_eq!(options.get("T"), Some("float"));
        assert_eq!(options.vec_components(), 2);
        assert_eq!(BuildOptions::new(true).vec_components(), 4);
    }

    #[test]
    fn test_cache_reuses_routines() {
        let cache = ProgramCache::new();
        let options = BuildOptions::new(false);
        let key = ProgramKey::new("__kernel void k();", &options, "k");

        let first = cache.get_or_resolve(&key, || Ok(dummy_routine("k"))).unwrap();
        let second = cache
            .get_or_resolve(&key, || panic!("resolver must not run twice"))
            .unwrap();
        assert!(Arc::ptr_eq(&first.func, &second.func));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_distinguishes_flags() {
        let cache = ProgramCache::new();
        let source = "__kernel void k();";
        let key_a = ProgramKey::new(source, &BuildOptions::new(false).define("T", "int"), "k");
        let key_b = ProgramKey::new(source, &BuildOptions::new(false).define("T", "float"), "k");

        cache.get_or_resolve(&key_a, || Ok(dummy_routine("k"))).unwrap();
        cache.get_or_resolve(&key_b, || Ok(dummy_routine("k"))).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_kernel_arg_snapshot() {
        let mut kernel = Kernel::new(dummy_routine("k"), BuildOptions::new(false), 256);
        kernel.set_arg(0, ArgValue::scalar(1u32)).unwrap();
        assert!(kernel.snapshot_args().is_err());
        kernel.set_arg(1, ArgValue::scalar(2u32)).unwrap();
        assert_eq!(kernel.snapshot_args().unwrap().len(), 2);
        assert!(kernel.set_arg(5, ArgValue::scalar(0u32)).is_err());
    }
}
