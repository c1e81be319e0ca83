//! Concrete tools of the calculation server

pub mod kernel;
pub mod link_list;
pub mod radix_sort;
pub mod reduction;
pub mod report;
pub mod scalar;
pub mod set;
pub mod sync;
pub mod unsort;

pub use kernel::KernelTool;
pub use link_list::LinkList;
pub use radix_sort::RadixSort;
pub use reduction::Reduction;
pub use report::Report;
pub use scalar::ScalarExpression;
pub use set::Set;
pub use sync::MpiSync;
pub use unsort::UnSort;

use crate::error::Result;
use crate::variables::Variable;
use riptide_backends::{ArgValue, Kernel};

/// Per-slot shadow copies of the last-bound kernel arguments
///
/// `set_arg` calls are expensive on a real device; an argument is re-set
/// only when its bytes (or buffer handle) differ from the shadow copy.
/// Shadow caches belong to the owning tool and are touched only by the
/// pipeline thread.
pub(crate) struct ShadowArgs {
    shadow: Vec<Option<ArgValue>>,
}

impl ShadowArgs {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            shadow: vec![None; slots],
        }
    }

    /// Bind a value into a slot unless it matches the shadow copy
    pub(crate) fn bind(&mut self, kernel: &mut Kernel, index: usize, value: ArgValue) -> Result<()> {
        if self.shadow.get(index).and_then(|slot| slot.as_ref()) == Some(&value) {
            return Ok(());
        }
        kernel.set_arg(index, value.clone())?;
        self.shadow[index] = Some(value);
        Ok(())
    }

    /// Bind a variable's current value (buffer handle or scalar bytes)
    ///
    /// Resolving through the registry at bind time is what makes buffer
    /// reallocations visible to every later launch.
    pub(crate) fn bind_var(&mut self, kernel: &mut Kernel, index: usize, variable: &Variable) -> Result<()> {
        self.bind(kernel, index, variable.arg_value()?)
    }
}
