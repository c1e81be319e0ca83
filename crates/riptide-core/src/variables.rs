//! Variable registry
//!
//! A process-wide mapping from variable name to a typed cell. Variables
//! are either **scalar** (value stored inline) or **array** (typed device
//! buffer with a known element count). Every variable carries a *writing
//! event* (most recent mutation, to be waited upon) and a set of *reading
//! events*:
//!
//! - a reader waits on the writing event and registers itself as a
//!   reading event;
//! - a writer waits on the writing event **and** all reading events, then
//!   replaces the writing event and clears the readers.
//!
//! Arrays flagged *reallocatable* may have their device buffer swapped at
//! runtime; downstream tools observe swaps because they resolve buffer
//! handles through the registry at launch time.

use crate::error::{Error, Result};
use crate::expr::{identifiers, ExprContext};
use crate::scalar::{ScalarValue, VarType};
use parking_lot::{Mutex, RwLock};
use riptide_backends::{ArgValue, BackendError, BufferHandle, Context, Device, Event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum VarState {
    Scalar(ScalarValue),
    Array { buffer: BufferHandle, len: usize },
}

#[derive(Default)]
struct EventSet {
    writing: Option<Event>,
    readers: Vec<Event>,
}

/// A registered variable
pub struct Variable {
    name: String,
    ty: VarType,
    state: Mutex<VarState>,
    events: Mutex<EventSet>,
    reallocatable: AtomicBool,
}

impl Variable {
    fn new_scalar(name: &str, ty: VarType, value: ScalarValue) -> Self {
        Self {
            name: name.to_string(),
            ty,
            state: Mutex::new(VarState::Scalar(value)),
            events: Mutex::new(EventSet::default()),
            reallocatable: AtomicBool::new(false),
        }
    }

    fn new_array(name: &str, ty: VarType, buffer: BufferHandle, len: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            state: Mutex::new(VarState::Array { buffer, len }),
            events: Mutex::new(EventSet::default()),
            reallocatable: AtomicBool::new(false),
        }
    }

    /// Variable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved type
    pub fn var_type(&self) -> VarType {
        self.ty
    }

    /// Whether this is an array variable
    pub fn is_array(&self) -> bool {
        self.ty.is_array
    }

    /// Per-element footprint in bytes
    pub fn type_size(&self) -> usize {
        self.ty.bytes()
    }

    /// Current scalar value
    pub fn scalar(&self) -> Result<ScalarValue> {
        match &*self.state.lock() {
            VarState::Scalar(value) => Ok(*value),
            VarState::Array { .. } => Err(Error::bad_var_type(&self.name, "scalar", self.ty)),
        }
    }

    /// Store a scalar value (the asynchronous setter callbacks use)
    pub fn set_scalar(&self, value: ScalarValue) -> Result<()> {
        match &mut *self.state.lock() {
            VarState::Scalar(slot) => {
                *slot = value;
                Ok(())
            }
            VarState::Array { .. } => Err(Error::bad_var_type(&self.name, "scalar", self.ty)),
        }
    }

    /// Device buffer behind an array variable
    pub fn buffer(&self) -> Result<BufferHandle> {
        match &*self.state.lock() {
            VarState::Array { buffer, .. } => Ok(*buffer),
            VarState::Scalar(_) => Err(Error::bad_var_type(&self.name, "array", self.ty)),
        }
    }

    /// Element count of an array variable
    pub fn len(&self) -> Result<usize> {
        match &*self.state.lock() {
            VarState::Array { len, .. } => Ok(*len),
            VarState::Scalar(_) => Err(Error::bad_var_type(&self.name, "array", self.ty)),
        }
    }

    /// Whether an array variable holds no elements
    pub fn is_empty(&self) -> bool {
        self.len().map(|len| len == 0).unwrap_or(false)
    }

    /// Total byte size of an array variable
    pub fn size_bytes(&self) -> Result<usize> {
        Ok(self.len()? * self.ty.bytes())
    }

    /// Mark the array as reallocatable
    pub fn set_reallocatable(&self, value: bool) {
        self.reallocatable.store(value, Ordering::Release);
    }

    /// Whether the buffer may be swapped at runtime
    pub fn reallocatable(&self) -> bool {
        self.reallocatable.load(Ordering::Acquire)
    }

    /// Swap the device buffer of a reallocatable array
    pub fn set_buffer(&self, buffer: BufferHandle, len: usize) -> Result<()> {
        if !self.reallocatable() {
            return Err(Error::bad_var_type(&self.name, "reallocatable array", self.ty));
        }
        match &mut *self.state.lock() {
            VarState::Array {
                buffer: slot,
                len: len_slot,
            } => {
                *slot = buffer;
                *len_slot = len;
                Ok(())
            }
            VarState::Scalar(_) => Err(Error::bad_var_type(&self.name, "array", self.ty)),
        }
    }

    /// The value kernels bind for this variable: the buffer handle for
    /// arrays, the inline bytes for scalars
    pub fn arg_value(&self) -> Result<ArgValue> {
        match &*self.state.lock() {
            VarState::Array { buffer, .. } => Ok(ArgValue::Buffer(*buffer)),
            VarState::Scalar(value) => Ok(ArgValue::Bytes(value.to_bytes())),
        }
    }

    /// Most recent mutation event
    pub fn writing_event(&self) -> Option<Event> {
        self.events.lock().writing.clone()
    }

    /// Replace the writing event and clear the reader set
    ///
    /// The caller must have waited on the previous writing event and on
    /// the outstanding readers (the tool driver's wait-list gather).
    pub fn set_writing_event(&self, event: Event) {
        let mut events = self.events.lock();
        events.writing = Some(event);
        events.readers.clear();
    }

    /// Register a reader of the current contents
    pub fn add_reading_event(&self, event: Event) {
        let mut events = self.events.lock();
        if !events.readers.iter().any(|reader| reader.same(&event)) {
            events.readers.push(event);
        }
    }

    /// Outstanding reading events
    pub fn reading_events(&self) -> Vec<Event> {
        self.events.lock().readers.clone()
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("type", &self.ty.designator())
            .finish()
    }
}

/// Process-wide variable registry
pub struct Variables {
    ctx: Arc<Context>,
    map: RwLock<HashMap<String, Arc<Variable>>>,
    expr: RwLock<ExprContext>,
}

impl Variables {
    /// Fresh registry over an accelerator context
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            map: RwLock::new(HashMap::new()),
            expr: RwLock::new(ExprContext::new()),
        })
    }

    /// Spatial dimensionality of the context (2 or 3)
    pub fn dims(&self) -> usize {
        self.ctx.dims()
    }

    /// Per-element footprint of a type designator, in bytes
    pub fn type_to_bytes(&self, designator: &str) -> Result<usize> {
        crate::scalar::type_to_bytes(designator, self.dims())
    }

    /// Component count of a type designator
    pub fn type_to_components(&self, designator: &str) -> Result<usize> {
        crate::scalar::type_to_components(designator, self.dims())
    }

    /// Register a variable
    ///
    /// `length` is an expression over previously registered scalars for
    /// arrays (ignored for scalars); `value` is the initial-value
    /// expression for scalars (empty means zero).
    #[tracing::instrument(skip(self))]
    pub fn register(&self, name: &str, type_str: &str, length: &str, value: &str) -> Result<Arc<Variable>> {
        if self.map.read().contains_key(name) {
            return Err(Error::DuplicateVariable(name.to_string()));
        }
        let ty = VarType::parse(type_str, self.dims())?;

        let variable = if ty.is_array {
            let len = self.evaluate(length)? as usize;
            let bytes = len * ty.bytes();
            let buffer = self.ctx.device().allocate_buffer(bytes).map_err(map_oom)?;
            tracing::debug!(name, len, bytes, "array variable registered");
            Arc::new(Variable::new_array(name, ty, buffer, len))
        } else {
            let initial = if value.trim().is_empty() {
                ScalarValue::zero(ty)
            } else {
                ScalarValue::from_f64(ty, self.evaluate(value)?)
            };
            tracing::debug!(name, value = %initial, "scalar variable registered");
            Arc::new(Variable::new_scalar(name, ty, initial))
        };

        self.map.write().insert(name.to_string(), variable.clone());
        if !ty.is_array {
            self.populate(&variable)?;
        }
        Ok(variable)
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<Arc<Variable>> {
        self.map.read().get(name).cloned()
    }

    /// Look up a variable, failing with `InvalidVariable`
    pub fn require(&self, name: &str) -> Result<Arc<Variable>> {
        self.get(name).ok_or_else(|| Error::InvalidVariable(name.to_string()))
    }

    /// Push a scalar's current value into the evaluator context
    ///
    /// Must be called when a scalar result becomes available (typically
    /// from a completion callback): the evaluator snapshots values at
    /// call time. Vector components are exposed as `name_x`, `name_y`,
    /// `name_z`, `name_w`.
    pub fn populate(&self, variable: &Variable) -> Result<()> {
        let value = variable.scalar()?;
        let mut expr = self.expr.write();
        if value.components() == 1 {
            expr.set(variable.name(), value.component(0))?;
        } else {
            for (index, suffix) in ["x", "y", "z", "w"].iter().take(value.components()).enumerate() {
                expr.set(&format!("{}_{suffix}", variable.name()), value.component(index))?;
            }
        }
        Ok(())
    }

    /// Evaluate a numeric expression over the registered scalars
    pub fn evaluate(&self, expr: &str) -> Result<f64> {
        if expr.trim().is_empty() {
            return Err(Error::bad_expression(expr, "empty expression"));
        }
        self.expr.read().eval(expr)
    }

    /// Evaluate an expression and coerce into a typed scalar slot
    pub fn evaluate_as(&self, expr: &str, ty: VarType) -> Result<ScalarValue> {
        Ok(ScalarValue::from_f64(ty, self.evaluate(expr)?))
    }

    /// Registered variables an expression reads
    ///
    /// Component accessors (`name_x`) resolve to their vector variable.
    pub fn dependencies_of(&self, expr: &str) -> Vec<Arc<Variable>> {
        let map = self.map.read();
        let mut deps: Vec<Arc<Variable>> = Vec::new();
        for ident in identifiers(expr) {
            let hit = map.get(&ident).or_else(|| {
                ident
                    .rsplit_once('_')
                    .filter(|(_, suffix)| matches!(*suffix, "x" | "y" | "z" | "w"))
                    .and_then(|(base, _)| map.get(base))
            });
            if let Some(variable) = hit {
                if !deps.iter().any(|dep| Arc::ptr_eq(dep, variable)) {
                    deps.push(variable.clone());
                }
            }
        }
        deps
    }

    /// Every event currently attached to a variable (writing + readers)
    ///
    /// Teardown waits on these: completion callbacks may still be
    /// queueing device work gated on user events, which a plain queue
    /// drain would miss.
    pub fn pending_events(&self) -> Vec<Event> {
        let map = self.map.read();
        let mut events = Vec::new();
        for variable in map.values() {
            events.extend(variable.writing_event());
            events.extend(variable.reading_events());
        }
        events
    }

    /// The accelerator context the registry allocates against
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

fn map_oom(err: BackendError) -> Error {
    match err {
        BackendError::OutOfMemory { requested } => Error::OutOfMemory { requested },
        other => Error::Accelerator(other),
    }
}
