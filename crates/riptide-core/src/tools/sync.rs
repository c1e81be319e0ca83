//! Multi-process particle exchange
//!
//! Given an ownership **mask** (one process id per particle) and a set of
//! field arrays, exchange the slices owned by remote processes with those
//! processes. The mask is radix-sorted in place so every peer's slice is
//! contiguous; per-field unsorters materialize mask-sorted copies for the
//! senders; receivers upload incoming payloads at a running offset and
//! keep the ownership mask consistent.
//!
//! All host work (message passing, downloads, uploads) runs in completion
//! callbacks bridged back into the device event graph through user
//! events; receivers for successive peers serialize on the offset chain.

use crate::comm::{wire_type, Communicator, COUNT_TAG};
use crate::error::{Error, Result};
use crate::scalar::{ScalarValue, VarType};
use crate::server::CalcServer;
use crate::tool::{self, Tool, ToolMeta};
use crate::tools::{RadixSort, Reduction, ScalarExpression, Set, UnSort};
use crate::variables::Variable;
use parking_lot::Mutex;
use riptide_backends::{ArgValue, Event, EventStatus, Kernel, NdRange, STATUS_EXEC_ERROR};
use std::sync::Arc;

const MPISYNC_SRC: &str = r#"
__kernel void n_offset_mask(__global const unsigned int* mask,
                            __global unsigned int* submask,
                            unsigned int proc, unsigned int n);
__kernel void n_send_mask(__global const unsigned int* mask,
                          __global unsigned int* submask,
                          unsigned int proc, unsigned int n);
__kernel void set_mask(__global unsigned int* mask, unsigned int proc,
                       unsigned int offset, unsigned int n);
"#;

/// Mirror a device event's terminal status onto a user event
fn sync_user_event(user: &Event, device: &Event) {
    let user = user.clone();
    device.on_complete(move |status| user.finish_as(status));
}

fn decode_count(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(Error::Communication(format!(
            "count message holds {} bytes, 4 expected",
            bytes.len()
        )));
    }
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Register a helper variable under an unoccupied derived name
fn register_unique(server: &Arc<CalcServer>, stem: &str, type_str: &str, length: &str) -> Result<Arc<Variable>> {
    let vars = server.variables();
    let mut index = 0usize;
    loop {
        let name = format!("{stem}_{index}");
        if vars.get(&name).is_none() {
            return vars.register(&name, type_str, length, if type_str.ends_with('*') { "" } else { "0" });
        }
        index += 1;
    }
}

struct Sender {
    proc: u32,
    mask: Arc<Variable>,
    submask_offset: Arc<Variable>,
    submask_count: Arc<Variable>,
    offset: Arc<Variable>,
    count: Arc<Variable>,
    offset_kernel: Kernel,
    count_kernel: Kernel,
    offset_reduction: Reduction,
    count_reduction: Reduction,
    fields: Vec<Arc<Variable>>,
    range: NdRange,
}

impl Sender {
    fn setup(
        server: &Arc<CalcServer>,
        mask: &Arc<Variable>,
        fields_sorted: &[Arc<Variable>],
        proc: u32,
    ) -> Result<Self> {
        let ctx = server.context();
        let n = mask.len()?;
        let length = n.to_string();

        let submask_offset = register_unique(server, &format!("__{}_n_offset_mask", mask.name()), "unsigned int*", &length)?;
        let submask_count = register_unique(server, &format!("__{}_n_send_mask", mask.name()), "unsigned int*", &length)?;
        let offset = register_unique(server, "__n_offset", "unsigned int", "")?;
        let count = register_unique(server, "__n_send", "unsigned int", "")?;

        let compile = |entry: &str, submask: &Arc<Variable>| -> Result<Kernel> {
            let mut kernel = ctx.compile_kernel(MPISYNC_SRC, entry, ctx.build_options())?;
            kernel.set_arg(0, mask.arg_value()?)?;
            kernel.set_arg(1, submask.arg_value()?)?;
            kernel.set_arg(2, ArgValue::scalar(proc))?;
            kernel.set_arg(3, ArgValue::scalar(n as u32))?;
            Ok(kernel)
        };
        let offset_kernel = compile("n_offset_mask", &submask_offset)?;
        let count_kernel = compile("n_send_mask", &submask_count)?;
        let range = NdRange::new(n.max(1), offset_kernel.max_work_group_size())?;

        let mut offset_reduction = Reduction::new(
            &format!("{}->Sum", offset.name()),
            submask_offset.name(),
            offset.name(),
            "c = a + b;",
            "0",
        );
        offset_reduction.setup(server)?;
        let mut count_reduction = Reduction::new(
            &format!("{}->Sum", count.name()),
            submask_count.name(),
            count.name(),
            "c = a + b;",
            "0",
        );
        count_reduction.setup(server)?;

        Ok(Self {
            proc,
            mask: mask.clone(),
            submask_offset,
            submask_count,
            offset,
            count,
            offset_kernel,
            count_kernel,
            offset_reduction,
            count_reduction,
            fields: fields_sorted.to_vec(),
            range,
        })
    }

    fn submask_pass(
        &self,
        server: &Arc<CalcServer>,
        kernel: &Kernel,
        submask: &Arc<Variable>,
    ) -> Result<()> {
        let mut wait: Vec<Event> = [self.mask.writing_event(), submask.writing_event()]
            .into_iter()
            .flatten()
            .collect();
        wait.extend(submask.reading_events());
        riptide_backends::dedup_events(&mut wait);

        let event = server.context().queue().enqueue_kernel(kernel, self.range, &wait)?;
        self.mask.add_reading_event(event.clone());
        submask.set_writing_event(event);
        Ok(())
    }

    fn execute(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        // Offset of the first particle owned by the peer, then the count
        // of owned particles, each a submask pass plus a sum reduction.
        self.submask_pass(server, &self.offset_kernel, &self.submask_offset)?;
        tool::execute(&mut self.offset_reduction, server)?;
        self.submask_pass(server, &self.count_kernel, &self.submask_count)?;
        tool::execute(&mut self.count_reduction, server)?;

        let comm = server.communicator()?;
        let queue = server.context().queue();
        for (index, field) in self.fields.iter().enumerate() {
            let mut wait: Vec<Event> = [
                self.offset.writing_event(),
                self.count.writing_event(),
                field.writing_event(),
            ]
            .into_iter()
            .flatten()
            .collect();
            riptide_backends::dedup_events(&mut wait);
            let trigger = queue.marker(&wait)?;

            // The download in the callback reads these cells after the
            // trigger fires; the guard keeps later writers out until the
            // callback is done with them.
            let guard = Event::user();
            self.offset.add_reading_event(guard.clone());
            self.count.add_reading_event(guard.clone());
            field.add_reading_event(guard.clone());

            let server = server.clone();
            let comm = comm.clone();
            let field = field.clone();
            let offset_var = self.offset.clone();
            let count_var = self.count.clone();
            let proc = self.proc;
            let first_field = index == 0;
            let tag = (index + 1) as u32;

            trigger.on_complete(move |status| {
                if let EventStatus::Error(code) = status {
                    guard.fail(code);
                    return;
                }
                let send = || -> Result<()> {
                    let offset = offset_var.scalar()?.as_u32().unwrap_or(0) as usize;
                    let count = count_var.scalar()?.as_u32().unwrap_or(0) as usize;
                    if first_field {
                        comm.send(proc, COUNT_TAG, (count as u32).to_ne_bytes().to_vec())?;
                    }
                    if count == 0 {
                        return Ok(());
                    }
                    let tsize = field.type_size();
                    let (bytes, _read) = server.context().callback_queue().read_blocking(
                        field.buffer()?,
                        offset * tsize,
                        count * tsize,
                        &[],
                    )?;
                    comm.send(proc, tag, bytes)
                };
                match send() {
                    Ok(()) => guard.complete(),
                    Err(err) => {
                        server.latch_fatal(err);
                        guard.fail(STATUS_EXEC_ERROR);
                    }
                }
            });
        }
        Ok(())
    }
}

struct Receiver {
    proc: u32,
    mask: Arc<Variable>,
    fields: Vec<Arc<Variable>>,
    offset: Arc<Variable>,
    kernel: Arc<Mutex<Kernel>>,
    local: usize,
}

impl Receiver {
    fn setup(
        server: &Arc<CalcServer>,
        mask: &Arc<Variable>,
        fields: &[Arc<Variable>],
        offset: &Arc<Variable>,
        proc: u32,
    ) -> Result<Self> {
        let ctx = server.context();
        let kernel = ctx.compile_kernel(MPISYNC_SRC, "set_mask", ctx.build_options())?;
        let local = kernel.max_work_group_size();
        Ok(Self {
            proc,
            mask: mask.clone(),
            fields: fields.to_vec(),
            offset: offset.clone(),
            kernel: Arc::new(Mutex::new(kernel)),
            local,
        })
    }

    fn execute(&self, server: &Arc<CalcServer>) -> Result<()> {
        let mut wait: Vec<Event> = std::iter::once(&self.offset)
            .chain(std::iter::once(&self.mask))
            .chain(self.fields.iter())
            .filter_map(|variable| variable.writing_event())
            .collect();
        riptide_backends::dedup_events(&mut wait);
        let trigger = server.context().queue().marker(&wait)?;

        // Lock the offset (serializing later receivers), the mask, and
        // every field until the callback has landed the incoming data.
        let offset_event = Event::user();
        self.offset.set_writing_event(offset_event.clone());
        let mask_event = Event::user();
        self.mask.set_writing_event(mask_event.clone());
        let field_events: Vec<Event> = self
            .fields
            .iter()
            .map(|field| {
                let event = Event::user();
                field.set_writing_event(event.clone());
                event
            })
            .collect();

        let server = server.clone();
        let comm = server.communicator()?;
        let rank = comm.rank();
        let proc = self.proc;
        let mask = self.mask.clone();
        let fields = self.fields.clone();
        let offset_var = self.offset.clone();
        let kernel = self.kernel.clone();
        let local = self.local;

        trigger.on_complete(move |status| {
            let fail_all = |code: i32| {
                offset_event.fail(code);
                mask_event.fail(code);
                for event in &field_events {
                    event.fail(code);
                }
            };
            if let EventStatus::Error(code) = status {
                fail_all(code);
                return;
            }

            let receive = || -> Result<()> {
                let vars = server.variables();
                let count = decode_count(&comm.recv(proc, COUNT_TAG)?)?;

                // Advance the running offset and unblock the next receiver.
                let offset = offset_var.scalar()?.as_u32().unwrap_or(0);
                offset_var.set_scalar(ScalarValue::Uint(offset + count))?;
                vars.populate(&offset_var)?;
                offset_event.complete();

                if count == 0 {
                    mask_event.complete();
                    for event in &field_events {
                        event.complete();
                    }
                    return Ok(());
                }

                // The incoming particles are owned locally now; stamp the
                // slice so the ownership mask stays consistent.
                {
                    let mut kernel = kernel.lock();
                    kernel.set_arg(0, mask.arg_value()?)?;
                    kernel.set_arg(1, ArgValue::scalar(rank))?;
                    kernel.set_arg(2, ArgValue::scalar(offset))?;
                    kernel.set_arg(3, ArgValue::scalar(count))?;
                    let range = NdRange::new(count as usize, local)?;
                    let stamp = server.context().callback_queue().enqueue_kernel(&kernel, range, &[])?;
                    sync_user_event(&mask_event, &stamp);
                }

                for (index, (field, event)) in fields.iter().zip(&field_events).enumerate() {
                    let payload = comm.recv(proc, (index + 1) as u32)?;
                    let tsize = field.type_size();
                    if payload.len() != count as usize * tsize {
                        return Err(Error::Communication(format!(
                            "field \"{}\" payload holds {} bytes, {} expected",
                            field.name(),
                            payload.len(),
                            count as usize * tsize
                        )));
                    }
                    let upload = server.context().callback_queue().enqueue_write(
                        field.buffer()?,
                        offset as usize * tsize,
                        payload,
                        &[],
                    )?;
                    sync_user_event(event, &upload);
                }
                Ok(())
            };

            if let Err(err) = receive() {
                server.latch_fatal(err);
                fail_all(STATUS_EXEC_ERROR);
            }
        });
        Ok(())
    }
}

/// Exchange remotely owned particle slices with their owners
pub struct MpiSync {
    meta: ToolMeta,
    mask_name: String,
    field_names: Vec<String>,
    proc_filter: Vec<u32>,
    procs: Vec<u32>,
    sort: Option<RadixSort>,
    field_sorters: Vec<UnSort>,
    offset_reinit: Option<ScalarExpression>,
    mask_reinit: Option<Set>,
    senders: Vec<Sender>,
    receivers: Vec<Receiver>,
}

impl MpiSync {
    /// Exchange `fields` according to `mask`; `procs` restricts the peer
    /// set (empty means every other rank)
    pub fn new(name: &str, mask: &str, fields: &[&str], procs: &[u32], once: bool) -> Self {
        Self {
            meta: ToolMeta::new(name, once),
            mask_name: mask.to_string(),
            field_names: fields.iter().map(|f| f.to_string()).collect(),
            proc_filter: procs.to_vec(),
            procs: Vec::new(),
            sort: None,
            field_sorters: Vec::new(),
            offset_reinit: None,
            mask_reinit: None,
            senders: Vec::new(),
            receivers: Vec::new(),
        }
    }
}

impl Tool for MpiSync {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let vars = server.variables();
        let comm = server.communicator()?;
        let (rank, size) = (comm.rank(), comm.size());

        self.procs = if self.proc_filter.is_empty() {
            (0..size).collect()
        } else {
            self.proc_filter.clone()
        };
        self.procs.retain(|proc| *proc != rank && *proc < size);

        // The mask carries one process id per particle.
        let mask = vars.require(&self.mask_name)?;
        if mask.var_type() != VarType::parse("unsigned int*", vars.dims())? {
            return Err(Error::bad_var_type(&self.mask_name, "unsigned int*", mask.var_type()));
        }
        let n = mask.len()?;

        if self.field_names.is_empty() {
            return Err(Error::Communication(format!(
                "tool \"{}\" has no fields to exchange",
                self.meta.name()
            )));
        }
        let mut fields = Vec::with_capacity(self.field_names.len());
        for name in &self.field_names {
            let field = vars.require(name)?;
            if !field.is_array() {
                return Err(Error::bad_var_type(name, "array", field.var_type()));
            }
            wire_type(field.var_type())?;
            if field.len()? != n {
                return Err(Error::InvalidVariableLength {
                    name: name.clone(),
                    expected: n,
                    found: field.len()?,
                });
            }
            fields.push(field);
        }

        // Mask sorting subtool: the mask is sorted in place and the
        // permutations drive the per-field gathers.
        let perm_name = format!("__{}_unsorted", self.mask_name);
        let inv_name = format!("__{}_sorted", self.mask_name);
        let mut sort = RadixSort::new(
            &format!("__{}->Radix-Sort", self.mask_name),
            &self.mask_name,
            &perm_name,
            &inv_name,
        );
        sort.setup(server)?;
        self.sort = Some(sort);

        let mut fields_sorted = Vec::with_capacity(fields.len());
        for field in &fields {
            let sorted_name = format!("__{}_sorted", field.name());
            vars.register(&sorted_name, &field.var_type().designator(), &n.to_string(), "")?;
            let mut sorter = UnSort::new(&format!("__{}->Sort", field.name()), field.name(), &perm_name, &sorted_name);
            sorter.setup(server)?;
            self.field_sorters.push(sorter);
            fields_sorted.push(vars.require(&sorted_name)?);
        }

        // Receivers share one running offset, reset each iteration.
        let offset = match vars.get("__mpi_offset") {
            Some(variable) => variable,
            None => vars.register("__mpi_offset", "unsigned int", "", "0")?,
        };
        let mut offset_reinit = ScalarExpression::set_scalar("__mpi_offset->reset", "__mpi_offset", "0", false);
        offset_reinit.setup(server)?;
        self.offset_reinit = Some(offset_reinit);

        let mut mask_reinit = Set::new(
            &format!("__{}->reset", self.mask_name),
            &self.mask_name,
            &rank.to_string(),
            false,
        );
        mask_reinit.setup(server)?;
        self.mask_reinit = Some(mask_reinit);

        for proc in &self.procs {
            self.senders.push(Sender::setup(server, &mask, &fields_sorted, *proc)?);
            self.receivers.push(Receiver::setup(server, &mask, &fields, &offset, *proc)?);
        }

        let mut outputs = fields;
        outputs.push(mask);
        self.meta.set_dependencies(Vec::new(), outputs);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, _wait: &[Event]) -> Result<Option<Event>> {
        if self.procs.is_empty() {
            return Ok(None);
        }

        // Arrange the mask (and the field copies) in owner order.
        if let Some(sort) = self.sort.as_mut() {
            tool::execute(sort, server)?;
        }
        for sorter in &mut self.field_sorters {
            tool::execute(sorter, server)?;
        }

        for sender in &mut self.senders {
            sender.execute(server)?;
        }

        // Receivers: reset the running offset and the ownership mask,
        // then chain one receiver per peer.
        if let Some(reinit) = self.offset_reinit.as_mut() {
            tool::execute(reinit, server)?;
        }
        if let Some(reinit) = self.mask_reinit.as_mut() {
            tool::execute(reinit, server)?;
        }
        for receiver in &self.receivers {
            receiver.execute(server)?;
        }

        // Sub-steps maintained the event graph themselves.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use riptide_backends::Context;

    #[test]
    fn test_single_process_sync_is_a_no_op() {
        let comm = LocalCluster::communicators(1).remove(0);
        let (ctx, _device) = Context::with_cpu_device(false);
        let server = CalcServer::from_parts(ctx, Some(Arc::new(comm)));

        let vars = server.variables();
        vars.register("N", "unsigned int", "", "4").unwrap();
        vars.register("mask", "unsigned int*", "N", "").unwrap();
        vars.register("f", "float*", "N", "").unwrap();

        let mut sync = MpiSync::new("sync", "mask", &["f"], &[], false);
        sync.setup(&server).unwrap();
        assert!(sync.procs.is_empty());
        tool::execute(&mut sync, &server).unwrap();
        server.finish().unwrap();
    }

    #[test]
    fn test_field_length_mismatch_is_rejected() {
        let comm = LocalCluster::communicators(2).remove(0);
        let (ctx, _device) = Context::with_cpu_device(false);
        let server = CalcServer::from_parts(ctx, Some(Arc::new(comm)));

        let vars = server.variables();
        vars.register("N", "unsigned int", "", "4").unwrap();
        vars.register("mask", "unsigned int*", "N", "").unwrap();
        vars.register("f", "float*", "N * 2", "").unwrap();

        let mut sync = MpiSync::new("sync", "mask", &["f"], &[], false);
        assert!(matches!(sync.setup(&server), Err(Error::InvalidVariableLength { .. })));
    }

    #[test]
    fn test_mask_must_be_uint_array() {
        let comm = LocalCluster::communicators(2).remove(0);
        let (ctx, _device) = Context::with_cpu_device(false);
        let server = CalcServer::from_parts(ctx, Some(Arc::new(comm)));

        let vars = server.variables();
        vars.register("N", "unsigned int", "", "4").unwrap();
        vars.register("mask", "float*", "N", "").unwrap();
        vars.register("f", "float*", "N", "").unwrap();

        let mut sync = MpiSync::new("sync", "mask", &["f"], &[], false);
        assert!(matches!(sync.setup(&server), Err(Error::InvalidVariableType { .. })));
    }
}
