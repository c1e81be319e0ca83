//! Radix sort over an integer key array
//!
//! LSD radix sort (4-bit digits, histogram → exclusive scan → stable
//! reorder, ping-pong buffers) that sorts the key variable in place
//! while producing two permutations: `perm` maps each sorted slot to the
//! original index, `inv_perm` is its inverse. Relative order within
//! equal keys is not part of the contract.

use crate::error::{Error, Result};
use crate::server::CalcServer;
use crate::tool::{Tool, ToolMeta};
use crate::variables::Variable;
use riptide_backends::{ArgValue, BufferHandle, Device, Event, Kernel, NdRange};
use std::sync::Arc;

const RADIX_BITS: u32 = 4;
const RADIX_BUCKETS: usize = 1 << RADIX_BITS;
const KEY_BITS: u32 = 32;

const RADIX_SRC: &str = r#"
/* histogram / scan / reorder passes over RADIX_BITS-wide digits */
__kernel void radix_init(__global unsigned int* perm, unsigned int n);
__kernel void radix_histogram(__global const unsigned int* keys,
                              __global unsigned int* hist,
                              unsigned int n,
                              unsigned int shift);
__kernel void radix_scan(__global unsigned int* hist, unsigned int n);
__kernel void radix_reorder(__global const unsigned int* keys_in,
                            __global unsigned int* keys_out,
                            __global const unsigned int* perm_in,
                            __global unsigned int* perm_out,
                            __global const unsigned int* hist,
                            unsigned int n,
                            unsigned int shift);
__kernel void radix_inverse(__global const unsigned int* perm,
                            __global unsigned int* inv_perm,
                            unsigned int n);
"#;

struct Kernels {
    init: Kernel,
    histogram: Kernel,
    scan: Kernel,
    reorder: Kernel,
    inverse: Kernel,
}

/// Sort a `unsigned int*` key variable, maintaining permutations
pub struct RadixSort {
    meta: ToolMeta,
    keys_name: String,
    perm_name: String,
    inv_perm_name: String,
    keys: Option<Arc<Variable>>,
    perm: Option<Arc<Variable>>,
    inv_perm: Option<Arc<Variable>>,
    kernels: Option<Kernels>,
    keys_tmp: Option<BufferHandle>,
    perm_tmp: Option<BufferHandle>,
    hist: Option<BufferHandle>,
    local_size: usize,
}

impl RadixSort {
    /// Sort `keys_name` in place; `perm_name` receives sorted→original,
    /// `inv_perm_name` original→sorted
    pub fn new(name: &str, keys_name: &str, perm_name: &str, inv_perm_name: &str) -> Self {
        Self {
            meta: ToolMeta::new(name, false),
            keys_name: keys_name.to_string(),
            perm_name: perm_name.to_string(),
            inv_perm_name: inv_perm_name.to_string(),
            keys: None,
            perm: None,
            inv_perm: None,
            kernels: None,
            keys_tmp: None,
            perm_tmp: None,
            hist: None,
            local_size: 1,
        }
    }

    /// Resolve a permutation variable, registering it when absent
    fn permutation(server: &Arc<CalcServer>, name: &str, len: usize) -> Result<Arc<Variable>> {
        let vars = server.variables();
        match vars.get(name) {
            Some(variable) => {
                if variable.len()? != len {
                    return Err(Error::InvalidVariableLength {
                        name: name.to_string(),
                        expected: len,
                        found: variable.len()?,
                    });
                }
                Ok(variable)
            }
            None => vars.register(name, "unsigned int*", &len.to_string(), ""),
        }
    }
}

impl Tool for RadixSort {
    fn meta(&self) -> &ToolMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ToolMeta {
        &mut self.meta
    }

    fn setup(&mut self, server: &Arc<CalcServer>) -> Result<()> {
        let ctx = server.context();
        let vars = server.variables();

        let keys = vars.require(&self.keys_name)?;
        let expected = crate::scalar::VarType::parse("unsigned int*", vars.dims())?;
        if keys.var_type() != expected {
            return Err(Error::bad_var_type(&self.keys_name, "unsigned int*", keys.var_type()));
        }
        let n = keys.len()?;

        let perm = Self::permutation(server, &self.perm_name, n)?;
        let inv_perm = Self::permutation(server, &self.inv_perm_name, n)?;

        let keys_tmp = ctx.device().allocate_buffer(n * 4)?;
        let perm_tmp = ctx.device().allocate_buffer(n * 4)?;
        let hist = ctx.device().allocate_buffer(RADIX_BUCKETS * 4)?;
        self.meta.add_allocated(2 * n * 4 + RADIX_BUCKETS * 4);

        let options = ctx.build_options().define("RADIX_BITS", RADIX_BITS.to_string());
        let kernels = Kernels {
            init: ctx.compile_kernel(RADIX_SRC, "radix_init", options.clone())?,
            histogram: ctx.compile_kernel(RADIX_SRC, "radix_histogram", options.clone())?,
            scan: ctx.compile_kernel(RADIX_SRC, "radix_scan", options.clone())?,
            reorder: ctx.compile_kernel(RADIX_SRC, "radix_reorder", options.clone())?,
            inverse: ctx.compile_kernel(RADIX_SRC, "radix_inverse", options)?,
        };
        self.local_size = kernels.init.max_work_group_size();

        self.meta
            .set_dependencies(Vec::new(), vec![keys.clone(), perm.clone(), inv_perm.clone()]);
        self.keys = Some(keys);
        self.perm = Some(perm);
        self.inv_perm = Some(inv_perm);
        self.kernels = Some(kernels);
        self.keys_tmp = Some(keys_tmp);
        self.perm_tmp = Some(perm_tmp);
        self.hist = Some(hist);
        Ok(())
    }

    fn launch(&mut self, server: &Arc<CalcServer>, wait: &[Event]) -> Result<Option<Event>> {
        let queue = server.context().queue();
        let keys = self.keys.clone().ok_or_else(|| Error::InvalidVariable(self.keys_name.clone()))?;
        let perm = self.perm.clone().ok_or_else(|| Error::InvalidVariable(self.perm_name.clone()))?;
        let inv_perm = self
            .inv_perm
            .clone()
            .ok_or_else(|| Error::InvalidVariable(self.inv_perm_name.clone()))?;
        let kernels = self.kernels.as_mut().ok_or_else(|| Error::InvalidVariable(self.keys_name.clone()))?;

        let n = keys.len()?;
        let n_arg = ArgValue::scalar(n as u32);
        let range = NdRange::new(n.max(1), self.local_size)?;
        let bucket_range = NdRange::new(RADIX_BUCKETS, RADIX_BUCKETS)?;

        let keys_buf = keys.buffer()?;
        let perm_buf = perm.buffer()?;
        let keys_tmp = self.keys_tmp.ok_or_else(|| Error::InvalidVariable(self.keys_name.clone()))?;
        let perm_tmp = self.perm_tmp.ok_or_else(|| Error::InvalidVariable(self.perm_name.clone()))?;
        let hist = self.hist.ok_or_else(|| Error::InvalidVariable(self.keys_name.clone()))?;

        // Identity permutation seeds the pass chain.
        kernels.init.set_arg(0, ArgValue::Buffer(perm_buf))?;
        kernels.init.set_arg(1, n_arg.clone())?;
        let mut last = queue.enqueue_kernel(&kernels.init, range, wait)?;

        // Ping-pong passes; KEY_BITS/RADIX_BITS is even, so the sorted
        // keys land back in the key variable's own buffer.
        let (mut src_keys, mut dst_keys) = (keys_buf, keys_tmp);
        let (mut src_perm, mut dst_perm) = (perm_buf, perm_tmp);
        for pass in 0..(KEY_BITS / RADIX_BITS) {
            let shift = ArgValue::scalar(pass * RADIX_BITS);

            kernels.histogram.set_arg(0, ArgValue::Buffer(src_keys))?;
            kernels.histogram.set_arg(1, ArgValue::Buffer(hist))?;
            kernels.histogram.set_arg(2, n_arg.clone())?;
            kernels.histogram.set_arg(3, shift.clone())?;
            let hist_event = queue.enqueue_kernel(&kernels.histogram, range, &[last])?;

            kernels.scan.set_arg(0, ArgValue::Buffer(hist))?;
            kernels.scan.set_arg(1, ArgValue::scalar(RADIX_BUCKETS as u32))?;
            let scan_event = queue.enqueue_kernel(&kernels.scan, bucket_range, &[hist_event])?;

            kernels.reorder.set_arg(0, ArgValue::Buffer(src_keys))?;
            kernels.reorder.set_arg(1, ArgValue::Buffer(dst_keys))?;
            kernels.reorder.set_arg(2, ArgValue::Buffer(src_perm))?;
            kernels.reorder.set_arg(3, ArgValue::Buffer(dst_perm))?;
            kernels.reorder.set_arg(4, ArgValue::Buffer(hist))?;
            kernels.reorder.set_arg(5, n_arg.clone())?;
            kernels.reorder.set_arg(6, shift)?;
            last = queue.enqueue_kernel(&kernels.reorder, range, &[scan_event])?;

            std::mem::swap(&mut src_keys, &mut dst_keys);
            std::mem::swap(&mut src_perm, &mut dst_perm);
        }
        debug_assert_eq!(src_keys, keys_buf);

        kernels.inverse.set_arg(0, ArgValue::Buffer(perm_buf))?;
        kernels.inverse.set_arg(1, ArgValue::Buffer(inv_perm.buffer()?))?;
        kernels.inverse.set_arg(2, n_arg)?;
        let out_event = queue.enqueue_kernel(&kernels.inverse, range, &[last])?;
        Ok(Some(out_event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Settings;
    use crate::tool;

    fn read_u32(device: &riptide_backends::CpuDevice, buffer: BufferHandle, n: usize) -> Vec<u32> {
        let mut bytes = vec![0u8; n * 4];
        device.read_buffer(buffer, 0, &mut bytes).unwrap();
        bytes
            .chunks(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn write_u32(device: &riptide_backends::CpuDevice, buffer: BufferHandle, values: &[u32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        device.write_buffer(buffer, 0, &bytes).unwrap();
    }

    #[test]
    fn test_sort_produces_both_permutations() {
        let (server, device) = CalcServer::new(&Settings::default());
        let vars = server.variables();
        vars.register("n_radix", "unsigned int", "", "8").unwrap();
        vars.register("icell", "unsigned int*", "n_radix", "").unwrap();

        let original: Vec<u32> = vec![5, 1, 4, 1, 3, 9, 2, 6];
        let icell = vars.require("icell").unwrap();
        write_u32(&device, icell.buffer().unwrap(), &original);

        let mut sort = RadixSort::new("sort", "icell", "id_unsorted", "id_sorted");
        sort.setup(&server).unwrap();
        tool::execute(&mut sort, &server).unwrap();
        server.finish().unwrap();

        let sorted = read_u32(&device, icell.buffer().unwrap(), 8);
        assert_eq!(sorted, vec![1, 1, 2, 3, 4, 5, 6, 9]);

        let perm = read_u32(&device, vars.require("id_unsorted").unwrap().buffer().unwrap(), 8);
        let inv = read_u32(&device, vars.require("id_sorted").unwrap().buffer().unwrap(), 8);
        for (slot, &source) in perm.iter().enumerate() {
            assert_eq!(sorted[slot], original[source as usize]);
            assert_eq!(inv[source as usize], slot as u32);
        }

        // The out-event is published on keys and both permutations.
        assert!(icell.writing_event().is_some());
        assert!(vars.require("id_unsorted").unwrap().writing_event().is_some());
        assert!(vars.require("id_sorted").unwrap().writing_event().is_some());
    }

    #[test]
    fn test_sort_handles_large_keys() {
        let (server, device) = CalcServer::new(&Settings::default());
        let vars = server.variables();
        vars.register("n_radix", "unsigned int", "", "6").unwrap();
        vars.register("keys", "unsigned int*", "n_radix", "").unwrap();

        let original = vec![u32::MAX, 0, 0x8000_0000, 7, u32::MAX - 1, 0x7FFF_FFFF];
        let keys = vars.require("keys").unwrap();
        write_u32(&device, keys.buffer().unwrap(), &original);

        let mut sort = RadixSort::new("sort", "keys", "perm", "inv");
        sort.setup(&server).unwrap();
        tool::execute(&mut sort, &server).unwrap();
        server.finish().unwrap();

        let mut expected = original.clone();
        expected.sort_unstable();
        assert_eq!(read_u32(&device, keys.buffer().unwrap(), 6), expected);
    }

    #[test]
    fn test_wrong_key_type_is_rejected() {
        let (server, _device) = CalcServer::new(&Settings::default());
        let vars = server.variables();
        vars.register("n", "unsigned int", "", "4").unwrap();
        vars.register("r", "vec*", "n", "").unwrap();

        let mut sort = RadixSort::new("sort", "r", "perm", "inv");
        assert!(matches!(sort.setup(&server), Err(Error::InvalidVariableType { .. })));
    }
}
