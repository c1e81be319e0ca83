//! Built-in kernels of the CPU reference device
//!
//! These are the device-side routines behind the calculation server's
//! canonical tools: the tree reduction, the link-list trio, the radix
//! sort passes, the permutation gather, and the multi-process mask
//! kernels. Entry names and argument orders are fixed contracts; the
//! element type, the reduction operator, and the identity value arrive
//! through `-D` definitions exactly as a real device build would inject
//! them.

use crate::driver::{KernelCall, RoutineTable};
use crate::error::{BackendError, Result};
use crate::memory::MemoryManager;
use rayon::prelude::*;

/// Element kind of a kernel type definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elem {
    I32,
    U32,
    F32,
}

/// Resolve a textual type designator into (element kind, components).
///
/// Accepts `int`, `unsigned int`, `uint`, `float`, the counted vector
/// forms (`vec2`..`vec4`, `ivec2`.., `uivec2`.., `int2`..), and the
/// platform-default `vec`/`ivec`/`uivec` (2 components in 2D, 4 in 3D).
/// A trailing `*` (array designator) is ignored.
pub fn parse_elem(designator: &str, three_d: bool) -> Option<(Elem, usize)> {
    let t = designator.trim().trim_end_matches('*').trim();
    let t = if t == "unsigned int" { "uint" } else { t };

    let (base, suffix) = match t.as_bytes().last() {
        Some(b'2') => (&t[..t.len() - 1], 2),
        Some(b'3') => (&t[..t.len() - 1], 3),
        Some(b'4') => (&t[..t.len() - 1], 4),
        _ => (t, 0),
    };

    let default_n = if three_d { 4 } else { 2 };
    let (elem, comps) = match base {
        "int" => (Elem::I32, if suffix == 0 { 1 } else { suffix }),
        "uint" => (Elem::U32, if suffix == 0 { 1 } else { suffix }),
        "float" => (Elem::F32, if suffix == 0 { 1 } else { suffix }),
        "ivec" => (Elem::I32, if suffix == 0 { default_n } else { suffix }),
        "uivec" => (Elem::U32, if suffix == 0 { default_n } else { suffix }),
        "vec" => (Elem::F32, if suffix == 0 { default_n } else { suffix }),
        _ => return None,
    };
    Some((elem, comps))
}

#[inline]
fn get_u32(bytes: &[u8], index: usize) -> u32 {
    let o = index * 4;
    u32::from_ne_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
}

#[inline]
fn put_u32(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
fn get_f32(bytes: &[u8], index: usize) -> f32 {
    let o = index * 4;
    f32::from_ne_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
}

#[inline]
fn get_comp(elem: Elem, bytes: &[u8], index: usize) -> f64 {
    match elem {
        Elem::I32 => get_u32(bytes, index) as i32 as f64,
        Elem::U32 => get_u32(bytes, index) as f64,
        Elem::F32 => get_f32(bytes, index) as f64,
    }
}

#[inline]
fn put_comp(elem: Elem, bytes: &mut [u8], index: usize, value: f64) {
    let raw = match elem {
        Elem::I32 => (value as i32) as u32,
        Elem::U32 => value as u32,
        Elem::F32 => (value as f32).to_bits(),
    };
    put_u32(bytes, index, raw);
}

fn ensure_len(entry: &str, what: &str, bytes: usize, needed: usize) -> Result<()> {
    if bytes < needed {
        return Err(BackendError::execution(format!(
            "\"{entry}\": {what} holds {bytes} bytes, {needed} required"
        )));
    }
    Ok(())
}

/// Install every built-in routine into a table
pub(crate) fn install(table: &RoutineTable) {
    table.register(
        "reduction",
        &["input", "output", "n", "scratch"],
        reduction,
    );
    table.register(
        "iCell",
        &["icell", "r", "N", "n_radix", "r_min", "support", "h", "n_cells"],
        icell,
    );
    table.register("iHoc", &["ihoc", "N", "n_cells"], ihoc);
    table.register("linkList", &["icell", "ihoc", "N"], link_list);
    table.register("radix_init", &["perm", "n"], radix_init);
    table.register("radix_histogram", &["keys", "hist", "n", "shift"], radix_histogram);
    table.register("radix_scan", &["hist", "n"], radix_scan);
    table.register(
        "radix_reorder",
        &["keys_in", "keys_out", "perm_in", "perm_out", "hist", "n", "shift"],
        radix_reorder,
    );
    table.register("radix_inverse", &["perm", "inv_perm", "n"], radix_inverse);
    table.register("unsort", &["input", "output", "perm", "n"], unsort);
    table.register("n_offset_mask", &["mask", "submask", "proc", "n"], submask);
    table.register("n_send_mask", &["mask", "submask", "proc", "n"], submask);
    table.register("set_mask", &["mask", "proc", "offset", "n"], set_mask);
    table.register("fill", &["dst", "value", "n"], fill);
}

// ================================================================================================
// Reduction
// ================================================================================================

#[derive(Debug, Clone, Copy)]
enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
}

impl ReduceOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Add => a + b,
            ReduceOp::Mul => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

fn parse_operation(entry: &str, text: &str) -> Result<ReduceOp> {
    let squished: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match squished.trim_end_matches(';') {
        "c=a+b" => Ok(ReduceOp::Add),
        "c=a*b" => Ok(ReduceOp::Mul),
        "c=min(a,b)" => Ok(ReduceOp::Min),
        "c=max(a,b)" => Ok(ReduceOp::Max),
        other => Err(BackendError::BuildFailure {
            entry: entry.to_string(),
            reason: format!("unsupported reduction operation \"{other}\""),
        }),
    }
}

fn parse_identity(entry: &str, text: &str) -> Result<f64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, trimmed),
    };
    let magnitude = match body {
        "INFINITY" | "VEC_INFINITY" | "HUGE_VAL" => f64::INFINITY,
        other => other
            .trim_end_matches(|c| c == 'f' || c == 'u')
            .parse::<f64>()
            .map_err(|_| BackendError::BuildFailure {
                entry: entry.to_string(),
                reason: format!("unparseable identity value \"{other}\""),
            })?,
    };
    Ok(if negative { -magnitude } else { magnitude })
}

/// `reduction(input, output, n, scratch)`: one pass of the tree
/// reduction: work group `g` folds `input[g*local .. g*local+local)` into
/// `output[g]`, padding the tail with the identity.
fn reduction(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let input = call.buffer(0)?;
    let output = call.buffer(1)?;
    let n = call.pod::<u32>(2)? as usize;

    let (elem, comps) = parse_elem(call.require_define("T")?, call.options.three_d())
        .ok_or_else(|| BackendError::execution(format!("\"{}\": bad T definition", call.entry)))?;
    let op = parse_operation(call.entry, call.require_define("OPERATION")?)?;
    let identity = parse_identity(call.entry, call.require_define("IDENTITY")?)?;

    let local = call.range.local;
    let groups = call.range.groups();
    let esize = comps * 4;

    let src = mem.to_vec(input)?;
    ensure_len(call.entry, "input", src.len(), n * esize)?;
    let dst = mem.bytes_mut(output)?;
    ensure_len(call.entry, "output", dst.len(), groups * esize)?;

    for g in 0..groups {
        for c in 0..comps {
            let mut acc = identity;
            for l in 0..local {
                let i = g * local + l;
                if i < n {
                    acc = op.apply(acc, get_comp(elem, &src, i * comps + c));
                }
            }
            put_comp(elem, dst, g * comps + c, acc);
        }
    }
    Ok(())
}

// ================================================================================================
// Link-list
// ================================================================================================

/// `iCell(icell, r, N, n_radix, r_min, support, h, n_cells)`: bucket
/// every particle into its cell; work items past `N` get the cell
/// sentinel `n_cells.total` so padding sorts after every real cell.
fn icell(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let icell_buf = call.buffer(0)?;
    let r_buf = call.buffer(1)?;
    let n = call.pod::<u32>(2)? as usize;
    let n_radix = call.pod::<u32>(3)? as usize;
    let r_min = call.bytes(4)?.to_vec();
    let support = call.pod::<f32>(5)?;
    let h = call.pod::<f32>(6)?;
    let n_cells: [u32; 4] = call.pod(7)?;

    let three_d = call.options.three_d();
    let comps = call.options.vec_components();
    let edge = support * h;
    if edge <= 0.0 {
        return Err(BackendError::execution(format!(
            "\"{}\": zero cell edge (support*h)",
            call.entry
        )));
    }
    ensure_len(call.entry, "r_min", r_min.len(), comps * 4)?;

    let min_x = get_f32(&r_min, 0);
    let min_y = get_f32(&r_min, 1);
    let min_z = if three_d { get_f32(&r_min, 2) } else { 0.0 };

    let r = mem.to_vec(r_buf)?;
    ensure_len(call.entry, "r", r.len(), n * comps * 4)?;
    let out = mem.bytes_mut(icell_buf)?;
    ensure_len(call.entry, "icell", out.len(), n_radix * 4)?;

    out[..n_radix * 4]
        .par_chunks_mut(4)
        .enumerate()
        .for_each(|(i, slot)| {
            let cell = if i < n {
                let cx = (((get_f32(&r, i * comps) - min_x) / edge) as u32 + 3).min(n_cells[0] - 1);
                let cy = (((get_f32(&r, i * comps + 1) - min_y) / edge) as u32 + 3).min(n_cells[1] - 1);
                let cz = if three_d {
                    (((get_f32(&r, i * comps + 2) - min_z) / edge) as u32 + 3).min(n_cells[2] - 1)
                } else {
                    0
                };
                cx + cy * n_cells[0] + cz * n_cells[0] * n_cells[1]
            } else {
                n_cells[3]
            };
            slot.copy_from_slice(&cell.to_ne_bytes());
        });
    Ok(())
}

/// `iHoc(ihoc, N, n_cells)`: reset every head-of-cell entry to the
/// sentinel `N` (empty cell).
fn ihoc(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let ihoc_buf = call.buffer(0)?;
    let n = call.pod::<u32>(1)?;
    let n_cells: [u32; 4] = call.pod(2)?;

    let w = n_cells[3] as usize;
    let out = mem.bytes_mut(ihoc_buf)?;
    ensure_len(call.entry, "ihoc", out.len(), w * 4)?;
    for c in 0..w {
        put_u32(out, c, n);
    }
    Ok(())
}

/// `linkList(icell, ihoc, N)`: walk the sorted cell array and record
/// the first sorted index of each cell.
fn link_list(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let icell_buf = call.buffer(0)?;
    let ihoc_buf = call.buffer(1)?;
    let n = call.pod::<u32>(2)? as usize;

    let icell = mem.to_vec(icell_buf)?;
    ensure_len(call.entry, "icell", icell.len(), n * 4)?;
    let out = mem.bytes_mut(ihoc_buf)?;
    let cells = out.len() / 4;

    for i in 0..n {
        let c = get_u32(&icell, i) as usize;
        if c >= cells {
            continue;
        }
        if i == 0 || get_u32(&icell, i - 1) != c as u32 {
            put_u32(out, c, i as u32);
        }
    }
    Ok(())
}

// ================================================================================================
// Radix sort passes
// ================================================================================================

const RADIX_BUCKETS: usize = 16;

/// `radix_init(perm, n)`: identity permutation.
fn radix_init(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let perm = call.buffer(0)?;
    let n = call.pod::<u32>(1)? as usize;

    let out = mem.bytes_mut(perm)?;
    ensure_len(call.entry, "perm", out.len(), n * 4)?;
    for i in 0..n {
        put_u32(out, i, i as u32);
    }
    Ok(())
}

/// `radix_histogram(keys, hist, n, shift)`: bucket counts for one digit.
fn radix_histogram(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let keys = call.buffer(0)?;
    let hist = call.buffer(1)?;
    let n = call.pod::<u32>(2)? as usize;
    let shift = call.pod::<u32>(3)?;

    let src = mem.to_vec(keys)?;
    ensure_len(call.entry, "keys", src.len(), n * 4)?;
    let out = mem.bytes_mut(hist)?;
    ensure_len(call.entry, "hist", out.len(), RADIX_BUCKETS * 4)?;

    let mut counts = [0u32; RADIX_BUCKETS];
    for i in 0..n {
        let digit = ((get_u32(&src, i) >> shift) & 0xF) as usize;
        counts[digit] += 1;
    }
    for (bucket, count) in counts.iter().enumerate() {
        put_u32(out, bucket, *count);
    }
    Ok(())
}

/// `radix_scan(hist, n)`: exclusive prefix sum, in place.
fn radix_scan(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let hist = call.buffer(0)?;
    let n = call.pod::<u32>(1)? as usize;

    let out = mem.bytes_mut(hist)?;
    ensure_len(call.entry, "hist", out.len(), n * 4)?;
    let mut running = 0u32;
    for i in 0..n {
        let count = get_u32(out, i);
        put_u32(out, i, running);
        running += count;
    }
    Ok(())
}

/// `radix_reorder(keys_in, keys_out, perm_in, perm_out, hist, n, shift)`:
/// stable scatter of one counting-sort pass.
fn radix_reorder(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let keys_in = call.buffer(0)?;
    let keys_out = call.buffer(1)?;
    let perm_in = call.buffer(2)?;
    let perm_out = call.buffer(3)?;
    let hist = call.buffer(4)?;
    let n = call.pod::<u32>(5)? as usize;
    let shift = call.pod::<u32>(6)?;

    let keys = mem.to_vec(keys_in)?;
    let perm = mem.to_vec(perm_in)?;
    ensure_len(call.entry, "keys", keys.len(), n * 4)?;
    ensure_len(call.entry, "perm", perm.len(), n * 4)?;

    let mut offsets = [0u32; RADIX_BUCKETS];
    {
        let scanned = mem.bytes(hist)?;
        ensure_len(call.entry, "hist", scanned.len(), RADIX_BUCKETS * 4)?;
        for (bucket, offset) in offsets.iter_mut().enumerate() {
            *offset = get_u32(scanned, bucket);
        }
    }

    let mut out_keys = vec![0u8; n * 4];
    let mut out_perm = vec![0u8; n * 4];
    for i in 0..n {
        let key = get_u32(&keys, i);
        let digit = ((key >> shift) & 0xF) as usize;
        let pos = offsets[digit] as usize;
        offsets[digit] += 1;
        put_u32(&mut out_keys, pos, key);
        put_u32(&mut out_perm, pos, get_u32(&perm, i));
    }
    mem.write(keys_out, 0, &out_keys)?;
    mem.write(perm_out, 0, &out_perm)?;
    Ok(())
}

/// `radix_inverse(perm, inv_perm, n)`: invert a permutation.
fn radix_inverse(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let perm_buf = call.buffer(0)?;
    let inv_buf = call.buffer(1)?;
    let n = call.pod::<u32>(2)? as usize;

    let perm = mem.to_vec(perm_buf)?;
    ensure_len(call.entry, "perm", perm.len(), n * 4)?;
    let out = mem.bytes_mut(inv_buf)?;
    ensure_len(call.entry, "inv_perm", out.len(), n * 4)?;

    for i in 0..n {
        let j = get_u32(&perm, i) as usize;
        if j < n {
            put_u32(out, j, i as u32);
        }
    }
    Ok(())
}

/// `unsort(input, output, perm, n)`: gather `output[i] = input[perm[i]]`
/// without touching the source. Element size comes from the `T` build
/// definition.
fn unsort(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let input = call.buffer(0)?;
    let output = call.buffer(1)?;
    let perm_buf = call.buffer(2)?;
    let n = call.pod::<u32>(3)? as usize;

    let (_, comps) = parse_elem(call.require_define("T")?, call.options.three_d())
        .ok_or_else(|| BackendError::execution(format!("\"{}\": bad T definition", call.entry)))?;
    let esize = comps * 4;

    let src = mem.to_vec(input)?;
    let perm = mem.to_vec(perm_buf)?;
    ensure_len(call.entry, "input", src.len(), n * esize)?;
    ensure_len(call.entry, "perm", perm.len(), n * 4)?;
    let dst = mem.bytes_mut(output)?;
    ensure_len(call.entry, "output", dst.len(), n * esize)?;

    dst[..n * esize]
        .par_chunks_mut(esize)
        .enumerate()
        .for_each(|(i, slot)| {
            let j = get_u32(&perm, i) as usize;
            if j < n {
                slot.copy_from_slice(&src[j * esize..(j + 1) * esize]);
            }
        });
    Ok(())
}

// ================================================================================================
// Multi-process sync
// ================================================================================================

/// `n_offset_mask` / `n_send_mask` `(mask, submask, proc, n)`: one
/// mask-to-0/1 routine behind both entry points; the predicate is
/// selected by the launched entry name (`< proc` vs `== proc`).
fn submask(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let mask_buf = call.buffer(0)?;
    let submask_buf = call.buffer(1)?;
    let proc = call.pod::<u32>(2)?;
    let n = call.pod::<u32>(3)? as usize;

    let offset_predicate = call.entry == "n_offset_mask";

    let mask = mem.to_vec(mask_buf)?;
    ensure_len(call.entry, "mask", mask.len(), n * 4)?;
    let out = mem.bytes_mut(submask_buf)?;
    ensure_len(call.entry, "submask", out.len(), n * 4)?;

    for i in 0..n {
        let value = get_u32(&mask, i);
        let hit = if offset_predicate { value < proc } else { value == proc };
        put_u32(out, i, hit as u32);
    }
    Ok(())
}

/// `set_mask(mask, proc, offset, n)`: stamp `proc` over a slice of the
/// ownership mask.
fn set_mask(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let mask_buf = call.buffer(0)?;
    let proc = call.pod::<u32>(1)?;
    let offset = call.pod::<u32>(2)? as usize;
    let n = call.pod::<u32>(3)? as usize;

    let out = mem.bytes_mut(mask_buf)?;
    ensure_len(call.entry, "mask", out.len(), (offset + n) * 4)?;
    for i in 0..n {
        put_u32(out, offset + i, proc);
    }
    Ok(())
}

/// `fill(dst, value, n)`: set every element to a scalar value; the
/// element footprint is the scalar argument's byte length.
fn fill(mem: &mut MemoryManager, call: &KernelCall<'_>) -> Result<()> {
    let dst_buf = call.buffer(0)?;
    let value = call.bytes(1)?.to_vec();
    let n = call.pod::<u32>(2)? as usize;

    let esize = value.len();
    if esize == 0 {
        return Err(BackendError::execution(format!("\"{}\": empty fill value", call.entry)));
    }
    let dst = mem.bytes_mut(dst_buf)?;
    ensure_len(call.entry, "dst", dst.len(), n * esize)?;
    for chunk in dst[..n * esize].chunks_mut(esize) {
        chunk.copy_from_slice(&value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::BuildOptions;
    use crate::types::{ArgValue, NdRange};

    fn call<'a>(
        entry: &'a str,
        args: &'a [ArgValue],
        options: &'a BuildOptions,
        global: usize,
        local: usize,
    ) -> KernelCall<'a> {
        KernelCall {
            entry,
            args,
            options,
            range: NdRange::new(global, local).unwrap(),
        }
    }

    fn upload_u32(mem: &mut MemoryManager, values: &[u32]) -> crate::types::BufferHandle {
        let handle = mem.allocate(values.len() * 4).unwrap();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        mem.write(handle, 0, &bytes).unwrap();
        handle
    }

    fn download_u32(mem: &MemoryManager, handle: crate::types::BufferHandle, n: usize) -> Vec<u32> {
        let bytes = mem.to_vec(handle).unwrap();
        (0..n).map(|i| get_u32(&bytes, i)).collect()
    }

    #[test]
    fn test_parse_elem() {
        assert_eq!(parse_elem("float", false), Some((Elem::F32, 1)));
        assert_eq!(parse_elem("unsigned int*", false), Some((Elem::U32, 1)));
        assert_eq!(parse_elem("vec", false), Some((Elem::F32, 2)));
        assert_eq!(parse_elem("vec", true), Some((Elem::F32, 4)));
        assert_eq!(parse_elem("uivec4", false), Some((Elem::U32, 4)));
        assert_eq!(parse_elem("ivec3", false), Some((Elem::I32, 3)));
        assert_eq!(parse_elem("double", false), None);
    }

    #[test]
    fn test_reduction_pass_sums_groups() {
        let mut mem = MemoryManager::new();
        let input = upload_u32(&mut mem, &[1, 2, 3, 4, 5]);
        let output = mem.allocate(2 * 4).unwrap();

        let options = BuildOptions::new(false)
            .define("T", "unsigned int")
            .define("OPERATION", "c = a + b;")
            .define("IDENTITY", "0");
        let args = [
            ArgValue::Buffer(input),
            ArgValue::Buffer(output),
            ArgValue::scalar(5u32),
            ArgValue::Local(4 * 4),
        ];
        reduction(&mut mem, &call("reduction", &args, &options, 8, 4)).unwrap();

        assert_eq!(download_u32(&mem, output, 2), vec![10, 5]);
    }

    #[test]
    fn test_reduction_max_with_negative_identity() {
        let mut mem = MemoryManager::new();
        let input = mem.allocate(4 * 4).unwrap();
        let bytes: Vec<u8> = [-3.0f32, 7.5, -1.0, 2.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        mem.write(input, 0, &bytes).unwrap();
        let output = mem.allocate(4).unwrap();

        let options = BuildOptions::new(false)
            .define("T", "float")
            .define("OPERATION", "c = max(a, b);")
            .define("IDENTITY", "-INFINITY");
        let args = [
            ArgValue::Buffer(input),
            ArgValue::Buffer(output),
            ArgValue::scalar(4u32),
            ArgValue::Local(8 * 4),
        ];
        reduction(&mut mem, &call("reduction", &args, &options, 8, 8)).unwrap();

        let result = f32::from_bits(download_u32(&mem, output, 1)[0]);
        assert_eq!(result, 7.5);
    }

    #[test]
    fn test_radix_pass_chain_sorts() {
        let mut mem = MemoryManager::new();
        let keys: Vec<u32> = vec![5, 5, 2, 5, 2];
        let n = keys.len();
        let keys_a = upload_u32(&mut mem, &keys);
        let keys_b = mem.allocate(n * 4).unwrap();
        let perm_a = mem.allocate(n * 4).unwrap();
        let perm_b = mem.allocate(n * 4).unwrap();
        let hist = mem.allocate(RADIX_BUCKETS * 4).unwrap();
        let inv = mem.allocate(n * 4).unwrap();

        let options = BuildOptions::new(false);
        let init_args = [ArgValue::Buffer(perm_a), ArgValue::scalar(n as u32)];
        radix_init(&mut mem, &call("radix_init", &init_args, &options, n, 1)).unwrap();

        let (mut src_k, mut dst_k) = (keys_a, keys_b);
        let (mut src_p, mut dst_p) = (perm_a, perm_b);
        for pass in 0..8 {
            let shift = pass * 4;
            let hist_args = [
                ArgValue::Buffer(src_k),
                ArgValue::Buffer(hist),
                ArgValue::scalar(n as u32),
                ArgValue::scalar(shift),
            ];
            radix_histogram(&mut mem, &call("radix_histogram", &hist_args, &options, n, 1)).unwrap();
            let scan_args = [ArgValue::Buffer(hist), ArgValue::scalar(RADIX_BUCKETS as u32)];
            radix_scan(&mut mem, &call("radix_scan", &scan_args, &options, RADIX_BUCKETS, 1)).unwrap();
            let reorder_args = [
                ArgValue::Buffer(src_k),
                ArgValue::Buffer(dst_k),
                ArgValue::Buffer(src_p),
                ArgValue::Buffer(dst_p),
                ArgValue::Buffer(hist),
                ArgValue::scalar(n as u32),
                ArgValue::scalar(shift),
            ];
            radix_reorder(&mut mem, &call("radix_reorder", &reorder_args, &options, n, 1)).unwrap();
            std::mem::swap(&mut src_k, &mut dst_k);
            std::mem::swap(&mut src_p, &mut dst_p);
        }

        assert_eq!(download_u32(&mem, src_k, n), vec![2, 2, 5, 5, 5]);
        let perm = download_u32(&mem, src_p, n);
        // Sorted keys reproduce the originals through the permutation.
        for (i, &j) in perm.iter().enumerate() {
            assert_eq!(download_u32(&mem, src_k, n)[i], keys[j as usize]);
        }

        let inv_args = [
            ArgValue::Buffer(src_p),
            ArgValue::Buffer(inv),
            ArgValue::scalar(n as u32),
        ];
        radix_inverse(&mut mem, &call("radix_inverse", &inv_args, &options, n, 1)).unwrap();
        let inverse = download_u32(&mem, inv, n);
        for (i, &j) in perm.iter().enumerate() {
            assert_eq!(inverse[j as usize], i as u32);
        }
    }

    #[test]
    fn test_ihoc_then_link_list_builds_heads() {
        let mut mem = MemoryManager::new();
        let sorted_cells = upload_u32(&mut mem, &[2, 2, 5, 5, 5]);
        let ihoc_buf = mem.allocate(8 * 4).unwrap();
        let options = BuildOptions::new(false);

        let n_cells = [8u32, 1, 1, 8];
        let ihoc_args = [
            ArgValue::Buffer(ihoc_buf),
            ArgValue::scalar(5u32),
            ArgValue::scalar(n_cells),
        ];
        ihoc(&mut mem, &call("iHoc", &ihoc_args, &options, 8, 1)).unwrap();

        let ll_args = [
            ArgValue::Buffer(sorted_cells),
            ArgValue::Buffer(ihoc_buf),
            ArgValue::scalar(5u32),
        ];
        link_list(&mut mem, &call("linkList", &ll_args, &options, 5, 1)).unwrap();

        let heads = download_u32(&mem, ihoc_buf, 8);
        assert_eq!(heads[2], 0);
        assert_eq!(heads[5], 2);
        for (cell, head) in heads.iter().enumerate() {
            if cell != 2 && cell != 5 {
                assert_eq!(*head, 5, "cell {cell} should stay at the sentinel");
            }
        }
    }

    #[test]
    fn test_submask_predicates() {
        let mut mem = MemoryManager::new();
        let mask = upload_u32(&mut mem, &[0, 1, 0, 1, 2]);
        let submask_buf = mem.allocate(5 * 4).unwrap();
        let options = BuildOptions::new(false);
        let args = [
            ArgValue::Buffer(mask),
            ArgValue::Buffer(submask_buf),
            ArgValue::scalar(1u32),
            ArgValue::scalar(5u32),
        ];

        submask(&mut mem, &call("n_offset_mask", &args, &options, 5, 1)).unwrap();
        assert_eq!(download_u32(&mem, submask_buf, 5), vec![1, 0, 1, 0, 0]);

        submask(&mut mem, &call("n_send_mask", &args, &options, 5, 1)).unwrap();
        assert_eq!(download_u32(&mem, submask_buf, 5), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_unsort_gathers_by_permutation() {
        let mut mem = MemoryManager::new();
        let data = upload_u32(&mut mem, &[10, 20, 30, 40]);
        let perm = upload_u32(&mut mem, &[2, 0, 3, 1]);
        let out = mem.allocate(4 * 4).unwrap();
        let options = BuildOptions::new(false).define("T", "unsigned int");
        let args = [
            ArgValue::Buffer(data),
            ArgValue::Buffer(out),
            ArgValue::Buffer(perm),
            ArgValue::scalar(4u32),
        ];
        unsort(&mut mem, &call("unsort", &args, &options, 4, 1)).unwrap();
        assert_eq!(download_u32(&mem, out, 4), vec![30, 10, 40, 20]);
    }

    #[test]
    fn test_fill_and_set_mask() {
        let mut mem = MemoryManager::new();
        let mask = upload_u32(&mut mem, &[9, 9, 9, 9]);
        let options = BuildOptions::new(false);

        let fill_args = [
            ArgValue::Buffer(mask),
            ArgValue::scalar(1u32),
            ArgValue::scalar(4u32),
        ];
        fill(&mut mem, &call("fill", &fill_args, &options, 4, 1)).unwrap();
        assert_eq!(download_u32(&mem, mask, 4), vec![1, 1, 1, 1]);

        let stamp_args = [
            ArgValue::Buffer(mask),
            ArgValue::scalar(7u32),
            ArgValue::scalar(1u32),
            ArgValue::scalar(2u32),
        ];
        set_mask(&mut mem, &call("set_mask", &stamp_args, &options, 2, 1)).unwrap();
        assert_eq!(download_u32(&mem, mask, 4), vec![1, 7, 7, 1]);
    }
}
